// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `tensor_vm`: a register VM runtime for ahead-of-time compiled tensor
//! programs.
//!
//! The VM interprets a small instruction set (`Call`/`Ret`/`Goto`/`If`)
//! whose Call instructions dispatch into precompiled numeric kernels looked
//! up by name. Beyond whole-program invocation, the crate supports
//! *segmented execution*: the caller splits `main`'s call sequence into
//! ordered pc groups and steps them one at a time over a persistent frame
//! (see [`segment`]).
//!
//! ## Example
//!
//! ```
//! extern crate alloc;
//!
//! use alloc::rc::Rc;
//! use alloc::vec;
//!
//! use tensor_vm::builder::ExecBuilder;
//! use tensor_vm::exec::Arg;
//! use tensor_vm::kernel::{StaticKernelRegistry, native_fn};
//! use tensor_vm::memory::{Allocator, AllocatorKind, MemoryManager};
//! use tensor_vm::value::{DType, Device, Tensor, Value, tensor_byte_size};
//! use tensor_vm::vm::{VirtualMachine, VmError};
//!
//! struct HostAllocator;
//!
//! impl Allocator for HostAllocator {
//!     fn kind(&self) -> AllocatorKind {
//!         AllocatorKind::Naive
//!     }
//!     fn empty(&self, shape: &[i64], dtype: DType, device: Device) -> Tensor {
//!         Tensor::new(
//!             shape.to_vec(),
//!             dtype,
//!             device,
//!             vec![0u8; tensor_byte_size(shape, dtype)],
//!         )
//!     }
//! }
//!
//! struct HostMemory;
//!
//! impl MemoryManager for HostMemory {
//!     fn get_or_create_allocator(&self, _: Device, _: AllocatorKind) -> Rc<dyn Allocator> {
//!         Rc::new(HostAllocator)
//!     }
//! }
//!
//! let mut registry = StaticKernelRegistry::new();
//! registry.register(
//!     "add_scalar",
//!     native_fn(|args| {
//!         let a = args[0].as_i64().unwrap();
//!         let b = args[1].as_i64().unwrap();
//!         Ok(Value::I64(a + b))
//!     }),
//! );
//!
//! let mut b = ExecBuilder::new();
//! let add = b.declare_native("add_scalar", 2);
//! b.begin_function("main", 1, 2, &["x"]);
//! b.emit_call(1, add, &[Arg::Register(0), Arg::Immediate(3)]);
//! b.emit_ret(1);
//! let exec = b.build().unwrap();
//!
//! let mut vm = VirtualMachine::new(Rc::new(HostMemory), Rc::new(registry));
//! vm.load_executable(exec);
//! vm.init(&[(Device::CPU, AllocatorKind::Pooled)])?;
//!
//! let main = vm.executable()?.find_func("main").unwrap();
//! let out = vm.invoke_bytecode(main, &[Value::I64(7)])?;
//! assert_eq!(out, Value::I64(10));
//! # Ok::<(), VmError>(())
//! ```

#![no_std]

extern crate alloc;

pub mod builder;
pub mod closure;
pub mod exec;
pub(crate) mod frame;
pub mod kernel;
pub mod memory;
pub mod segment;
pub mod value;
pub mod vm;
