// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Read-only view over a compiled tensor program.
//!
//! An [`Executable`] carries the function table, the name map, the constant
//! pool, the imported kernel libraries, and the instruction stream addressed
//! by a monotone program counter. The VM never mutates an executable;
//! construction goes through [`crate::builder::ExecBuilder`].

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::kernel::{HybridFn, KernelLibrary, NativeFn};
use crate::value::{RegName, Value};

/// Function table index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FnIdx(pub u32);

/// Constant pool index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConstIdx(pub u32);

/// How a function table entry executes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FuncKind {
    /// A native kernel resolved by name from imports or the registry.
    Native,
    /// A bytecode function run by the dispatch loop.
    VmBytecode,
    /// A generated dispatch routine run against a flat register array.
    HybridDispatch,
}

/// Function metadata.
#[derive(Clone, Debug)]
pub struct VmFuncInfo {
    /// Function name; also the lookup key for native resolution.
    pub name: String,
    /// Execution kind.
    pub kind: FuncKind,
    /// Declared argument count.
    pub num_args: usize,
    /// Register file size for bytecode and hybrid activations.
    pub register_file_size: usize,
    /// First instruction of a bytecode function.
    pub start_instr: usize,
    /// Declared parameter names (may be empty for kernels).
    pub param_names: Vec<String>,
}

/// One operand of a [`Instruction::Call`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    /// Read a register of the current frame.
    Register(RegName),
    /// A literal integer.
    Immediate(i64),
    /// Index into the constant pool.
    ConstIdx(ConstIdx),
    /// Index into the function pool.
    FuncIdx(FnIdx),
}

/// A decoded instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// Invoke a function-pool entry and store its return value.
    Call {
        /// Destination register in the current frame.
        dst: RegName,
        /// Callee index into the function pool.
        func_idx: FnIdx,
        /// Call operands.
        args: Vec<Arg>,
    },
    /// Return the value held in `result`.
    Ret {
        /// Source register.
        result: RegName,
    },
    /// Unconditional signed pc jump.
    Goto {
        /// Signed delta added to the current pc.
        pc_offset: i64,
    },
    /// Conditional branch: fall through when the condition is non-zero.
    If {
        /// Condition register, read as an integer.
        cond: RegName,
        /// Signed delta taken when the condition is zero; always > 1.
        false_offset: i64,
    },
}

/// A compiled tensor program.
#[derive(Clone)]
pub struct Executable {
    pub(crate) func_table: Vec<VmFuncInfo>,
    pub(crate) func_map: HashMap<String, FnIdx>,
    pub(crate) constants: Vec<Value>,
    pub(crate) imports: Vec<Rc<dyn KernelLibrary>>,
    pub(crate) instructions: Vec<Instruction>,
}

impl Executable {
    /// Looks up a function index by name.
    #[must_use]
    pub fn find_func(&self, name: &str) -> Option<FnIdx> {
        self.func_map.get(name).copied()
    }

    /// Returns the metadata for `idx`, if in range.
    #[must_use]
    pub fn func_at(&self, idx: FnIdx) -> Option<&VmFuncInfo> {
        self.func_table.get(idx.0 as usize)
    }

    /// Number of function table entries.
    #[must_use]
    pub fn num_funcs(&self) -> usize {
        self.func_table.len()
    }

    /// Returns the instruction at `pc`, if in range.
    #[must_use]
    pub fn instruction_at(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    /// Number of instructions in the stream.
    #[must_use]
    pub fn num_instructions(&self) -> usize {
        self.instructions.len()
    }

    /// Returns the constant at `idx`, if in range.
    #[must_use]
    pub fn constant_at(&self, idx: ConstIdx) -> Option<&Value> {
        self.constants.get(idx.0 as usize)
    }

    /// Number of constant pool entries.
    #[must_use]
    pub fn num_constants(&self) -> usize {
        self.constants.len()
    }

    /// Iterates the imported kernel libraries.
    pub fn imports(&self) -> impl Iterator<Item = &Rc<dyn KernelLibrary>> {
        self.imports.iter()
    }

    /// Resolves `name` against the imports, in attachment order.
    #[must_use]
    pub fn func_from_imports(&self, name: &str) -> Option<NativeFn> {
        self.imports.iter().find_map(|lib| lib.get_function(name))
    }

    /// Resolves a hybrid dispatch entry point against the imports.
    #[must_use]
    pub fn hybrid_from_imports(&self, name: &str) -> Option<HybridFn> {
        self.imports.iter().find_map(|lib| lib.get_hybrid(name))
    }
}

impl core::fmt::Debug for Executable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Executable")
            .field("functions", &self.func_table.len())
            .field("constants", &self.constants.len())
            .field("imports", &self.imports.len())
            .field("instructions", &self.instructions.len())
            .finish()
    }
}
