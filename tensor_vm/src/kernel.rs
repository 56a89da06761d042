// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Native kernel resolution.
//!
//! Precompiled numeric kernels reach the VM two ways: through the kernel
//! libraries imported by an executable, and through an embedder-provided
//! [`KernelRegistry`]. The function pool resolves `Native` entries against
//! imports first, then the registry.
//!
//! The registry must be populated before the VM is initialized; the VM only
//! reads it while building its function pool.

use alloc::rc::Rc;
use alloc::string::String;
use hashbrown::HashMap;

use crate::value::Value;
use crate::vm::{VirtualMachine, VmError};

/// A native kernel: positional arguments in, one value out.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, VmError>>;

/// A generated hybrid dispatch routine.
///
/// Receives the executing VM (which carries the constant and function pools)
/// and the flat register array seeded with the call arguments.
pub type HybridFn = Rc<dyn Fn(&mut VirtualMachine, &mut [Value]) -> Result<(), VmError>>;

/// Name-keyed lookup of native kernels, provided by the embedder.
pub trait KernelRegistry {
    /// Resolves a kernel by name.
    fn get(&self, name: &str) -> Option<NativeFn>;
}

/// A library of kernels attached to an executable as an import.
pub trait KernelLibrary {
    /// Resolves a kernel by name.
    fn get_function(&self, name: &str) -> Option<NativeFn>;

    /// Resolves a hybrid dispatch entry point by its synthesized name.
    fn get_hybrid(&self, _name: &str) -> Option<HybridFn> {
        None
    }
}

/// A registry backed by a plain map. Suitable for embedders and tests.
#[derive(Clone, Default)]
pub struct StaticKernelRegistry {
    kernels: HashMap<String, NativeFn>,
}

impl StaticKernelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `kernel` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, kernel: NativeFn) {
        self.kernels.insert(name.into(), kernel);
    }
}

impl KernelRegistry for StaticKernelRegistry {
    fn get(&self, name: &str) -> Option<NativeFn> {
        self.kernels.get(name).cloned()
    }
}

/// A kernel library backed by plain maps.
#[derive(Clone, Default)]
pub struct StaticKernelLibrary {
    functions: HashMap<String, NativeFn>,
    hybrids: HashMap<String, HybridFn>,
}

impl StaticKernelLibrary {
    /// Creates an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a kernel under `name`.
    pub fn add_function(&mut self, name: impl Into<String>, kernel: NativeFn) {
        self.functions.insert(name.into(), kernel);
    }

    /// Adds a hybrid dispatch routine under its synthesized name.
    pub fn add_hybrid(&mut self, name: impl Into<String>, routine: HybridFn) {
        self.hybrids.insert(name.into(), routine);
    }
}

impl KernelLibrary for StaticKernelLibrary {
    fn get_function(&self, name: &str) -> Option<NativeFn> {
        self.functions.get(name).cloned()
    }

    fn get_hybrid(&self, name: &str) -> Option<HybridFn> {
        self.hybrids.get(name).cloned()
    }
}

/// Wraps a plain closure as a [`NativeFn`].
pub fn native_fn<F>(f: F) -> NativeFn
where
    F: Fn(&[Value]) -> Result<Value, VmError> + 'static,
{
    Rc::new(f)
}
