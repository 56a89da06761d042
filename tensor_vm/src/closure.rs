// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Named callables.
//!
//! A [`VmFunction`] is what lives in the function pool and in
//! [`Value::Func`](crate::value::Value::Func): either a directly-callable
//! native kernel, or a [`VmClosure`] whose implementation receives the
//! executing VM as its first parameter. Closures never own the VM; they are
//! handed it at invocation time, which keeps the VM → function pool →
//! closure chain cycle-free.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use crate::kernel::NativeFn;
use crate::value::Value;
use crate::vm::{VirtualMachine, VmError};

/// Implementation of a VM closure.
///
/// The first parameter is the executing VM; the remaining arguments follow
/// the plain positional calling convention.
pub type ClosureImpl = Rc<dyn Fn(&mut VirtualMachine, &[Value]) -> Result<Value, VmError>>;

/// A named callable bound to the VM calling convention.
#[derive(Clone)]
pub struct VmClosure {
    func_name: String,
    impl_: ClosureImpl,
}

impl VmClosure {
    /// Wraps `impl_` under `func_name`.
    #[must_use]
    pub fn new(func_name: impl Into<String>, impl_: ClosureImpl) -> Self {
        Self {
            func_name: func_name.into(),
            impl_,
        }
    }

    /// The closure's name.
    #[must_use]
    pub fn func_name(&self) -> &str {
        &self.func_name
    }

    /// The underlying implementation.
    #[must_use]
    pub fn impl_fn(&self) -> &ClosureImpl {
        &self.impl_
    }

    /// Creates an implementation with `last_args` already bound.
    ///
    /// The returned callable, invoked with M arguments, calls `func` with
    /// the M arguments followed by the bound tail. Binding twice appends
    /// tails in order, so `bind(bind(f, a), b)` receives `args ++ a ++ b`.
    #[must_use]
    pub fn bind_last_args(func: ClosureImpl, last_args: Vec<Value>) -> ClosureImpl {
        Rc::new(move |vm, args| {
            let mut full = Vec::with_capacity(args.len() + last_args.len());
            full.extend_from_slice(args);
            full.extend(last_args.iter().cloned());
            func(vm, &full)
        })
    }

    /// Creates an implementation that invokes `func` for effect only.
    #[must_use]
    pub fn discard_return(func: ClosureImpl) -> ClosureImpl {
        Rc::new(move |vm, args| {
            func(vm, args)?;
            Ok(Value::Null)
        })
    }
}

impl core::fmt::Debug for VmClosure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmClosure")
            .field("func_name", &self.func_name)
            .finish_non_exhaustive()
    }
}

/// A function pool entry: the two callable shapes the VM dispatches.
#[derive(Clone)]
pub enum VmFunction {
    /// A native kernel, called directly with its arguments.
    Native(NativeFn),
    /// A VM closure, handed the executing VM as its first parameter.
    Closure(VmClosure),
}

impl VmFunction {
    /// The callable's name, if it has one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Native(_) => None,
            Self::Closure(c) => Some(c.func_name()),
        }
    }

    /// Returns `true` if both values wrap the same underlying callable.
    #[must_use]
    pub fn same_callable(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Native(a), Self::Native(b)) => Rc::ptr_eq(a, b),
            (Self::Closure(a), Self::Closure(b)) => Rc::ptr_eq(&a.impl_, &b.impl_),
            _ => false,
        }
    }
}

impl core::fmt::Debug for VmFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Native(_) => write!(f, "Native(..)"),
            Self::Closure(c) => write!(f, "Closure({:?})", c.func_name()),
        }
    }
}
