// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Memory-manager seam and device marshalling.
//!
//! The VM does not allocate tensor memory itself. At initialization it asks
//! an embedder-provided [`MemoryManager`] for one [`Allocator`] per device,
//! and at argument boundaries it uses the primary device's allocator to copy
//! values onto that device.
//!
//! External tensors are copied, never aliased; a caller that needs zero-copy
//! must hand the VM a tensor already on the VM's device.

use alloc::rc::Rc;
use alloc::vec::Vec;

use crate::value::{DType, Device, Tensor, Value};
use crate::vm::VmError;

/// Allocation strategy selector for `vm_initialization` triples.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocatorKind {
    /// Allocate and free eagerly.
    Naive,
    /// Keep a reuse pool.
    Pooled,
}

impl AllocatorKind {
    /// Parses the integer encoding used by `vm_initialization` triples.
    #[must_use]
    pub fn from_index(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::Naive),
            2 => Some(Self::Pooled),
            _ => None,
        }
    }

    /// Returns the integer encoding of this kind.
    #[must_use]
    pub fn index(self) -> i64 {
        match self {
            Self::Naive => 1,
            Self::Pooled => 2,
        }
    }
}

/// A per-device tensor allocator.
pub trait Allocator {
    /// The strategy this allocator implements.
    fn kind(&self) -> AllocatorKind;

    /// Allocates an uninitialized dense tensor on `device`.
    fn empty(&self, shape: &[i64], dtype: DType, device: Device) -> Tensor;
}

/// Hands out allocators per `(device, kind)`.
///
/// The returned allocator may be shared with other holders; the VM treats it
/// as thread-compatible and never synchronizes around it.
pub trait MemoryManager {
    /// Returns (or creates) the allocator for `device` with strategy `kind`.
    fn get_or_create_allocator(&self, device: Device, kind: AllocatorKind) -> Rc<dyn Allocator>;
}

/// Copies `value` onto `device` where needed.
///
/// Tensors on another device are re-allocated through `alloc` and copied;
/// arrays convert element-wise; every other kind passes through unchanged.
pub(crate) fn convert_value_to_device(
    value: &Value,
    device: Device,
    alloc: &Rc<dyn Allocator>,
) -> Result<Value, VmError> {
    match value {
        Value::Tensor(t) => {
            if t.device() == device {
                Ok(value.clone())
            } else {
                let dst = alloc.empty(t.shape(), t.dtype(), device);
                dst.copy_from(t)?;
                Ok(Value::Tensor(dst))
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(convert_value_to_device(item, device, alloc)?);
            }
            Ok(Value::array(out))
        }
        other => Ok(other.clone()),
    }
}
