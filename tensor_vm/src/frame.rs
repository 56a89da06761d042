// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Call-frame records.
//!
//! A frame is owned by the VM's active stack (or, for segmented execution,
//! held as the persistent frame). Frames are pooled: on pop they are cleared
//! and pushed to a free list, and `reset_for_recycle` re-arms a recycled
//! frame for its next activation.

use alloc::vec::Vec;

use crate::value::{RegName, Value};

/// A single function activation.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    /// Program counter to restore when this frame pops.
    pub(crate) return_pc: usize,
    /// Register file, sized by the function's metadata.
    pub(crate) register_file: Vec<Value>,
    /// Register in the caller's frame that receives this frame's return.
    pub(crate) caller_return_register: RegName,
    /// Reusable scratch for assembling outgoing call arguments.
    pub(crate) call_args: Vec<Value>,
}

impl Frame {
    pub(crate) fn new(return_pc: usize, register_file_size: usize) -> Self {
        let mut register_file = Vec::new();
        register_file.resize_with(register_file_size, Value::default);
        Self {
            return_pc,
            register_file,
            caller_return_register: 0,
            call_args: Vec::new(),
        }
    }

    /// Nulls all registers and drops scratch contents, keeping capacity.
    pub(crate) fn clear(&mut self) {
        self.caller_return_register = 0;
        self.call_args.clear();
        for reg in &mut self.register_file {
            *reg = Value::Null;
        }
    }

    /// Re-arms a recycled frame for a new activation.
    pub(crate) fn reset_for_recycle(&mut self, return_pc: usize, register_file_size: usize) {
        self.return_pc = return_pc;
        self.register_file
            .resize_with(register_file_size, Value::default);
    }
}
