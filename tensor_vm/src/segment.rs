// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Segmented execution of the `main` function.
//!
//! A caller can decompose `main`'s instruction stream into contiguous
//! ordered groups of pc values (segments) and step through them one at a
//! time. Live register state survives between steps in a persistent frame
//! that the VM owns outside the active call stack and never links into the
//! frame free list.
//!
//! The workflow: [`VirtualMachine::segment_get_skeleton`] emits an editable
//! text rendering of the calls a nominal run would execute; the user splits
//! it into segments with `@seg` delimiter lines and feeds it back through
//! [`VirtualMachine::segment_load`]; then
//! [`VirtualMachine::segment_set_input`], repeated
//! [`VirtualMachine::segment_run`] calls, and
//! [`VirtualMachine::segment_get_output`].
//!
//! Segment tables are expected to enumerate linearized Call pcs: the runner
//! overwrites `pc` from the table before every step, so a Goto or If entry
//! only matters for the pc it computes, and the table stops *before* the
//! final `Ret` (after the last segment, `pc` rests on the Ret instruction,
//! which is what `segment_get_output` checks).

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::exec::Instruction;
use crate::frame::Frame;
use crate::memory::convert_value_to_device;
use crate::value::{RegName, Value};
use crate::vm::{FrameSlot, VirtualMachine, VmError};

/// Delimiter line that opens each segment in a runtime sequence.
pub const SEG_DELIMITER: &str = "@seg";

impl VirtualMachine {
    /// Emits the call sequence of a nominal run of `main`.
    ///
    /// Walks `main` from its start pc over a freshly pushed (zero-filled)
    /// frame, following Goto and taking If against the current register
    /// state, and emits one `pc = <N>, execute: <name>` line per Call.
    /// Stops at Ret. The VM's pc is restored afterwards.
    pub fn segment_get_skeleton(&mut self) -> Result<String, VmError> {
        let info = self.lookup_func_info("main")?;
        let mut guard = self.push_frame(self.pc, &info);
        let depth = guard.vm.frames.len() - 1;
        guard.vm.pc = info.start_instr;
        let outcome = guard.vm.walk_skeleton(FrameSlot::Stack(depth));
        drop(guard);
        outcome
    }

    fn walk_skeleton(&mut self, slot: FrameSlot) -> Result<String, VmError> {
        let exec = self.executable()?.clone();
        let mut out = String::new();
        loop {
            let instr = exec
                .instruction_at(self.pc)
                .ok_or(VmError::IndexOutOfBounds {
                    index: self.pc as i64,
                    len: exec.num_instructions(),
                })?
                .clone();
            match instr {
                Instruction::Call { func_idx, .. } => {
                    let name = &exec
                        .func_at(func_idx)
                        .ok_or(VmError::IndexOutOfBounds {
                            index: i64::from(func_idx.0),
                            len: exec.num_funcs(),
                        })?
                        .name;
                    out.push_str(&format!("pc = {}, execute: {name}\n", self.pc));
                    self.pc += 1;
                }
                Instruction::Ret { .. } => return Ok(out),
                Instruction::Goto { pc_offset } => self.apply_pc_offset(pc_offset)?,
                Instruction::If { cond, false_offset } => {
                    self.take_branch(slot, cond, false_offset)?;
                }
            }
        }
    }

    /// Parses a runtime sequence and arms the runner.
    ///
    /// On success the previous segment table is replaced, the persistent
    /// frame is reset to `main`'s register file size, `pc` moves to `main`'s
    /// start instruction, and the segment count is returned. On any failure
    /// the runner is left uninitialized.
    pub fn segment_load(&mut self, runtime_sequence: &str) -> Result<usize, VmError> {
        let parsed = parse_runtime_sequence(runtime_sequence);

        self.segment_table.clear();
        self.segments_frame = None;
        self.segments_initialized = false;
        self.prev_segment_id = None;

        let table = parsed?;
        let info = self.lookup_func_info("main")?;
        self.segment_table = table;
        self.segments_frame = Some(Frame::new(0, info.register_file_size));
        self.pc = info.start_instr;
        self.segments_initialized = true;
        Ok(self.segment_table.len())
    }

    /// Device-converts `inputs` and writes them into registers `0..K-1` of
    /// the persistent frame.
    pub fn segment_set_input(&mut self, inputs: &[Value]) -> Result<(), VmError> {
        if self.segments_frame.is_none() {
            return Err(VmError::SegmentRunnerUninitialized);
        }
        let (device, alloc) = self.primary()?;
        let mut converted = Vec::with_capacity(inputs.len());
        for input in inputs {
            converted.push(convert_value_to_device(input, device, &alloc)?);
        }
        for (i, value) in converted.into_iter().enumerate() {
            self.write_register(FrameSlot::Persistent, i as RegName, value)?;
        }
        Ok(())
    }

    /// Executes every pc of segment `segment_id` against the persistent
    /// frame and returns the segment id.
    ///
    /// Skipping ahead of `prev + 1` logs a warning but still runs. After the
    /// last segment the previous-segment marker resets so the next full pass
    /// may start at segment 0 without warning.
    pub fn segment_run(&mut self, segment_id: i64) -> Result<usize, VmError> {
        if !self.segments_initialized {
            return Err(VmError::SegmentRunnerUninitialized);
        }
        let len = self.segment_table.len();
        let id = usize::try_from(segment_id)
            .ok()
            .filter(|&i| i < len)
            .ok_or(VmError::SegmentIdOutOfRange { segment_id, len })?;

        let prev = self.prev_segment_id.map_or(-1, |p| p as i64);
        if segment_id > prev + 1 {
            log::warn!("segment skipped (segment_id: {segment_id}, prev_segment_id: {prev})");
        }

        let exec = self.executable()?.clone();
        let pcs = self.segment_table[id].clone();
        for pc in pcs {
            self.pc = pc;
            let instr = exec
                .instruction_at(pc)
                .ok_or(VmError::IndexOutOfBounds {
                    index: pc as i64,
                    len: exec.num_instructions(),
                })?
                .clone();
            match instr {
                Instruction::Call {
                    dst,
                    func_idx,
                    ref args,
                } => {
                    self.run_instr_call(FrameSlot::Persistent, dst, func_idx, args)?;
                }
                Instruction::Ret { .. } => return Err(VmError::RetInsideSegment),
                Instruction::Goto { pc_offset } => self.apply_pc_offset(pc_offset)?,
                Instruction::If { cond, false_offset } => {
                    self.take_branch(FrameSlot::Persistent, cond, false_offset)?;
                }
            }
        }

        self.prev_segment_id = Some(id);
        if id + 1 == len {
            self.prev_segment_id = None;
        }
        Ok(id)
    }

    /// Reads the final value once the segments have run to the Ret.
    ///
    /// When the instruction at the current pc is not Ret, this logs a
    /// warning and returns whatever the return-value register holds. An
    /// array-of-tensors result is unpacked into a flat tensor array.
    pub fn segment_get_output(&mut self) -> Result<Value, VmError> {
        let exec = self.executable()?.clone();
        let Some(&Instruction::Ret { result }) = exec.instruction_at(self.pc) else {
            log::warn!("inference is not finished; the current instruction is not a return");
            return Ok(self.return_value.clone());
        };
        if self.segments_frame.is_none() {
            return Err(VmError::SegmentRunnerUninitialized);
        }

        let value = self.read_register(FrameSlot::Persistent, result)?;
        self.return_value = value.clone();

        // Mirror the Ret handler when a local call is still on the stack.
        if self.frames.len() > 1 {
            let caller_ret = self.frame(FrameSlot::Persistent)?.caller_return_register;
            let depth = self.frames.len() - 1;
            let ret = value.clone();
            self.write_register(FrameSlot::Stack(depth - 1), caller_ret, ret)?;
        }

        Ok(unpack_tensor_output(value))
    }
}

fn unpack_tensor_output(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let tensors: Vec<Value> = items
                .iter()
                .filter(|v| matches!(v, Value::Tensor(_)))
                .cloned()
                .collect();
            Value::array(tensors)
        }
        other => other,
    }
}

/// Parses runtime-sequence text into a segment table.
///
/// Grammar: lines are trimmed and blank lines dropped; the first and last
/// non-empty lines must be the `@seg` delimiter; every other line must
/// contain exactly one `pc = <digits>` match.
fn parse_runtime_sequence(text: &str) -> Result<Vec<Vec<usize>>, VmError> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.is_empty() {
        return Err(VmError::SegmentParseError(String::from(
            "runtime sequence is empty",
        )));
    }
    if lines.first() != Some(&SEG_DELIMITER) {
        return Err(VmError::SegmentParseError(String::from(
            "does not start with the @seg annotator",
        )));
    }
    if lines.last() != Some(&SEG_DELIMITER) {
        return Err(VmError::SegmentParseError(String::from(
            "does not end with the @seg annotator",
        )));
    }

    let mut segments: Vec<Vec<usize>> = Vec::new();
    let mut current: Option<Vec<usize>> = None;
    for line in lines {
        if line == SEG_DELIMITER {
            if let Some(done) = current.take() {
                segments.push(done);
            }
            current = Some(Vec::new());
            continue;
        }
        let (count, first) = scan_pc_line(line)?;
        match count {
            0 => {
                return Err(VmError::SegmentParseError(format!(
                    "no program counter found in line \"{line}\""
                )));
            }
            1 => {}
            _ => {
                return Err(VmError::SegmentParseError(format!(
                    "multiple program counters in line \"{line}\""
                )));
            }
        }
        let (Some(segment), Some(pc)) = (current.as_mut(), first) else {
            return Err(VmError::SegmentParseError(format!(
                "program counter outside a segment: \"{line}\""
            )));
        };
        segment.push(pc);
    }

    // `current` holds the segment opened by the closing delimiter; it has no
    // pc lines and is discarded. A trailing empty segment is dropped too.
    drop(current);
    if segments.last().is_some_and(Vec::is_empty) {
        segments.pop();
    }
    Ok(segments)
}

/// Counts `pc <ws> = <ws> <digits>` matches in `line`, left to right and
/// non-overlapping, returning the count and the first captured value.
fn scan_pc_line(line: &str) -> Result<(usize, Option<usize>), VmError> {
    let bytes = line.as_bytes();
    let mut count = 0usize;
    let mut first: Option<usize> = None;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'p' && bytes.get(i + 1) == Some(&b'c') {
            if let Some((value, end)) = match_pc_at(bytes, i + 2) {
                count += 1;
                let value = value.ok_or_else(|| {
                    VmError::SegmentParseError(format!(
                        "program counter out of range in line \"{line}\""
                    ))
                })?;
                if first.is_none() {
                    first = Some(value);
                }
                i = end;
                continue;
            }
        }
        i += 1;
    }
    Ok((count, first))
}

/// Matches `<ws> = <ws> <digits>` starting at `i`; returns the parsed value
/// (`None` on overflow) and the offset just past the digits.
fn match_pc_at(bytes: &[u8], mut i: usize) -> Option<(Option<usize>, usize)> {
    while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
        i += 1;
    }
    if bytes.get(i) != Some(&b'=') {
        return None;
    }
    i += 1;
    while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
        i += 1;
    }
    let digits_start = i;
    let mut value: Option<usize> = Some(0);
    while let Some(b) = bytes.get(i).filter(|b| b.is_ascii_digit()) {
        value = value
            .and_then(|v| v.checked_mul(10))
            .and_then(|v| v.checked_add(usize::from(b - b'0')));
        i += 1;
    }
    if i == digits_start {
        return None;
    }
    Some((value, i))
}
