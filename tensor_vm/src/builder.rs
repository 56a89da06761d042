// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! In-memory construction of [`Executable`]s.
//!
//! Compilers and tests assemble programs through [`ExecBuilder`]: declare
//! functions, push constants, emit instructions, attach import libraries,
//! then [`ExecBuilder::build`]. Build validates the cross-references a
//! dispatch loop relies on (function and constant indices in range, `If`
//! false offsets usable) so the VM can trust the stream.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use hashbrown::HashMap;

use crate::exec::{Arg, ConstIdx, Executable, FnIdx, FuncKind, Instruction, VmFuncInfo};
use crate::kernel::KernelLibrary;
use crate::value::{RegName, Value};

/// An error found while validating a program under construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    /// Two functions share a name.
    DuplicateFunction(String),
    /// An instruction referenced a function index past the table.
    FuncIdxOutOfRange {
        /// Offending pc.
        pc: usize,
        /// Referenced index.
        idx: u32,
    },
    /// An instruction referenced a constant index past the pool.
    ConstIdxOutOfRange {
        /// Offending pc.
        pc: usize,
        /// Referenced index.
        idx: u32,
    },
    /// An `If` carried a false offset of 1 or less.
    BadFalseOffset {
        /// Offending pc.
        pc: usize,
        /// Declared offset.
        false_offset: i64,
    },
    /// A bytecode function starts past the end of the instruction stream.
    StartOutOfRange {
        /// Function name.
        name: String,
        /// Declared start pc.
        start_instr: usize,
    },
    /// A register file cannot hold the declared arguments.
    RegisterFileTooSmall {
        /// Function name.
        name: String,
        /// Declared size.
        register_file_size: usize,
        /// Required minimum.
        required: usize,
    },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateFunction(name) => write!(f, "duplicate function '{name}'"),
            Self::FuncIdxOutOfRange { pc, idx } => {
                write!(f, "pc {pc}: function index {idx} out of range")
            }
            Self::ConstIdxOutOfRange { pc, idx } => {
                write!(f, "pc {pc}: constant index {idx} out of range")
            }
            Self::BadFalseOffset { pc, false_offset } => {
                write!(f, "pc {pc}: If false offset {false_offset} must be > 1")
            }
            Self::StartOutOfRange { name, start_instr } => {
                write!(f, "function '{name}' starts at invalid pc {start_instr}")
            }
            Self::RegisterFileTooSmall {
                name,
                register_file_size,
                required,
            } => write!(
                f,
                "function '{name}' register file of {register_file_size} holds fewer than {required} registers"
            ),
        }
    }
}

impl core::error::Error for BuildError {}

/// Builder for [`Executable`]s.
#[derive(Default)]
pub struct ExecBuilder {
    funcs: Vec<VmFuncInfo>,
    constants: Vec<Value>,
    imports: Vec<Rc<dyn KernelLibrary>>,
    instructions: Vec<Instruction>,
}

impl ExecBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a native kernel entry resolved by name at VM init.
    pub fn declare_native(&mut self, name: impl Into<String>, num_args: usize) -> FnIdx {
        self.push_func(VmFuncInfo {
            name: name.into(),
            kind: FuncKind::Native,
            num_args,
            register_file_size: 0,
            start_instr: 0,
            param_names: Vec::new(),
        })
    }

    /// Declares a hybrid-dispatch entry backed by a `__vmtir__` routine.
    pub fn declare_hybrid(
        &mut self,
        name: impl Into<String>,
        num_args: usize,
        register_file_size: usize,
    ) -> FnIdx {
        self.push_func(VmFuncInfo {
            name: name.into(),
            kind: FuncKind::HybridDispatch,
            num_args,
            register_file_size,
            start_instr: 0,
            param_names: Vec::new(),
        })
    }

    /// Opens a bytecode function whose body starts at the current pc.
    ///
    /// Instructions emitted after this call form the function body until the
    /// next `begin_function`.
    pub fn begin_function(
        &mut self,
        name: impl Into<String>,
        num_args: usize,
        register_file_size: usize,
        param_names: &[&str],
    ) -> FnIdx {
        self.push_func(VmFuncInfo {
            name: name.into(),
            kind: FuncKind::VmBytecode,
            num_args,
            register_file_size,
            start_instr: self.instructions.len(),
            param_names: param_names.iter().map(|&p| String::from(p)).collect(),
        })
    }

    fn push_func(&mut self, info: VmFuncInfo) -> FnIdx {
        let idx = FnIdx(self.funcs.len() as u32);
        self.funcs.push(info);
        idx
    }

    /// Adds a constant and returns its pool index.
    pub fn constant(&mut self, value: Value) -> ConstIdx {
        let idx = ConstIdx(self.constants.len() as u32);
        self.constants.push(value);
        idx
    }

    /// Attaches an imported kernel library.
    pub fn add_import(&mut self, lib: Rc<dyn KernelLibrary>) {
        self.imports.push(lib);
    }

    /// Emits `dst = func(args...)`; returns the instruction's pc.
    pub fn emit_call(&mut self, dst: RegName, func_idx: FnIdx, args: &[Arg]) -> usize {
        self.emit(Instruction::Call {
            dst,
            func_idx,
            args: args.to_vec(),
        })
    }

    /// Emits a return of `result`; returns the instruction's pc.
    pub fn emit_ret(&mut self, result: RegName) -> usize {
        self.emit(Instruction::Ret { result })
    }

    /// Emits an unconditional jump by `pc_offset`; returns the pc.
    pub fn emit_goto(&mut self, pc_offset: i64) -> usize {
        self.emit(Instruction::Goto { pc_offset })
    }

    /// Emits a conditional branch; returns the pc.
    pub fn emit_if(&mut self, cond: RegName, false_offset: i64) -> usize {
        self.emit(Instruction::If { cond, false_offset })
    }

    fn emit(&mut self, instr: Instruction) -> usize {
        let pc = self.instructions.len();
        self.instructions.push(instr);
        pc
    }

    /// Validates cross-references and produces the executable.
    pub fn build(self) -> Result<Rc<Executable>, BuildError> {
        let mut func_map: HashMap<String, FnIdx> = HashMap::with_capacity(self.funcs.len());
        for (ix, info) in self.funcs.iter().enumerate() {
            if func_map.insert(info.name.clone(), FnIdx(ix as u32)).is_some() {
                return Err(BuildError::DuplicateFunction(info.name.clone()));
            }
            match info.kind {
                FuncKind::VmBytecode => {
                    if info.start_instr >= self.instructions.len() {
                        return Err(BuildError::StartOutOfRange {
                            name: info.name.clone(),
                            start_instr: info.start_instr,
                        });
                    }
                    if info.register_file_size < info.num_args {
                        return Err(BuildError::RegisterFileTooSmall {
                            name: info.name.clone(),
                            register_file_size: info.register_file_size,
                            required: info.num_args,
                        });
                    }
                }
                FuncKind::HybridDispatch => {
                    // The result slot sits right after the inputs.
                    if info.register_file_size < info.num_args + 1 {
                        return Err(BuildError::RegisterFileTooSmall {
                            name: info.name.clone(),
                            register_file_size: info.register_file_size,
                            required: info.num_args + 1,
                        });
                    }
                }
                FuncKind::Native => {}
            }
        }

        for (pc, instr) in self.instructions.iter().enumerate() {
            match instr {
                Instruction::Call {
                    func_idx, args, ..
                } => {
                    if func_idx.0 as usize >= self.funcs.len() {
                        return Err(BuildError::FuncIdxOutOfRange {
                            pc,
                            idx: func_idx.0,
                        });
                    }
                    for arg in args {
                        match *arg {
                            Arg::ConstIdx(c) if c.0 as usize >= self.constants.len() => {
                                return Err(BuildError::ConstIdxOutOfRange { pc, idx: c.0 });
                            }
                            Arg::FuncIdx(fi) if fi.0 as usize >= self.funcs.len() => {
                                return Err(BuildError::FuncIdxOutOfRange { pc, idx: fi.0 });
                            }
                            _ => {}
                        }
                    }
                }
                Instruction::If { false_offset, .. } => {
                    if *false_offset <= 1 {
                        return Err(BuildError::BadFalseOffset {
                            pc,
                            false_offset: *false_offset,
                        });
                    }
                }
                Instruction::Ret { .. } | Instruction::Goto { .. } => {}
            }
        }

        Ok(Rc::new(Executable {
            func_table: self.funcs,
            func_map,
            constants: self.constants,
            imports: self.imports,
            instructions: self.instructions,
        }))
    }
}
