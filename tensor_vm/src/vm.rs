// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The virtual machine: function pool, dispatch loop, and call surface.
//!
//! A [`VirtualMachine`] owns all execution state: program counter, call
//! frames and their free list, constant and function pools, stateful
//! inputs/outputs, saved closures, and the segment runner's persistent frame
//! (see [`crate::segment`]). A VM instance is single-threaded; callers that
//! share one across threads must synchronize externally.
//!
//! Lifecycle: construct with a memory manager and kernel registry, load an
//! executable, run [`VirtualMachine::init`], then invoke closures directly
//! or drive the segment runner.

use alloc::format;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use hashbrown::HashMap;

use crate::closure::{ClosureImpl, VmClosure, VmFunction};
use crate::exec::{Arg, Executable, FnIdx, FuncKind, Instruction, VmFuncInfo};
use crate::frame::Frame;
use crate::kernel::KernelRegistry;
use crate::memory::{Allocator, AllocatorKind, MemoryManager, convert_value_to_device};
use crate::value::{BEGIN_SPECIAL_REG, Device, DeviceType, RegName, Value, VmId};
use crate::value::{VM_REGISTER, VOID_REGISTER};

/// Scratch slots reserved ahead of the call arguments when an
/// instrumentation hook is installed: function, name, before-flag, return.
pub(crate) const INSTRUMENT_PREFIX_SLOTS: usize = 4;

/// A runtime error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmError {
    /// Name not present in the executable's function map.
    UnknownFunction(String),
    /// An invoker supplied the wrong number of arguments.
    InvalidArgumentCount {
        /// Function or operation name.
        function: String,
        /// Declared argument count.
        expected: usize,
        /// Supplied argument count.
        actual: usize,
    },
    /// An index referenced past the end of a pool, array, or stream.
    IndexOutOfBounds {
        /// Requested index.
        index: i64,
        /// Container length.
        len: usize,
    },
    /// An output walk tried to index a non-array value.
    NotAnArray,
    /// `get_output` resolved to an array; another index is required.
    OutputIsArray,
    /// `invoke_stateful` without a prior `set_input`.
    NoInputsSet(String),
    /// `get_output`/`get_output_arity` before any `invoke_stateful`.
    NoOutputSaved(String),
    /// A `Native` function pool entry could not be resolved.
    NativeNotFound(String),
    /// A native kernel reported a failure.
    KernelFailed {
        /// Kernel symbol.
        symbol: String,
        /// Kernel-provided description.
        message: String,
    },
    /// Runtime-sequence text violated the segment grammar.
    SegmentParseError(String),
    /// A segment runner operation ran before a successful load.
    SegmentRunnerUninitialized,
    /// `run(i)` with `i` outside the segment table.
    SegmentIdOutOfRange {
        /// Requested segment.
        segment_id: i64,
        /// Segment count.
        len: usize,
    },
    /// A segment reached a `Ret` before its pc list completed.
    RetInsideSegment,
    /// Malformed instruction or register reference.
    InvalidInstruction(&'static str),
    /// A value had the wrong dynamic tag for the operation.
    TypeMismatch {
        /// What the operation needed.
        expected: &'static str,
        /// What it got.
        actual: &'static str,
    },
    /// The active frame stack hit the configured depth bound.
    CallDepthExceeded {
        /// Depth at the time of the call.
        depth: usize,
    },
    /// No executable has been loaded.
    NoExecutable,
    /// `vm_initialization` has not run.
    NotInitialized,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction(name) => write!(f, "unknown function '{name}'"),
            Self::InvalidArgumentCount {
                function,
                expected,
                actual,
            } => write!(
                f,
                "'{function}' expects {expected} arguments, but {actual} were provided"
            ),
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds (len {len})")
            }
            Self::NotAnArray => write!(f, "attempted to index into a value that is not an array"),
            Self::OutputIsArray => write!(
                f,
                "output is an array; specify another index to select an element"
            ),
            Self::NoInputsSet(name) => write!(
                f,
                "no inputs set for stateful call of '{name}'; use set_input first"
            ),
            Self::NoOutputSaved(name) => write!(
                f,
                "no output saved for call of '{name}'; use invoke_stateful first"
            ),
            Self::NativeNotFound(name) => write!(
                f,
                "cannot find native function '{name}' in imports or the kernel registry"
            ),
            Self::KernelFailed { symbol, message } => {
                write!(f, "kernel '{symbol}' failed: {message}")
            }
            Self::SegmentParseError(reason) => write!(f, "segment parse error: {reason}"),
            Self::SegmentRunnerUninitialized => write!(f, "segment runner is not initialized"),
            Self::SegmentIdOutOfRange { segment_id, len } => write!(
                f,
                "segment id {segment_id} out of range (segment count {len})"
            ),
            Self::RetInsideSegment => {
                write!(f, "reached a return before the segment completed")
            }
            Self::InvalidInstruction(reason) => write!(f, "invalid instruction: {reason}"),
            Self::TypeMismatch { expected, actual } => {
                write!(f, "type mismatch (expected {expected}, got {actual})")
            }
            Self::CallDepthExceeded { depth } => {
                write!(f, "call depth limit exceeded at depth {depth}")
            }
            Self::NoExecutable => write!(f, "no executable loaded"),
            Self::NotInitialized => write!(f, "vm_initialization has not run"),
        }
    }
}

impl core::error::Error for VmError {}

/// Reply codes an instrumentation hook may return from its before-call
/// invocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstrumentAction {
    /// Proceed with the call.
    NoOp,
    /// Skip the call; the destination register receives null.
    SkipRun,
}

impl InstrumentAction {
    /// The integer code for this action.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::NoOp => 0,
            Self::SkipRun => 1,
        }
    }

    /// Parses an action code; unknown codes read as [`Self::NoOp`].
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        if code == Self::SkipRun.code() {
            Self::SkipRun
        } else {
            Self::NoOp
        }
    }
}

/// Execution bounds for a VM.
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Maximum active call frames.
    pub max_call_depth: usize,
    /// Maximum recycled frames kept on the free list.
    pub max_free_frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_free_frames: 32,
        }
    }
}

/// Which frame the dispatch routines address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FrameSlot {
    /// A frame on the active stack, by depth.
    Stack(usize),
    /// The segment runner's persistent frame.
    Persistent,
}

/// The register virtual machine.
pub struct VirtualMachine {
    id: VmId,
    config: VmConfig,
    memory: Rc<dyn MemoryManager>,
    registry: Rc<dyn KernelRegistry>,

    exec: Option<Rc<Executable>>,
    devices: Vec<Device>,
    allocators: Vec<Rc<dyn Allocator>>,
    const_pool: Vec<Value>,
    func_pool: Vec<VmFunction>,

    inputs: HashMap<String, Vec<Value>>,
    outputs: HashMap<String, Value>,
    saved_closures: HashMap<String, VmClosure>,

    pub(crate) frames: Vec<Frame>,
    free_frames: Vec<Frame>,
    pub(crate) pc: usize,
    pub(crate) return_value: Value,
    instrument: Option<VmFunction>,

    pub(crate) segment_table: Vec<Vec<usize>>,
    pub(crate) segments_initialized: bool,
    pub(crate) segments_frame: Option<Frame>,
    pub(crate) prev_segment_id: Option<usize>,
}

impl VirtualMachine {
    /// Creates a VM over the given memory manager and kernel registry.
    ///
    /// The registry must already contain every kernel the executable's
    /// `Native` entries will resolve through it.
    #[must_use]
    pub fn new(memory: Rc<dyn MemoryManager>, registry: Rc<dyn KernelRegistry>) -> Self {
        Self::with_config(memory, registry, VmConfig::default())
    }

    /// Creates a VM with explicit execution bounds.
    #[must_use]
    pub fn with_config(
        memory: Rc<dyn MemoryManager>,
        registry: Rc<dyn KernelRegistry>,
        config: VmConfig,
    ) -> Self {
        Self {
            id: VmId::mint(),
            config,
            memory,
            registry,
            exec: None,
            devices: Vec::new(),
            allocators: Vec::new(),
            const_pool: Vec::new(),
            func_pool: Vec::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            saved_closures: HashMap::new(),
            frames: Vec::new(),
            free_frames: Vec::new(),
            pc: 0,
            return_value: Value::Null,
            instrument: None,
            segment_table: Vec::new(),
            segments_initialized: false,
            segments_frame: None,
            prev_segment_id: None,
        }
    }

    /// This VM's stable identity; the value read from the context register.
    #[must_use]
    pub fn id(&self) -> VmId {
        self.id
    }

    /// Loads the executable to run.
    pub fn load_executable(&mut self, exec: Rc<Executable>) {
        self.exec = Some(exec);
    }

    /// The loaded executable.
    pub fn executable(&self) -> Result<&Rc<Executable>, VmError> {
        self.exec.as_ref().ok_or(VmError::NoExecutable)
    }

    /// Initializes devices and allocators, then builds the constant and
    /// function pools. Requires a loaded executable.
    pub fn init(&mut self, devices: &[(Device, AllocatorKind)]) -> Result<(), VmError> {
        let exec = self.executable()?.clone();

        self.devices.clear();
        self.allocators.clear();
        for &(device, kind) in devices {
            let alloc = self.memory.get_or_create_allocator(device, kind);
            self.devices.push(device);
            self.allocators.push(alloc);
        }

        // Tensor constants live on the primary device.
        let mut pool = Vec::with_capacity(exec.num_constants());
        for constant in &exec.constants {
            match constant {
                Value::Tensor(_) => {
                    let (device, alloc) = self.primary()?;
                    pool.push(convert_value_to_device(constant, device, &alloc)?);
                }
                other => pool.push(other.clone()),
            }
        }
        self.const_pool = pool;

        self.init_func_pool()
    }

    /// The devices this VM was initialized with; index 0 is primary.
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The allocator for device `i`.
    #[must_use]
    pub fn allocator(&self, i: usize) -> Option<&Rc<dyn Allocator>> {
        self.allocators.get(i)
    }

    /// The materialized constant pool.
    #[must_use]
    pub fn const_pool(&self) -> &[Value] {
        &self.const_pool
    }

    /// The materialized function pool, parallel to the function table.
    #[must_use]
    pub fn func_pool(&self) -> &[VmFunction] {
        &self.func_pool
    }

    pub(crate) fn primary(&self) -> Result<(Device, Rc<dyn Allocator>), VmError> {
        match (self.devices.first(), self.allocators.first()) {
            (Some(&device), Some(alloc)) => Ok((device, alloc.clone())),
            _ => Err(VmError::NotInitialized),
        }
    }

    fn init_func_pool(&mut self) -> Result<(), VmError> {
        let exec = self.executable()?.clone();
        let mut pool = Vec::with_capacity(exec.num_funcs());
        for info in &exec.func_table {
            match info.kind {
                FuncKind::Native => {
                    let func = exec
                        .func_from_imports(&info.name)
                        .or_else(|| self.registry.get(&info.name))
                        .ok_or_else(|| VmError::NativeNotFound(info.name.clone()))?;
                    pool.push(VmFunction::Native(func));
                }
                FuncKind::VmBytecode | FuncKind::HybridDispatch => {
                    let closure = self
                        .get_closure_internal(&info.name, false)?
                        .ok_or_else(|| VmError::UnknownFunction(info.name.clone()))?;
                    pool.push(VmFunction::Closure(closure));
                }
            }
        }
        self.func_pool = pool;
        Ok(())
    }

    //-----------------------------------------------------------------
    // Closure handling
    //-----------------------------------------------------------------

    /// Returns the closure for `func_name`, consulting saved closures first.
    pub fn get_closure(&self, func_name: &str) -> Result<VmClosure, VmError> {
        self.get_closure_internal(func_name, false)?
            .ok_or_else(|| VmError::UnknownFunction(func_name.into()))
    }

    /// Resolves `name` to a callable, or `None` when absent.
    ///
    /// This is the default lookup of the module-style call surface.
    pub fn lookup_function(&self, name: &str) -> Result<Option<VmFunction>, VmError> {
        Ok(self
            .get_closure_internal(name, true)?
            .map(VmFunction::Closure))
    }

    fn get_closure_internal(
        &self,
        func_name: &str,
        allow_missing: bool,
    ) -> Result<Option<VmClosure>, VmError> {
        if let Some(saved) = self.saved_closures.get(func_name) {
            return Ok(Some(saved.clone()));
        }
        let exec = self.executable()?.clone();
        let Some(idx) = exec.find_func(func_name) else {
            if allow_missing {
                return Ok(None);
            }
            return Err(VmError::UnknownFunction(func_name.into()));
        };
        let info = exec
            .func_at(idx)
            .cloned()
            .ok_or(VmError::IndexOutOfBounds {
                index: i64::from(idx.0),
                len: exec.num_funcs(),
            })?;

        match info.kind {
            FuncKind::VmBytecode => {
                // Captures only the function index; the VM arrives as the
                // first parameter at invocation time.
                let impl_: ClosureImpl = Rc::new(move |vm, args| vm.invoke_bytecode(idx, args));
                Ok(Some(VmClosure::new(func_name, impl_)))
            }
            FuncKind::HybridDispatch => {
                let dispatch_name = format!("__vmtir__{}", info.name);
                let routine = exec
                    .hybrid_from_imports(&dispatch_name)
                    .ok_or(VmError::NativeNotFound(dispatch_name))?;
                let impl_: ClosureImpl = Rc::new(move |vm, args| {
                    if args.len() != info.num_args {
                        return Err(VmError::InvalidArgumentCount {
                            function: info.name.clone(),
                            expected: info.num_args,
                            actual: args.len(),
                        });
                    }
                    let mut regs: Vec<Value> = Vec::new();
                    regs.resize_with(info.register_file_size, Value::default);
                    for (i, arg) in args.iter().enumerate() {
                        regs[i] = arg.clone();
                    }
                    routine(vm, &mut regs)?;
                    // The result slot sits right after the inputs.
                    Ok(regs[info.num_args].clone())
                });
                Ok(Some(VmClosure::new(func_name, impl_)))
            }
            FuncKind::Native => Err(VmError::TypeMismatch {
                expected: "bytecode or hybrid function",
                actual: "native kernel",
            }),
        }
    }

    /// Binds trailing `args` onto `func_name` and stores the result under
    /// `save_name`. With `include_return = false` the saved closure runs for
    /// effect only.
    pub fn save_function(
        &mut self,
        func_name: &str,
        save_name: &str,
        include_return: bool,
        args: &[Value],
    ) -> Result<(), VmError> {
        let closure = self.get_closure(func_name)?;
        let (device, alloc) = self.primary()?;
        let mut bound = Vec::with_capacity(args.len());
        for arg in args {
            bound.push(convert_value_to_device(arg, device, &alloc)?);
        }
        let mut impl_ = VmClosure::bind_last_args(closure.impl_fn().clone(), bound);
        if !include_return {
            impl_ = VmClosure::discard_return(impl_);
        }
        self.saved_closures
            .insert(save_name.into(), VmClosure::new(save_name, impl_));
        Ok(())
    }

    /// Invokes a callable: natives directly, closures with this VM first.
    pub fn invoke_closure(&mut self, func: &VmFunction, args: &[Value]) -> Result<Value, VmError> {
        match func {
            VmFunction::Native(f) => f(args),
            VmFunction::Closure(c) => {
                let impl_ = c.impl_fn().clone();
                impl_(self, args)
            }
        }
    }

    /// Installs (or replaces) the per-Call instrumentation hook.
    pub fn set_instrument(&mut self, instrument: VmFunction) {
        self.instrument = Some(instrument);
    }

    //-----------------------------------------------------------------
    // Instruction interpretations
    //-----------------------------------------------------------------

    /// Runs bytecode function `func_idx` with `args`, returning its result.
    pub fn invoke_bytecode(&mut self, func_idx: FnIdx, args: &[Value]) -> Result<Value, VmError> {
        let exec = self.executable()?.clone();
        let info = exec
            .func_at(func_idx)
            .cloned()
            .ok_or(VmError::IndexOutOfBounds {
                index: i64::from(func_idx.0),
                len: exec.num_funcs(),
            })?;
        if info.kind != FuncKind::VmBytecode {
            return Err(VmError::TypeMismatch {
                expected: "bytecode function",
                actual: "native or hybrid function",
            });
        }
        if args.len() != info.num_args {
            return Err(VmError::InvalidArgumentCount {
                function: info.name.clone(),
                expected: info.num_args,
                actual: args.len(),
            });
        }
        if self.frames.len() >= self.config.max_call_depth {
            return Err(VmError::CallDepthExceeded {
                depth: self.frames.len(),
            });
        }

        // The instruction at the current pc is the caller's Call (when there
        // is one); its destination receives this function's return value.
        let caller_dst = match exec.instruction_at(self.pc) {
            Some(Instruction::Call { dst, .. }) => Some(*dst),
            _ => None,
        };

        let mut guard = self.push_frame(self.pc, &info);
        let depth = guard.vm.frames.len() - 1;
        let slot = FrameSlot::Stack(depth);
        if let Some(dst) = caller_dst {
            guard.vm.frames[depth].caller_return_register = dst;
        }
        for (i, arg) in args.iter().enumerate() {
            guard.vm.write_register(slot, i as RegName, arg.clone())?;
        }
        guard.vm.pc = info.start_instr;
        let outcome = guard.vm.run_loop(slot);
        drop(guard);
        outcome?;
        Ok(self.return_value.clone())
    }

    /// The dispatch loop for one function activation.
    fn run_loop(&mut self, slot: FrameSlot) -> Result<(), VmError> {
        let exec = self.executable()?.clone();
        loop {
            let instr = exec
                .instruction_at(self.pc)
                .ok_or(VmError::IndexOutOfBounds {
                    index: self.pc as i64,
                    len: exec.num_instructions(),
                })?
                .clone();
            match instr {
                Instruction::Call {
                    dst,
                    func_idx,
                    ref args,
                } => {
                    self.run_instr_call(slot, dst, func_idx, args)?;
                }
                Instruction::Ret { result } => {
                    self.return_value = self.read_register(slot, result)?;
                    if let FrameSlot::Stack(depth) = slot
                        && depth >= 1
                    {
                        // Return from a local call: deliver into the caller.
                        let caller_ret = self.frame(slot)?.caller_return_register;
                        let ret = self.return_value.clone();
                        self.write_register(FrameSlot::Stack(depth - 1), caller_ret, ret)?;
                    }
                    return Ok(());
                }
                Instruction::Goto { pc_offset } => {
                    self.apply_pc_offset(pc_offset)?;
                }
                Instruction::If { cond, false_offset } => {
                    self.take_branch(slot, cond, false_offset)?;
                }
            }
        }
    }

    /// Executes one Call instruction against `slot`.
    pub(crate) fn run_instr_call(
        &mut self,
        slot: FrameSlot,
        dst: RegName,
        func_idx: FnIdx,
        args: &[Arg],
    ) -> Result<(), VmError> {
        let func_name = {
            let exec = self.executable()?;
            exec.func_at(func_idx)
                .ok_or(VmError::IndexOutOfBounds {
                    index: i64::from(func_idx.0),
                    len: exec.num_funcs(),
                })?
                .name
                .clone()
        };
        log::debug!("pc = {}, execute: {}", self.pc, func_name);

        let prefix = if self.instrument.is_some() {
            INSTRUMENT_PREFIX_SLOTS
        } else {
            0
        };

        // Reuse the frame's scratch buffer for the outgoing arguments.
        let mut scratch = core::mem::take(&mut self.frame_mut(slot)?.call_args);
        scratch.clear();
        scratch.resize(prefix, Value::Null);
        for arg in args {
            let value = match *arg {
                Arg::Register(r) => self.read_register(slot, r)?,
                Arg::Immediate(imm) => Value::I64(imm),
                Arg::ConstIdx(c) => self.const_pool.get(c.0 as usize).cloned().ok_or(
                    VmError::IndexOutOfBounds {
                        index: i64::from(c.0),
                        len: self.const_pool.len(),
                    },
                )?,
                Arg::FuncIdx(fi) => Value::Func(
                    self.func_pool
                        .get(fi.0 as usize)
                        .cloned()
                        .ok_or(VmError::IndexOutOfBounds {
                            index: i64::from(fi.0),
                            len: self.func_pool.len(),
                        })?,
                ),
            };
            scratch.push(value);
        }

        let callee =
            self.func_pool
                .get(func_idx.0 as usize)
                .cloned()
                .ok_or(VmError::IndexOutOfBounds {
                    index: i64::from(func_idx.0),
                    len: self.func_pool.len(),
                })?;

        let ret = if let Some(instrument) = self.instrument.clone() {
            scratch[0] = Value::Func(callee.clone());
            scratch[1] = Value::Str(func_name);
            scratch[2] = Value::Bool(true);
            scratch[3] = Value::Null;

            // The hook sees dtype arguments in string form; the kernel must
            // still receive the original descriptor values.
            let mut hook_args = scratch.clone();
            for value in &mut hook_args[INSTRUMENT_PREFIX_SLOTS..] {
                if let Value::DataType(dtype) = value {
                    *value = Value::Str(dtype.to_string());
                }
            }

            let reply = self.invoke_closure(&instrument, &hook_args)?;
            let action = InstrumentAction::from_code(reply.as_i64().unwrap_or(0));
            if action == InstrumentAction::SkipRun {
                Value::Null
            } else {
                let ret = self.invoke_closure(&callee, &scratch[INSTRUMENT_PREFIX_SLOTS..])?;
                hook_args[2] = Value::Bool(false);
                hook_args[3] = ret.clone();
                self.invoke_closure(&instrument, &hook_args)?;
                ret
            }
        } else {
            self.invoke_closure(&callee, &scratch)?
        };

        // Writes to special registers are dropped.
        if dst < BEGIN_SPECIAL_REG {
            self.write_register(slot, dst, ret)?;
        }
        self.frame_mut(slot)?.call_args = scratch;
        self.pc += 1;
        Ok(())
    }

    pub(crate) fn apply_pc_offset(&mut self, offset: i64) -> Result<(), VmError> {
        let len = self.executable()?.num_instructions();
        let next = (self.pc as i64).checked_add(offset);
        match next {
            Some(next) if next >= 0 => {
                self.pc = next as usize;
                Ok(())
            }
            _ => Err(VmError::IndexOutOfBounds {
                index: next.unwrap_or(i64::MIN),
                len,
            }),
        }
    }

    pub(crate) fn take_branch(
        &mut self,
        slot: FrameSlot,
        cond: RegName,
        false_offset: i64,
    ) -> Result<(), VmError> {
        let cond_val = condition_as_i64(&self.read_register(slot, cond)?)?;
        if cond_val != 0 {
            self.pc += 1;
            Ok(())
        } else if false_offset > 1 {
            self.apply_pc_offset(false_offset)
        } else {
            Err(VmError::InvalidInstruction("If false offset must be > 1"))
        }
    }

    //-----------------------------------------------------------------
    // Frames and registers
    //-----------------------------------------------------------------

    pub(crate) fn push_frame(&mut self, return_pc: usize, info: &VmFuncInfo) -> FrameGuard<'_> {
        let frame = match self.free_frames.pop() {
            Some(mut recycled) => {
                recycled.reset_for_recycle(return_pc, info.register_file_size);
                recycled
            }
            None => Frame::new(return_pc, info.register_file_size),
        };
        self.frames.push(frame);
        FrameGuard { vm: self }
    }

    pub(crate) fn frame(&self, slot: FrameSlot) -> Result<&Frame, VmError> {
        match slot {
            FrameSlot::Stack(depth) => self
                .frames
                .get(depth)
                .ok_or(VmError::InvalidInstruction("no frame at requested depth")),
            FrameSlot::Persistent => self
                .segments_frame
                .as_ref()
                .ok_or(VmError::SegmentRunnerUninitialized),
        }
    }

    pub(crate) fn frame_mut(&mut self, slot: FrameSlot) -> Result<&mut Frame, VmError> {
        match slot {
            FrameSlot::Stack(depth) => self
                .frames
                .get_mut(depth)
                .ok_or(VmError::InvalidInstruction("no frame at requested depth")),
            FrameSlot::Persistent => self
                .segments_frame
                .as_mut()
                .ok_or(VmError::SegmentRunnerUninitialized),
        }
    }

    /// Reads a register of the addressed frame, honoring the reserved names.
    pub(crate) fn read_register(&self, slot: FrameSlot, reg: RegName) -> Result<Value, VmError> {
        if reg < BEGIN_SPECIAL_REG {
            let frame = self.frame(slot)?;
            return frame
                .register_file
                .get(reg as usize)
                .cloned()
                .ok_or(VmError::IndexOutOfBounds {
                    index: i64::from(reg),
                    len: frame.register_file.len(),
                });
        }
        match reg {
            VOID_REGISTER => Ok(Value::Null),
            VM_REGISTER => Ok(Value::VmContext(self.id)),
            _ => Err(VmError::InvalidInstruction(
                "read of an unknown special register",
            )),
        }
    }

    /// Writes a register; writes at or above the boundary are discarded.
    pub(crate) fn write_register(
        &mut self,
        slot: FrameSlot,
        reg: RegName,
        value: Value,
    ) -> Result<(), VmError> {
        if reg >= BEGIN_SPECIAL_REG {
            return Ok(());
        }
        let frame = self.frame_mut(slot)?;
        let len = frame.register_file.len();
        let cell = frame
            .register_file
            .get_mut(reg as usize)
            .ok_or(VmError::IndexOutOfBounds {
                index: i64::from(reg),
                len,
            })?;
        *cell = value;
        Ok(())
    }

    //-----------------------------------------------------------------
    // Stateful input/output surface
    //-----------------------------------------------------------------

    /// Device-converts and stores inputs for a later `invoke_stateful`.
    pub fn set_input(&mut self, func_name: &str, args: &[Value]) -> Result<(), VmError> {
        self.set_input_impl(func_name, false, args)
    }

    /// As [`Self::set_input`], but the final argument is a module whose
    /// `get_params` materializes the tail argument.
    pub fn set_input_with_param_module(
        &mut self,
        func_name: &str,
        args: &[Value],
    ) -> Result<(), VmError> {
        self.set_input_impl(func_name, true, args)
    }

    fn set_input_impl(
        &mut self,
        func_name: &str,
        with_param_module: bool,
        args: &[Value],
    ) -> Result<(), VmError> {
        let info = self.lookup_func_info(func_name)?;
        if args.len() != info.num_args {
            return Err(VmError::InvalidArgumentCount {
                function: info.name,
                expected: info.num_args,
                actual: args.len(),
            });
        }
        let (device, alloc) = self.primary()?;
        let mut func_args = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            if with_param_module && i + 1 == args.len() {
                let Value::Module(module) = arg else {
                    return Err(VmError::TypeMismatch {
                        expected: "module",
                        actual: arg.kind_name(),
                    });
                };
                func_args.push(module.get_params()?);
            } else {
                func_args.push(convert_value_to_device(arg, device, &alloc)?);
            }
        }
        self.inputs.insert(func_name.into(), func_args);
        Ok(())
    }

    /// Invokes `func_name` with the stored inputs and saves its output.
    pub fn invoke_stateful(&mut self, func_name: &str) -> Result<Value, VmError> {
        let exec = self.executable()?.clone();
        let idx = exec
            .find_func(func_name)
            .ok_or_else(|| VmError::UnknownFunction(func_name.into()))?;
        let args = self
            .inputs
            .get(func_name)
            .cloned()
            .ok_or_else(|| VmError::NoInputsSet(func_name.into()))?;
        let func = self
            .func_pool
            .get(idx.0 as usize)
            .cloned()
            .ok_or(VmError::IndexOutOfBounds {
                index: i64::from(idx.0),
                len: self.func_pool.len(),
            })?;
        let out = self.invoke_closure(&func, &args)?;
        self.outputs.insert(func_name.into(), out.clone());
        Ok(out)
    }

    /// Walks the stored output of `func_name` by `indices` and returns the
    /// selected node, which must not itself be an array.
    pub fn get_output(&self, func_name: &str, indices: &[i64]) -> Result<Value, VmError> {
        let out = self
            .outputs
            .get(func_name)
            .ok_or_else(|| VmError::NoOutputSaved(func_name.into()))?;
        let node = index_into_nested(out, indices)?;
        if node.as_array().is_some() {
            return Err(VmError::OutputIsArray);
        }
        Ok(node)
    }

    /// As [`Self::get_output`], but reports the array length at the selected
    /// node, or -1 when the node is not an array.
    pub fn get_output_arity(&self, func_name: &str, indices: &[i64]) -> Result<i64, VmError> {
        let out = self
            .outputs
            .get(func_name)
            .ok_or_else(|| VmError::NoOutputSaved(func_name.into()))?;
        let node = index_into_nested(out, indices)?;
        Ok(node.as_array().map_or(-1, |arr| arr.len() as i64))
    }

    /// Number of declared parameter names of `func_name`.
    pub fn get_function_arity(&self, func_name: &str) -> Result<usize, VmError> {
        Ok(self.lookup_func_info(func_name)?.param_names.len())
    }

    /// The `index`-th declared parameter name of `func_name`.
    pub fn get_function_param_name(
        &self,
        func_name: &str,
        index: usize,
    ) -> Result<String, VmError> {
        let info = self.lookup_func_info(func_name)?;
        info.param_names
            .get(index)
            .cloned()
            .ok_or(VmError::IndexOutOfBounds {
                index: index as i64,
                len: info.param_names.len(),
            })
    }

    pub(crate) fn lookup_func_info(&self, func_name: &str) -> Result<VmFuncInfo, VmError> {
        let exec = self.executable()?;
        let idx = exec
            .find_func(func_name)
            .ok_or_else(|| VmError::UnknownFunction(func_name.into()))?;
        exec.func_at(idx).cloned().ok_or(VmError::IndexOutOfBounds {
            index: i64::from(idx.0),
            len: exec.num_funcs(),
        })
    }

    //-----------------------------------------------------------------
    // Module-style call surface
    //-----------------------------------------------------------------

    /// Dispatches a named operation with positional [`Value`] arguments.
    ///
    /// This is the dynamic surface drivers use; every operation is also
    /// available as a typed method. Segment runner sentinel classes are
    /// reported as `I64(-1)` rather than errors.
    pub fn module_call(&mut self, name: &str, args: &[Value]) -> Result<Value, VmError> {
        match name {
            "vm_initialization" => {
                if !args.len().is_multiple_of(3) {
                    return Err(VmError::InvalidArgumentCount {
                        function: name.into(),
                        expected: args.len() / 3 * 3,
                        actual: args.len(),
                    });
                }
                let mut pairs = Vec::with_capacity(args.len() / 3);
                for triple in args.chunks_exact(3) {
                    let device_type = expect_i64(&triple[0])?;
                    let device_id = expect_i64(&triple[1])?;
                    let alloc_kind = AllocatorKind::from_index(expect_i64(&triple[2])?).ok_or(
                        VmError::TypeMismatch {
                            expected: "allocator kind 1 (naive) or 2 (pooled)",
                            actual: "other integer",
                        },
                    )?;
                    pairs.push((
                        Device {
                            device_type: DeviceType::from_index(device_type),
                            device_id: device_id as i32,
                        },
                        alloc_kind,
                    ));
                }
                self.init(&pairs)?;
                Ok(Value::Null)
            }
            "save_function" => {
                let func_name = expect_str(arg_at(args, 0, name)?)?.to_string();
                let save_name = expect_str(arg_at(args, 1, name)?)?.to_string();
                let include_return = expect_bool(arg_at(args, 2, name)?)?;
                self.save_function(&func_name, &save_name, include_return, &args[3..])?;
                Ok(Value::Null)
            }
            "invoke_closure" => {
                let func = expect_func(arg_at(args, 0, name)?)?.clone();
                self.invoke_closure(&func, &args[1..])
            }
            "invoke_stateful" => {
                let func_name = expect_str(arg_at(args, 0, name)?)?.to_string();
                self.invoke_stateful(&func_name)?;
                Ok(Value::Null)
            }
            "set_instrument" => {
                let head = arg_at(args, 0, name)?;
                if let Value::Func(func) = head {
                    self.set_instrument(func.clone());
                } else {
                    let factory_name = expect_str(head)?;
                    let factory = self
                        .registry
                        .get(factory_name)
                        .ok_or_else(|| VmError::NativeNotFound(factory_name.into()))?;
                    let built = factory(&args[1..])?;
                    let Value::Func(func) = built else {
                        return Err(VmError::TypeMismatch {
                            expected: "function",
                            actual: built.kind_name(),
                        });
                    };
                    self.set_instrument(func);
                }
                Ok(Value::Null)
            }
            "set_input" => {
                let func_name = expect_str(arg_at(args, 0, name)?)?.to_string();
                self.set_input(&func_name, &args[1..])?;
                Ok(Value::Null)
            }
            "set_input_with_param_module" => {
                let func_name = expect_str(arg_at(args, 0, name)?)?.to_string();
                self.set_input_with_param_module(&func_name, &args[1..])?;
                Ok(Value::Null)
            }
            "get_output" => {
                let func_name = expect_str(arg_at(args, 0, name)?)?.to_string();
                let indices = expect_indices(&args[1..])?;
                self.get_output(&func_name, &indices)
            }
            "get_output_arity" => {
                let func_name = expect_str(arg_at(args, 0, name)?)?.to_string();
                let indices = expect_indices(&args[1..])?;
                Ok(Value::I64(self.get_output_arity(&func_name, &indices)?))
            }
            "get_function_arity" => {
                let func_name = expect_str(arg_at(args, 0, name)?)?;
                Ok(Value::I64(self.get_function_arity(func_name)? as i64))
            }
            "get_function_param_name" => {
                let func_name = expect_str(arg_at(args, 0, name)?)?;
                let index = expect_i64(arg_at(args, 1, name)?)?;
                let index = usize::try_from(index).map_err(|_| VmError::IndexOutOfBounds {
                    index,
                    len: 0,
                })?;
                Ok(Value::Str(self.get_function_param_name(func_name, index)?))
            }
            "segment_runner.get_skeleton" => Ok(Value::Str(self.segment_get_skeleton()?)),
            "segment_runner.load" => {
                let text = expect_str(arg_at(args, 0, name)?)?.to_string();
                match self.segment_load(&text) {
                    Ok(count) => Ok(Value::I64(count as i64)),
                    Err(err) => segment_sentinel(err),
                }
            }
            "segment_runner.set_input" => match self.segment_set_input(args) {
                Ok(()) => Ok(Value::I64(0)),
                Err(err) => segment_sentinel(err),
            },
            "segment_runner.run" => {
                let segment_id = expect_i64(arg_at(args, 0, name)?)?;
                match self.segment_run(segment_id) {
                    Ok(ran) => Ok(Value::I64(ran as i64)),
                    Err(err) => segment_sentinel(err),
                }
            }
            "segment_runner.get_output" => self.segment_get_output(),
            _ => Err(VmError::UnknownFunction(name.into())),
        }
    }
}

/// RAII wrapper that pops a VM frame when dropped.
///
/// Dropping restores `vm.pc` from the frame's return pc, clears the frame,
/// and returns it to the free list. Error paths out of the dispatch loop run
/// this cleanup like any other exit.
pub(crate) struct FrameGuard<'vm> {
    pub(crate) vm: &'vm mut VirtualMachine,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        debug_assert!(!self.vm.frames.is_empty());
        if let Some(mut frame) = self.vm.frames.pop() {
            self.vm.pc = frame.return_pc;
            frame.clear();
            if self.vm.free_frames.len() < self.vm.config.max_free_frames {
                self.vm.free_frames.push(frame);
            }
        }
    }
}

fn condition_as_i64(value: &Value) -> Result<i64, VmError> {
    match value {
        // Unwritten registers read as zero, so a zero-filled frame takes
        // the false branch.
        Value::Null => Ok(0),
        other => other.as_i64().ok_or(VmError::TypeMismatch {
            expected: "integer condition",
            actual: other.kind_name(),
        }),
    }
}

fn index_into_nested(value: &Value, indices: &[i64]) -> Result<Value, VmError> {
    let mut current = value.clone();
    for &raw in indices {
        let next = {
            let arr = current.as_array().ok_or(VmError::NotAnArray)?;
            let ix = usize::try_from(raw).map_err(|_| VmError::IndexOutOfBounds {
                index: raw,
                len: arr.len(),
            })?;
            arr.get(ix).cloned().ok_or(VmError::IndexOutOfBounds {
                index: raw,
                len: arr.len(),
            })?
        };
        current = next;
    }
    Ok(current)
}

fn segment_sentinel(err: VmError) -> Result<Value, VmError> {
    match err {
        VmError::SegmentParseError(_)
        | VmError::SegmentRunnerUninitialized
        | VmError::SegmentIdOutOfRange { .. }
        | VmError::RetInsideSegment => Ok(Value::I64(-1)),
        other => Err(other),
    }
}

fn arg_at<'a>(args: &'a [Value], index: usize, op: &str) -> Result<&'a Value, VmError> {
    args.get(index).ok_or_else(|| VmError::InvalidArgumentCount {
        function: op.into(),
        expected: index + 1,
        actual: args.len(),
    })
}

fn expect_str(value: &Value) -> Result<&str, VmError> {
    value.as_str().ok_or(VmError::TypeMismatch {
        expected: "string",
        actual: value.kind_name(),
    })
}

fn expect_i64(value: &Value) -> Result<i64, VmError> {
    value.as_i64().ok_or(VmError::TypeMismatch {
        expected: "int",
        actual: value.kind_name(),
    })
}

fn expect_bool(value: &Value) -> Result<bool, VmError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::I64(v) => Ok(*v != 0),
        other => Err(VmError::TypeMismatch {
            expected: "bool",
            actual: other.kind_name(),
        }),
    }
}

fn expect_func(value: &Value) -> Result<&VmFunction, VmError> {
    match value {
        Value::Func(f) => Ok(f),
        other => Err(VmError::TypeMismatch {
            expected: "function",
            actual: other.kind_name(),
        }),
    }
}

fn expect_indices(args: &[Value]) -> Result<Vec<i64>, VmError> {
    args.iter().map(expect_i64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ExecBuilder;
    use crate::exec::Arg;
    use crate::kernel::{StaticKernelRegistry, native_fn};
    use crate::memory::{Allocator, AllocatorKind, MemoryManager};
    use crate::value::{DType, Tensor, tensor_byte_size};
    use crate::value::{VM_REGISTER, VOID_REGISTER};
    use alloc::vec;
    use core::cell::RefCell;

    struct HostAllocator;
    impl Allocator for HostAllocator {
        fn kind(&self) -> AllocatorKind {
            AllocatorKind::Naive
        }
        fn empty(&self, shape: &[i64], dtype: DType, device: Device) -> Tensor {
            Tensor::new(
                shape.to_vec(),
                dtype,
                device,
                vec![0u8; tensor_byte_size(shape, dtype)],
            )
        }
    }

    struct HostMemory;
    impl MemoryManager for HostMemory {
        fn get_or_create_allocator(
            &self,
            _device: Device,
            _kind: AllocatorKind,
        ) -> Rc<dyn Allocator> {
            Rc::new(HostAllocator)
        }
    }

    fn arith_registry() -> StaticKernelRegistry {
        let mut reg = StaticKernelRegistry::new();
        reg.register("native_add", native_fn(|args| {
            let a = args[0].as_i64().unwrap();
            let b = args[1].as_i64().unwrap();
            Ok(Value::I64(a + b))
        }));
        reg.register("native_mul", native_fn(|args| {
            let a = args[0].as_i64().unwrap();
            let b = args[1].as_i64().unwrap();
            Ok(Value::I64(a * b))
        }));
        reg
    }

    fn boot(exec: Rc<Executable>, registry: StaticKernelRegistry) -> VirtualMachine {
        let mut vm = VirtualMachine::new(Rc::new(HostMemory), Rc::new(registry));
        vm.load_executable(exec);
        vm.init(&[(Device::CPU, AllocatorKind::Pooled)]).unwrap();
        vm
    }

    /// main(x): Ret r0
    fn identity_exec() -> Rc<Executable> {
        let mut b = ExecBuilder::new();
        b.begin_function("main", 1, 1, &["x"]);
        b.emit_ret(0);
        b.build().unwrap()
    }

    /// main(x): r1 = add(r0, 3); r2 = mul(r1, 2); Ret r2
    fn two_call_exec() -> Rc<Executable> {
        let mut b = ExecBuilder::new();
        let add = b.declare_native("native_add", 2);
        let mul = b.declare_native("native_mul", 2);
        b.begin_function("main", 1, 3, &["x"]);
        b.emit_call(1, add, &[Arg::Register(0), Arg::Immediate(3)]);
        b.emit_call(2, mul, &[Arg::Register(1), Arg::Immediate(2)]);
        b.emit_ret(2);
        b.build().unwrap()
    }

    #[test]
    fn identity_function_returns_its_argument() {
        let mut vm = boot(identity_exec(), StaticKernelRegistry::new());
        let idx = vm.executable().unwrap().find_func("main").unwrap();
        let out = vm.invoke_bytecode(idx, &[Value::I64(7)]).unwrap();
        assert_eq!(out, Value::I64(7));
    }

    #[test]
    fn straight_line_two_call() {
        let mut vm = boot(two_call_exec(), arith_registry());
        let idx = vm.executable().unwrap().find_func("main").unwrap();
        let out = vm.invoke_bytecode(idx, &[Value::I64(5)]).unwrap();
        assert_eq!(out, Value::I64(16));
    }

    #[test]
    fn frame_stack_balances_and_frames_recycle() {
        let mut vm = boot(two_call_exec(), arith_registry());
        let idx = vm.executable().unwrap().find_func("main").unwrap();

        vm.invoke_bytecode(idx, &[Value::I64(1)]).unwrap();
        assert!(vm.frames.is_empty());
        assert_eq!(vm.free_frames.len(), 1);

        vm.invoke_bytecode(idx, &[Value::I64(2)]).unwrap();
        assert!(vm.frames.is_empty());
        // The same frame went around again.
        assert_eq!(vm.free_frames.len(), 1);
    }

    #[test]
    fn repeat_invocation_is_deterministic() {
        let mut vm = boot(two_call_exec(), arith_registry());
        let idx = vm.executable().unwrap().find_func("main").unwrap();
        let a = vm.invoke_bytecode(idx, &[Value::I64(9)]).unwrap();
        let b = vm.invoke_bytecode(idx, &[Value::I64(9)]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn conditional_takes_both_branches() {
        // main(c): If r0 (+2); Goto +2; Ret r1=10; Ret r2=20
        let mut b = ExecBuilder::new();
        let ten = b.declare_native("const_ten", 0);
        let twenty = b.declare_native("const_twenty", 0);
        b.begin_function("main", 1, 3, &["c"]);
        b.emit_if(0, 2);
        b.emit_goto(2);
        b.emit_call(1, twenty, &[]);
        b.emit_ret(1);
        b.emit_call(2, ten, &[]);
        b.emit_ret(2);
        let exec = b.build().unwrap();

        let mut reg = StaticKernelRegistry::new();
        reg.register("const_ten", native_fn(|_| Ok(Value::I64(10))));
        reg.register("const_twenty", native_fn(|_| Ok(Value::I64(20))));
        let mut vm = boot(exec, reg);
        let idx = vm.executable().unwrap().find_func("main").unwrap();

        assert_eq!(vm.invoke_bytecode(idx, &[Value::I64(1)]).unwrap(), Value::I64(10));
        assert_eq!(vm.invoke_bytecode(idx, &[Value::I64(0)]).unwrap(), Value::I64(20));
    }

    #[test]
    fn call_into_void_register_discards_the_return() {
        let mut b = ExecBuilder::new();
        let add = b.declare_native("native_add", 2);
        b.begin_function("main", 1, 1, &["x"]);
        b.emit_call(VOID_REGISTER, add, &[Arg::Register(0), Arg::Immediate(1)]);
        b.emit_ret(0);
        let exec = b.build().unwrap();

        let mut vm = boot(exec, arith_registry());
        let idx = vm.executable().unwrap().find_func("main").unwrap();
        assert_eq!(vm.invoke_bytecode(idx, &[Value::I64(4)]).unwrap(), Value::I64(4));
    }

    #[test]
    fn context_register_reads_as_the_vm_identity() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in_kernel = seen.clone();

        let mut b = ExecBuilder::new();
        let probe = b.declare_native("probe", 1);
        b.begin_function("main", 0, 1, &[]);
        b.emit_call(0, probe, &[Arg::Register(VM_REGISTER)]);
        b.emit_ret(0);
        let exec = b.build().unwrap();

        let mut reg = StaticKernelRegistry::new();
        reg.register("probe", native_fn(move |args| {
            seen_in_kernel.borrow_mut().push(args[0].clone());
            Ok(Value::Null)
        }));
        let mut vm = boot(exec, reg);
        let idx = vm.executable().unwrap().find_func("main").unwrap();
        let expected = Value::VmContext(vm.id());

        vm.invoke_bytecode(idx, &[]).unwrap();
        assert_eq!(&*seen.borrow(), &[expected]);
    }

    #[test]
    fn native_not_found_fails_at_init() {
        let mut b = ExecBuilder::new();
        b.declare_native("no_such_kernel", 0);
        b.begin_function("main", 0, 1, &[]);
        b.emit_ret(0);
        let exec = b.build().unwrap();

        let mut vm = VirtualMachine::new(
            Rc::new(HostMemory),
            Rc::new(StaticKernelRegistry::new()),
        );
        vm.load_executable(exec);
        assert_eq!(
            vm.init(&[(Device::CPU, AllocatorKind::Naive)]).unwrap_err(),
            VmError::NativeNotFound(String::from("no_such_kernel"))
        );
    }

    #[test]
    fn stateful_flow_and_output_walks() {
        let mut vm = boot(two_call_exec(), arith_registry());

        assert_eq!(
            vm.invoke_stateful("main").unwrap_err(),
            VmError::NoInputsSet(String::from("main"))
        );
        assert_eq!(
            vm.get_output("main", &[]).unwrap_err(),
            VmError::NoOutputSaved(String::from("main"))
        );

        vm.set_input("main", &[Value::I64(5)]).unwrap();
        vm.invoke_stateful("main").unwrap();
        assert_eq!(vm.get_output("main", &[]).unwrap(), Value::I64(16));
        assert_eq!(vm.get_output_arity("main", &[]).unwrap(), -1);
        assert_eq!(vm.get_output("main", &[0]).unwrap_err(), VmError::NotAnArray);
    }

    #[test]
    fn function_metadata_queries() {
        let mut vm = boot(two_call_exec(), arith_registry());
        assert_eq!(vm.get_function_arity("main").unwrap(), 1);
        assert_eq!(vm.get_function_param_name("main", 0).unwrap(), "x");
        assert!(matches!(
            vm.get_function_param_name("main", 3),
            Err(VmError::IndexOutOfBounds { .. })
        ));
        assert_eq!(
            vm.module_call("get_function_arity", &[Value::Str("main".into())])
                .unwrap(),
            Value::I64(1)
        );
    }

    #[test]
    fn instrument_wraps_calls_and_can_skip() {
        let events: Rc<RefCell<Vec<(String, bool, Value)>>> = Rc::new(RefCell::new(Vec::new()));
        let log = events.clone();

        let mut vm = boot(two_call_exec(), arith_registry());
        vm.set_instrument(VmFunction::Native(native_fn(move |args| {
            let name = args[1].as_str().unwrap().to_string();
            let before = matches!(args[2], Value::Bool(true));
            log.borrow_mut().push((name.clone(), before, args[3].clone()));
            if name == "native_mul" && before {
                return Ok(Value::I64(InstrumentAction::SkipRun.code()));
            }
            Ok(Value::I64(InstrumentAction::NoOp.code()))
        })));

        let idx = vm.executable().unwrap().find_func("main").unwrap();
        // mul is skipped, so r2 stays null and the Ret yields null.
        let out = vm.invoke_bytecode(idx, &[Value::I64(5)]).unwrap();
        assert_eq!(out, Value::Null);

        let events = events.borrow();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], (String::from("native_add"), true, Value::Null));
        assert_eq!(events[1].0, "native_add");
        assert!(!events[1].1);
        assert_eq!(events[1].2, Value::I64(8));
        assert_eq!(events[2], (String::from("native_mul"), true, Value::Null));
    }

    #[test]
    fn saved_closures_bind_trailing_arguments() {
        let mut vm = boot(two_call_exec(), arith_registry());
        vm.save_function("main", "main_with_5", true, &[Value::I64(5)])
            .unwrap();
        let saved = vm.get_closure("main_with_5").unwrap();
        let out = vm
            .invoke_closure(&VmFunction::Closure(saved), &[])
            .unwrap();
        assert_eq!(out, Value::I64(16));

        vm.save_function("main", "silent", false, &[Value::I64(5)])
            .unwrap();
        let silent = vm.get_closure("silent").unwrap();
        let out = vm.invoke_closure(&VmFunction::Closure(silent), &[]).unwrap();
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn lookup_function_resolves_closures_and_tolerates_missing_names() {
        let vm = boot(identity_exec(), StaticKernelRegistry::new());
        let found = vm.lookup_function("main").unwrap();
        assert!(matches!(found, Some(VmFunction::Closure(_))));
        assert!(vm.lookup_function("missing").unwrap().is_none());
    }

    #[test]
    fn init_records_devices_and_allocators() {
        let vm = boot(identity_exec(), StaticKernelRegistry::new());
        assert_eq!(vm.devices(), &[Device::CPU]);
        assert!(vm.allocator(0).is_some());
        assert!(vm.allocator(1).is_none());
    }

    #[test]
    fn module_call_rejects_unknown_operations() {
        let mut vm = boot(identity_exec(), StaticKernelRegistry::new());
        assert!(matches!(
            vm.module_call("no_such_op", &[]),
            Err(VmError::UnknownFunction(_))
        ));
    }
}
