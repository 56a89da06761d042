// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Register values and the descriptors they carry.
//!
//! A register holds a [`Value`]: the dynamically-typed cell used for
//! registers, constants, and call arguments. Assigning a value is a copy at
//! the tag level; large payloads (tensor storage, arrays, callables) are
//! reference-counted and shared.
//!
//! Register names are plain indices into a frame's register file, except for
//! a small reserved range at and above [`BEGIN_SPECIAL_REG`]: writes there
//! are discarded, reading [`VOID_REGISTER`] yields [`Value::Null`], and
//! reading [`VM_REGISTER`] yields the VM context marker.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Ref, RefCell, RefMut};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::closure::VmFunction;
use crate::vm::VmError;

/// A register name within a frame.
pub type RegName = u32;

/// First reserved register name. Names at or above this boundary do not
/// address the register file.
pub const BEGIN_SPECIAL_REG: RegName = 1 << 30;

/// Writes are no-ops; reads yield [`Value::Null`].
pub const VOID_REGISTER: RegName = BEGIN_SPECIAL_REG;

/// Reads yield the VM context marker for the executing VM.
pub const VM_REGISTER: RegName = BEGIN_SPECIAL_REG + 1;

/// Data-type code for tensor elements.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DTypeCode {
    /// Signed integer.
    Int,
    /// Unsigned integer.
    UInt,
    /// IEEE 754 float.
    Float,
    /// Brain float.
    Bfloat,
}

/// A tensor element data type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DType {
    /// Element kind.
    pub code: DTypeCode,
    /// Bits per lane.
    pub bits: u8,
    /// Vector lanes per element (1 for scalar types).
    pub lanes: u16,
}

impl DType {
    /// Scalar signed integer type.
    #[must_use]
    pub const fn int(bits: u8) -> Self {
        Self {
            code: DTypeCode::Int,
            bits,
            lanes: 1,
        }
    }

    /// Scalar unsigned integer type.
    #[must_use]
    pub const fn uint(bits: u8) -> Self {
        Self {
            code: DTypeCode::UInt,
            bits,
            lanes: 1,
        }
    }

    /// Scalar float type.
    #[must_use]
    pub const fn float(bits: u8) -> Self {
        Self {
            code: DTypeCode::Float,
            bits,
            lanes: 1,
        }
    }

    /// Bytes occupied by one element (all lanes).
    #[must_use]
    pub const fn bytes_per_elem(self) -> usize {
        (self.bits as usize).div_ceil(8) * self.lanes as usize
    }
}

impl fmt::Display for DType {
    /// Renders the canonical string form, e.g. `float32`, `int8x4`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self.code {
            DTypeCode::Int => "int",
            DTypeCode::UInt => "uint",
            DTypeCode::Float => "float",
            DTypeCode::Bfloat => "bfloat",
        };
        write!(f, "{code}{}", self.bits)?;
        if self.lanes != 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}

/// The kind of device a tensor lives on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Host CPU.
    Cpu,
    /// CUDA device.
    Cuda,
    /// OpenCL device.
    OpenCl,
    /// Vulkan device.
    Vulkan,
    /// Metal device.
    Metal,
    /// ROCm device.
    Rocm,
    /// Any other device kind, by raw id.
    Other(i32),
}

impl DeviceType {
    /// Parses the integer encoding used by `vm_initialization` triples.
    #[must_use]
    pub fn from_index(v: i64) -> Self {
        match v {
            1 => Self::Cpu,
            2 => Self::Cuda,
            4 => Self::OpenCl,
            7 => Self::Vulkan,
            8 => Self::Metal,
            10 => Self::Rocm,
            other => Self::Other(other as i32),
        }
    }

    /// Returns the integer encoding of this device type.
    #[must_use]
    pub fn index(self) -> i64 {
        match self {
            Self::Cpu => 1,
            Self::Cuda => 2,
            Self::OpenCl => 4,
            Self::Vulkan => 7,
            Self::Metal => 8,
            Self::Rocm => 10,
            Self::Other(v) => i64::from(v),
        }
    }
}

/// A physical device identity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Device {
    /// Device kind.
    pub device_type: DeviceType,
    /// Ordinal within the kind.
    pub device_id: i32,
}

impl Device {
    /// Host CPU device 0.
    pub const CPU: Self = Self {
        device_type: DeviceType::Cpu,
        device_id: 0,
    };
}

/// Returns the byte size of a dense tensor of `shape` and `dtype`.
#[must_use]
pub fn tensor_byte_size(shape: &[i64], dtype: DType) -> usize {
    let elems: usize = shape
        .iter()
        .map(|&d| usize::try_from(d).unwrap_or(0))
        .product();
    elems * dtype.bytes_per_elem()
}

/// A dense n-dimensional array handle.
///
/// Storage is reference-counted; cloning a tensor aliases the same bytes.
/// The VM is single-threaded, so interior mutability uses [`RefCell`].
#[derive(Clone)]
pub struct Tensor {
    shape: Vec<i64>,
    dtype: DType,
    device: Device,
    storage: Rc<RefCell<Vec<u8>>>,
}

impl Tensor {
    /// Creates a tensor over `data`.
    ///
    /// `data` must hold exactly `tensor_byte_size(shape, dtype)` bytes.
    #[must_use]
    pub fn new(shape: Vec<i64>, dtype: DType, device: Device, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), tensor_byte_size(&shape, dtype));
        Self {
            shape,
            dtype,
            device,
            storage: Rc::new(RefCell::new(data)),
        }
    }

    /// Tensor shape.
    #[must_use]
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Element data type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device this tensor lives on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Borrows the raw bytes.
    #[must_use]
    pub fn bytes(&self) -> Ref<'_, Vec<u8>> {
        self.storage.borrow()
    }

    /// Mutably borrows the raw bytes.
    #[must_use]
    pub fn bytes_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.storage.borrow_mut()
    }

    /// Returns `true` if `other` aliases the same storage.
    #[must_use]
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    /// Copies the contents of `src` into this tensor.
    ///
    /// Shape and dtype must match; the devices may differ (this is the
    /// primitive the VM uses to move values onto its own device).
    pub fn copy_from(&self, src: &Tensor) -> Result<(), VmError> {
        if self.shape != src.shape || self.dtype != src.dtype {
            return Err(VmError::TypeMismatch {
                expected: "tensor with identical shape and dtype",
                actual: "tensor with a different layout",
            });
        }
        if Rc::ptr_eq(&self.storage, &src.storage) {
            return Ok(());
        }
        self.storage
            .borrow_mut()
            .copy_from_slice(&src.storage.borrow());
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// A stable identity for one VM instance.
///
/// Minted from a process-wide counter at construction; the context register
/// of a running VM always reads as the same id for the VM's lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VmId(u64);

impl VmId {
    pub(crate) fn mint() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A module handle whose parameters can be materialized on demand.
///
/// `set_input_with_param_module` calls [`ParamModule::get_params`] on the
/// trailing argument to produce the tail of the input list.
pub trait ParamModule {
    /// Materializes the module's parameters as a value (typically an array).
    fn get_params(&self) -> Result<Value, VmError>;
}

/// A dynamically-typed register value.
#[derive(Clone, Default)]
pub enum Value {
    /// Absent value. Freshly pushed registers read as null.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    I64(i64),
    /// 64-bit float.
    F64(f64),
    /// Data-type descriptor.
    DataType(DType),
    /// Device descriptor.
    Device(Device),
    /// Tensor handle.
    Tensor(Tensor),
    /// UTF-8 string.
    Str(String),
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// Array of values.
    Array(Rc<Vec<Value>>),
    /// A callable: native kernel or VM closure.
    Func(VmFunction),
    /// Module handle.
    Module(Rc<dyn ParamModule>),
    /// The VM context marker read from [`VM_REGISTER`].
    VmContext(VmId),
}

impl Value {
    /// Builds an array value from owned elements.
    #[must_use]
    pub fn array(values: Vec<Value>) -> Self {
        Self::Array(Rc::new(values))
    }

    /// A short name for this value's tag, used in error reports.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I64(_) => "int",
            Self::F64(_) => "float",
            Self::DataType(_) => "dtype",
            Self::Device(_) => "device",
            Self::Tensor(_) => "tensor",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
            Self::Func(_) => "function",
            Self::Module(_) => "module",
            Self::VmContext(_) => "vm context",
        }
    }

    /// Returns the integer payload, if this value has one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Returns the string payload, if this value has one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the tensor payload, if this value has one.
    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Returns the array payload, if this value has one.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::F64(a), Self::F64(b)) => a == b,
            (Self::DataType(a), Self::DataType(b)) => a == b,
            (Self::Device(a), Self::Device(b)) => a == b,
            (Self::Tensor(a), Self::Tensor(b)) => {
                a.same_storage(b) && a.shape() == b.shape() && a.dtype() == b.dtype()
            }
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Func(a), Self::Func(b)) => a.same_callable(b),
            (Self::Module(a), Self::Module(b)) => Rc::ptr_eq(a, b),
            (Self::VmContext(a), Self::VmContext(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::I64(v) => write!(f, "I64({v})"),
            Self::F64(v) => write!(f, "F64({v})"),
            Self::DataType(d) => write!(f, "DataType({d})"),
            Self::Device(d) => write!(f, "Device({d:?})"),
            Self::Tensor(t) => write!(f, "Tensor({:?}, {})", t.shape(), t.dtype()),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            Self::Array(a) => f.debug_tuple("Array").field(a).finish(),
            Self::Func(func) => write!(f, "Func({:?})", func.name()),
            Self::Module(_) => write!(f, "Module(..)"),
            Self::VmContext(id) => write!(f, "VmContext({id:?})"),
        }
    }
}
