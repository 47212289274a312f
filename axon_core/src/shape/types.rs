use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Element types carried by tensors moving through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Float16,
    Int32,
    Int64,
    UInt8,
    Bool,
    /// Variable-length strings. Byte size is not comparable, so string
    /// inputs are exempt from size validation.
    String,
}

impl DataType {
    /// Size of one element in bytes, `None` for variable-length types.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DataType::Float32 | DataType::Int32 => Some(4),
            DataType::Float16 => Some(2),
            DataType::Int64 => Some(8),
            DataType::UInt8 | DataType::Bool => Some(1),
            DataType::String => None,
        }
    }
}

/// Dimension value meaning "unknown until runtime".
pub const DIM_UNKNOWN: i64 = -1;

/// Shape and element type of one tensor. Produced at compile time with
/// possibly unknown dimensions, refined at runtime by shape inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dims: Vec<i64>,
    pub dtype: DataType,
}

impl TensorDesc {
    pub fn new(dims: Vec<i64>, dtype: DataType) -> Self {
        TensorDesc { dims, dtype }
    }

    /// A scalar (rank-0) descriptor.
    pub fn scalar(dtype: DataType) -> Self {
        TensorDesc { dims: Vec::new(), dtype }
    }

    /// A descriptor whose shape is entirely unknown at compile time.
    pub fn unknown() -> Self {
        TensorDesc {
            dims: vec![DIM_UNKNOWN],
            dtype: DataType::Float32,
        }
    }

    /// Whether every dimension is concrete.
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|&d| d >= 0)
    }

    /// Number of elements, `None` while any dimension is unknown.
    pub fn element_count(&self) -> Option<usize> {
        if !self.is_static() {
            return None;
        }
        Some(self.dims.iter().product::<i64>() as usize)
    }

    /// Total byte size, `None` while the shape is symbolic or the element
    /// type has no fixed size.
    pub fn size_bytes(&self) -> Option<usize> {
        let elems = self.element_count()?;
        let elem_size = self.dtype.element_size()?;
        Some(elems * elem_size)
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:?}", self.dtype, self.dims)
    }
}

/// A produced tensor: resolved descriptor plus the backing buffer. Buffers
/// are shared by reference between the producing node and its consumers.
#[derive(Debug, Clone)]
pub struct TensorValue {
    pub desc: TensorDesc,
    pub data: Arc<Vec<u8>>,
}

impl TensorValue {
    pub fn new(desc: TensorDesc, data: Vec<u8>) -> Self {
        TensorValue {
            desc,
            data: Arc::new(data),
        }
    }

    /// Scalar i32 tensor.
    pub fn from_i32(v: i32) -> Self {
        TensorValue::new(TensorDesc::scalar(DataType::Int32), v.to_ne_bytes().to_vec())
    }

    /// Scalar i64 tensor.
    pub fn from_i64(v: i64) -> Self {
        TensorValue::new(TensorDesc::scalar(DataType::Int64), v.to_ne_bytes().to_vec())
    }

    /// Scalar f32 tensor.
    pub fn from_f32(v: f32) -> Self {
        TensorValue::new(TensorDesc::scalar(DataType::Float32), v.to_ne_bytes().to_vec())
    }

    /// Read the first element as i64, for scalar control decisions.
    pub fn scalar_i64(&self) -> Option<i64> {
        match self.desc.dtype {
            DataType::Int32 => {
                let bytes: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
                Some(i32::from_ne_bytes(bytes) as i64)
            }
            DataType::Int64 => {
                let bytes: [u8; 8] = self.data.get(..8)?.try_into().ok()?;
                Some(i64::from_ne_bytes(bytes))
            }
            DataType::UInt8 | DataType::Bool => self.data.first().map(|&b| b as i64),
            _ => None,
        }
    }

    /// Read the first element as f64, for scalar control decisions.
    pub fn scalar_f64(&self) -> Option<f64> {
        match self.desc.dtype {
            DataType::Float32 => {
                let bytes: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
                Some(f32::from_ne_bytes(bytes) as f64)
            }
            _ => self.scalar_i64().map(|v| v as f64),
        }
    }

    /// Actual buffer size in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}
