//! Typed views over device buffers: dense tensors, sparse row tensors and the variables holding them.

use std::fmt;

use bytemuck::Pod;
pub use comms::specs::DType;
use half::{bf16, f16};

use crate::device::{DeviceBuffer, DeviceErr, Place};

/// Rust element types with a wire `DType`.
pub trait Element: Pod {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DType = DType::$dtype;
        })*
    };
}

impl_element! {
    u8 => U8,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f16 => F16,
    bf16 => Bf16,
    f32 => F32,
    f64 => F64,
}

/// A dense row-major tensor.
#[derive(Debug, Clone)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<i64>,
    buffer: DeviceBuffer,
}

impl Tensor {
    /// Wraps a buffer as a tensor.
    ///
    /// # Panics
    /// If the buffer length doesn't match `shape` and `dtype`.
    pub fn new(dtype: DType, shape: Vec<i64>, buffer: DeviceBuffer) -> Self {
        let expected = numel(&shape) * dtype.size();
        assert_eq!(
            buffer.len(),
            expected,
            "a {dtype:?} tensor of shape {shape:?} needs {expected} bytes"
        );

        Self {
            dtype,
            shape,
            buffer,
        }
    }

    /// Creates a host tensor from typed values.
    ///
    /// # Panics
    /// If `data.len()` doesn't match the amount of elements in `shape`.
    pub fn from_slice<T: Element>(shape: Vec<i64>, data: &[T]) -> Self {
        let buffer = DeviceBuffer::from_host(bytemuck::cast_slice(data));
        Self::new(T::DTYPE, shape, buffer)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn place(&self) -> Place {
        self.buffer.place()
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// Reads a host tensor back as typed values.
    ///
    /// # Returns
    /// The values or a `DeviceErr` when the tensor is not on the host.
    ///
    /// # Panics
    /// If `T` doesn't match the tensor's dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, DeviceErr> {
        assert_eq!(
            T::DTYPE,
            self.dtype,
            "can't read a {:?} tensor as {:?}",
            self.dtype,
            T::DTYPE
        );

        let bytes = self.buffer.to_host_vec()?;
        let mut out = vec![T::zeroed(); self.numel()];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&bytes);
        Ok(out)
    }
}

/// Selected rows of a taller tensor: `value` holds one row per entry of `rows`.
#[derive(Debug, Clone)]
pub struct SparseRows {
    height: i64,
    rows: Vec<i64>,
    value: Tensor,
}

impl SparseRows {
    /// Creates a new `SparseRows`.
    ///
    /// # Panics
    /// If the first dimension of `value` isn't `rows.len()`.
    pub fn new(height: i64, rows: Vec<i64>, value: Tensor) -> Self {
        assert_eq!(
            value.shape().first().copied(),
            Some(rows.len() as i64),
            "sparse rows value must hold one row per index"
        );

        Self {
            height,
            rows,
            value,
        }
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    pub fn rows(&self) -> &[i64] {
        &self.rows
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }
}

/// The kind of value a variable holds, fixed once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Dense,
    SparseRows,
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarKind::Dense => f.write_str("dense tensor"),
            VarKind::SparseRows => f.write_str("sparse rows tensor"),
        }
    }
}

/// The value stored under a name in a scope.
#[derive(Debug, Clone, Default)]
pub enum Variable {
    #[default]
    Uninit,
    Dense(Tensor),
    SparseRows(SparseRows),
}

impl Variable {
    /// The kind of value held, `None` while uninitialized.
    pub fn kind(&self) -> Option<VarKind> {
        match self {
            Variable::Uninit => None,
            Variable::Dense(_) => Some(VarKind::Dense),
            Variable::SparseRows(_) => Some(VarKind::SparseRows),
        }
    }

    pub fn as_dense(&self) -> Option<&Tensor> {
        match self {
            Variable::Dense(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_sparse_rows(&self) -> Option<&SparseRows> {
        match self {
            Variable::SparseRows(s) => Some(s),
            _ => None,
        }
    }
}

fn numel(shape: &[i64]) -> usize {
    shape.iter().map(|&d| d.max(0) as usize).product()
}
