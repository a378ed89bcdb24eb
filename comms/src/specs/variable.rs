use serde::{Deserialize, Serialize};

/// The logical element type of a variable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    Bf16,
    F32,
    F64,
}

impl DType {
    /// Returns the size in bytes of a single element of this type.
    pub fn size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::I16 | DType::F16 | DType::Bf16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

/// The memory layout kind of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// A flat row-major buffer.
    Dense,
    /// A subset of rows of a taller tensor, addressed by `VarMeta::rows`.
    SparseRow,
}

/// The description of a single variable inside a `VarBatch`.
///
/// Its raw bytes live in the batch data blob, right after the bytes of
/// the previous variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarMeta {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<i64>,
    pub layout: Layout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    /// Length in bytes of this variable's data.
    pub len: usize,
}

impl VarMeta {
    /// Creates the metadata of a dense variable.
    ///
    /// # Arguments
    /// * `name` - The variable name.
    /// * `dtype` - The element type.
    /// * `shape` - The tensor dimensions.
    ///
    /// # Returns
    /// A new `VarMeta` whose `len` is derived from the shape and type.
    pub fn dense(name: impl Into<String>, dtype: DType, shape: Vec<i64>) -> Self {
        let len = numel(&shape).unwrap_or_default() * dtype.size();

        Self {
            name: name.into(),
            dtype,
            shape,
            layout: Layout::Dense,
            rows: None,
            height: None,
            len,
        }
    }

    /// Creates the metadata of a sparse-row variable.
    ///
    /// # Arguments
    /// * `name` - The variable name.
    /// * `dtype` - The element type of the row values.
    /// * `shape` - The shape of the row values, its first dimension is `rows.len()`.
    /// * `rows` - The populated row indices.
    /// * `height` - The height of the full tensor.
    ///
    /// # Returns
    /// A new `VarMeta` whose `len` is derived from the shape and type.
    pub fn sparse_row(
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<i64>,
        rows: Vec<i64>,
        height: i64,
    ) -> Self {
        Self {
            layout: Layout::SparseRow,
            rows: Some(rows),
            height: Some(height),
            ..Self::dense(name, dtype, shape)
        }
    }

    /// Returns the amount of elements described by the shape, `None` if any dimension is negative.
    pub fn numel(&self) -> Option<usize> {
        numel(&self.shape)
    }
}

fn numel(shape: &[i64]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        let dim = usize::try_from(dim).ok()?;
        acc.checked_mul(dim)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_len_follows_shape() {
        let meta = VarMeta::dense("x", DType::F32, vec![1, 10]);
        assert_eq!(meta.len, 40);
        assert_eq!(meta.numel(), Some(10));
    }

    #[test]
    fn test_negative_dimension_has_no_numel() {
        let meta = VarMeta::dense("x", DType::F32, vec![2, -1]);
        assert_eq!(meta.numel(), None);
        assert_eq!(meta.len, 0);
    }

    #[test]
    fn test_layout_wire_names() {
        let meta = VarMeta::sparse_row("w", DType::Bf16, vec![2, 3], vec![1, 4], 8);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["layout"], "sparse_row");
        assert_eq!(json["dtype"], "bf16");
        assert_eq!(json["len"], 12);
    }
}
