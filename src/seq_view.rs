//! Borrowed views over caller-owned vector columns.
//!
//! A column is either a fixed-width array (every row has `dim` elements) or a
//! variable-length array described by an offset table. The index families only
//! consume `f32` rows; [`RowBatch::from_column`] validates the shape and
//! converts `f64` input on the way in.

use std::borrow::Cow;

use crate::IndexError;

/// Element type of a [`PrimitiveSlice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    Float32,
    Float64,
    Int32,
    Int64,
    UInt8,
}

/// Typed borrowed buffer.
#[derive(Debug, Clone, Copy)]
pub enum PrimitiveSlice<'a> {
    Float32(&'a [f32]),
    Float64(&'a [f64]),
    Int32(&'a [i32]),
    Int64(&'a [i64]),
    UInt8(&'a [u8]),
}

impl<'a> PrimitiveSlice<'a> {
    pub fn primitive_type(&self) -> PrimitiveType {
        match self {
            PrimitiveSlice::Float32(_) => PrimitiveType::Float32,
            PrimitiveSlice::Float64(_) => PrimitiveType::Float64,
            PrimitiveSlice::Int32(_) => PrimitiveType::Int32,
            PrimitiveSlice::Int64(_) => PrimitiveType::Int64,
            PrimitiveSlice::UInt8(_) => PrimitiveType::UInt8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PrimitiveSlice::Float32(s) => s.len(),
            PrimitiveSlice::Float64(s) => s.len(),
            PrimitiveSlice::Int32(s) => s.len(),
            PrimitiveSlice::Int64(s) => s.len(),
            PrimitiveSlice::UInt8(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_f32(self) -> Result<Cow<'a, [f32]>, IndexError> {
        match self {
            PrimitiveSlice::Float32(s) => Ok(Cow::Borrowed(s)),
            PrimitiveSlice::Float64(s) => Ok(Cow::Owned(s.iter().map(|v| *v as f32).collect())),
            other => Err(IndexError::invalid_parameter(
                "column",
                format!("vector elements must be floating point, got {:?}", other.primitive_type()),
            )),
        }
    }
}

/// A column of vectors passed to [`crate::IndexBuilder::add`].
#[derive(Debug, Clone, Copy)]
pub enum ColumnView<'a> {
    /// Fixed-width rows packed back to back.
    Array { data: PrimitiveSlice<'a>, dim: usize },
    /// Row `i` spans `data[offsets[i]..offsets[i + 1]]`.
    VlArray {
        data: PrimitiveSlice<'a>,
        offsets: &'a [u32],
    },
}

impl<'a> ColumnView<'a> {
    pub fn array_f32(data: &'a [f32], dim: usize) -> Self {
        ColumnView::Array {
            data: PrimitiveSlice::Float32(data),
            dim,
        }
    }

    pub fn array_f64(data: &'a [f64], dim: usize) -> Self {
        ColumnView::Array {
            data: PrimitiveSlice::Float64(data),
            dim,
        }
    }

    pub fn vl_array_f32(data: &'a [f32], offsets: &'a [u32]) -> Self {
        ColumnView::VlArray {
            data: PrimitiveSlice::Float32(data),
            offsets,
        }
    }

    /// Number of rows, as far as the shape can tell without validation.
    pub fn num_rows(&self) -> usize {
        match self {
            ColumnView::Array { data, dim } if *dim > 0 => data.len() / dim,
            ColumnView::Array { .. } => 0,
            ColumnView::VlArray { offsets, .. } => offsets.len().saturating_sub(1),
        }
    }
}

/// Validated row-major `f32` rows of a fixed dimension.
#[derive(Debug, Clone)]
pub(crate) struct RowBatch<'a> {
    pub data: Cow<'a, [f32]>,
    pub dim: usize,
}

impl<'a> RowBatch<'a> {
    pub fn from_column(column: &ColumnView<'a>, expected_dim: usize) -> Result<Self, IndexError> {
        match *column {
            ColumnView::Array { data, dim } => {
                if dim != expected_dim {
                    return Err(IndexError::DimensionMismatch {
                        row: None,
                        expected: expected_dim,
                        actual: dim,
                    });
                }
                let len = data.len();
                if len % dim != 0 {
                    return Err(IndexError::DimensionMismatch {
                        row: Some(len / dim),
                        expected: dim,
                        actual: len % dim,
                    });
                }
                Ok(Self {
                    data: data.to_f32()?,
                    dim,
                })
            }
            ColumnView::VlArray { data, offsets } => {
                if offsets.is_empty() {
                    return Err(IndexError::invalid_parameter(
                        "offsets",
                        "variable-length column needs at least one offset",
                    ));
                }
                for (row, bounds) in offsets.windows(2).enumerate() {
                    let (start, end) = (bounds[0] as usize, bounds[1] as usize);
                    if end < start || end > data.len() {
                        return Err(IndexError::invalid_parameter(
                            "offsets",
                            format!("row {row} spans {start}..{end} outside of {} elements", data.len()),
                        ));
                    }
                    if end - start != expected_dim {
                        return Err(IndexError::DimensionMismatch {
                            row: Some(row),
                            expected: expected_dim,
                            actual: end - start,
                        });
                    }
                }
                let first = offsets[0] as usize;
                let last = offsets[offsets.len() - 1] as usize;
                let values = data.to_f32()?;
                let data = match values {
                    Cow::Borrowed(s) => Cow::Borrowed(&s[first..last]),
                    Cow::Owned(v) => Cow::Owned(v[first..last].to_vec()),
                };
                Ok(Self {
                    data,
                    dim: expected_dim,
                })
            }
        }
    }

    pub fn num_rows(&self) -> usize {
        self.data.len() / self.dim
    }

    #[cfg(test)]
    pub fn row(&self, idx: usize) -> &[f32] {
        &self.data[idx * self.dim..(idx + 1) * self.dim]
    }

    pub fn rows(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_rows_are_borrowed() {
        let values = [1.0f32, 2.0, 3.0, 4.0];
        let column = ColumnView::array_f32(&values, 2);
        let batch = RowBatch::from_column(&column, 2).unwrap();
        assert!(matches!(batch.data, Cow::Borrowed(_)));
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn f64_rows_are_converted() {
        let values = [1.5f64, -2.0];
        let batch = RowBatch::from_column(&ColumnView::array_f64(&values, 2), 2).unwrap();
        assert_eq!(batch.row(0), &[1.5f32, -2.0]);
    }

    #[test]
    fn dimension_mismatches_are_reported() {
        let values = [1.0f32, 2.0, 3.0];
        assert!(matches!(
            RowBatch::from_column(&ColumnView::array_f32(&values, 3), 2),
            Err(IndexError::DimensionMismatch { row: None, expected: 2, actual: 3 })
        ));
        assert!(matches!(
            RowBatch::from_column(&ColumnView::array_f32(&values, 2), 2),
            Err(IndexError::DimensionMismatch { row: Some(1), expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn variable_length_rows_are_checked_individually() {
        let values = [1.0f32, 2.0, 3.0, 4.0, 5.0];
        let offsets = [0u32, 2, 5];
        assert!(matches!(
            RowBatch::from_column(&ColumnView::vl_array_f32(&values, &offsets), 2),
            Err(IndexError::DimensionMismatch { row: Some(1), expected: 2, actual: 3 })
        ));

        let offsets = [1u32, 3, 5];
        let batch = RowBatch::from_column(&ColumnView::vl_array_f32(&values, &offsets), 2).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.row(0), &[2.0, 3.0]);
    }

    #[test]
    fn integer_columns_are_rejected() {
        let values = [1i32, 2];
        let column = ColumnView::Array {
            data: PrimitiveSlice::Int32(&values),
            dim: 2,
        };
        assert!(matches!(
            RowBatch::from_column(&column, 2),
            Err(IndexError::InvalidParameter { .. })
        ));
    }
}
