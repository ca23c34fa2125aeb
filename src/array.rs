//! Per-replicate value arrays.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shape errors raised when constructing a [`BatchArray`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArrayError {
    #[error("Row width must be positive")]
    ZeroWidth,

    #[error("{len} values cannot be split into rows of width {width}")]
    RaggedValues {
        len: usize,
        width: usize,
    },

    #[error("Row {row} has width {actual}, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        actual: usize,
    },
}

/// A batch of per-replicate values.
///
/// Stored row-major: one row per replicate, every row `width` values wide.
/// A scalar node produces width-1 rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchArray {
    width: usize,
    values: Vec<f64>,
}

impl BatchArray {
    /// Creates an array from row-major values.
    pub fn new(width: usize, values: Vec<f64>) -> Result<Self, ArrayError> {
        if width == 0 {
            return Err(ArrayError::ZeroWidth);
        }
        if values.len() % width != 0 {
            return Err(ArrayError::RaggedValues {
                len: values.len(),
                width,
            });
        }
        Ok(Self { width, values })
    }

    /// One scalar per replicate.
    #[must_use]
    pub fn from_scalars(values: Vec<f64>) -> Self {
        Self { width: 1, values }
    }

    /// Builds an array from explicit rows, all of equal width.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ArrayError> {
        let width = rows.first().map_or(1, Vec::len);
        if width == 0 {
            return Err(ArrayError::ZeroWidth);
        }
        let mut values = Vec::with_capacity(width * rows.len());
        for (row, r) in rows.iter().enumerate() {
            if r.len() != width {
                return Err(ArrayError::RaggedRows {
                    row,
                    expected: width,
                    actual: r.len(),
                });
            }
            values.extend_from_slice(r);
        }
        Ok(Self { width, values })
    }

    /// Repeats `row` for every replicate.
    pub fn broadcast(row: &[f64], rows: usize) -> Result<Self, ArrayError> {
        if row.is_empty() {
            return Err(ArrayError::ZeroWidth);
        }
        let mut values = Vec::with_capacity(row.len() * rows);
        for _ in 0..rows {
            values.extend_from_slice(row);
        }
        Ok(Self {
            width: row.len(),
            values,
        })
    }

    /// Number of replicates (rows).
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len() / self.width
    }

    /// Returns true if the array has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Width of each row.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Row-major backing values.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// The values of replicate `index`.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        let start = index.checked_mul(self.width)?;
        self.values.get(start..start + self.width)
    }

    /// Iterates rows in replicate order.
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks_exact(self.width)
    }

    /// Applies `f` to every row, producing a width-1 array.
    #[must_use]
    pub fn map_rows(&self, f: impl Fn(&[f64]) -> f64) -> Self {
        Self::from_scalars(self.rows().map(f).collect())
    }

    /// Appends rows of another array of the same width.
    pub fn extend(&mut self, other: &Self) -> Result<(), ArrayError> {
        if other.width != self.width {
            return Err(ArrayError::RaggedRows {
                row: self.len(),
                expected: self.width,
                actual: other.width,
            });
        }
        self.values.extend_from_slice(&other.values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_ragged_values() {
        assert_eq!(
            BatchArray::new(3, vec![1.0; 4]).unwrap_err(),
            ArrayError::RaggedValues { len: 4, width: 3 }
        );
        assert_eq!(BatchArray::new(0, vec![]).unwrap_err(), ArrayError::ZeroWidth);
    }

    #[test]
    fn rows_and_len_follow_width() {
        let a = BatchArray::new(2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a.row(1), Some(&[3.0, 4.0][..]));
        assert_eq!(a.row(3), None);
        assert_eq!(a.rows().count(), 3);
    }

    #[test]
    fn from_rows_checks_width() {
        let err = BatchArray::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert_eq!(
            err,
            ArrayError::RaggedRows {
                row: 1,
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn broadcast_repeats_row() {
        let a = BatchArray::broadcast(&[0.5, 1.5], 3).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a.width(), 2);
        assert!(a.rows().all(|r| r == [0.5, 1.5]));
    }

    #[test]
    fn map_rows_reduces_to_scalars() {
        let a = BatchArray::new(2, vec![1.0, 3.0, 2.0, 6.0]).unwrap();
        let m = a.map_rows(|r| r.iter().sum::<f64>() / r.len() as f64);
        assert_eq!(m.values(), &[2.0, 4.0]);
        assert_eq!(m.width(), 1);
    }
}
