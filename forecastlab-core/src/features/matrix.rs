//! Dense row-major feature matrix.

use super::FeatureError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    columns: Vec<String>,
    rows: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    pub fn new(columns: Vec<String>, rows: usize, data: Vec<f64>) -> Result<Self, FeatureError> {
        if data.len() != rows * columns.len() {
            return Err(FeatureError::ShapeMismatch {
                expected: rows * columns.len(),
                actual: data.len(),
            });
        }
        Ok(Self { columns, rows, data })
    }

    pub(crate) fn from_flat(columns: Vec<String>, rows: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), rows * columns.len());
        Self { columns, rows, data }
    }

    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: 0,
            data: Vec::new(),
        }
    }

    /// Build from row vectors; every row must have one value per column.
    pub fn from_rows(columns: Vec<String>, rows: &[Vec<f64>]) -> Result<Self, FeatureError> {
        let width = columns.len();
        let mut data = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(FeatureError::ShapeMismatch {
                    expected: width,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            columns,
            rows: rows.len(),
            data,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.rows
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, i: usize) -> &[f64] {
        let w = self.n_cols();
        &self.data[i * w..(i + 1) * w]
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.n_cols() + col]
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, col)).collect()
    }

    pub fn column_by_name(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.column(idx))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Copy out a contiguous block of rows.
    pub fn slice_rows(&self, range: Range<usize>) -> Self {
        let w = self.n_cols();
        let end = range.end.min(self.rows);
        let start = range.start.min(end);
        Self {
            columns: self.columns.clone(),
            rows: end - start,
            data: self.data[start * w..end * w].to_vec(),
        }
    }

    /// Copy out the rows at `indices`, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.n_cols());
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            columns: self.columns.clone(),
            rows: indices.len(),
            data,
        }
    }

    /// Number of `NaN` cells.
    pub fn missing_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_nan()).count()
    }

    /// Replace every `NaN` cell with `value`, returning how many were replaced.
    pub fn fill_missing(&mut self, value: f64) -> usize {
        let mut n = 0;
        for v in self.data.iter_mut().filter(|v| v.is_nan()) {
            *v = value;
            n += 1;
        }
        n
    }
}
