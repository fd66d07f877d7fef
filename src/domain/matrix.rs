//! Dense row-major covariate matrix.

use serde::{Deserialize, Serialize};

use super::error::AnalysisError;

/// Dense row-major matrix of covariates (one row per unit)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    /// Build from row-major data; `data.len()` must equal `n_rows * n_cols`
    pub fn new(n_rows: usize, n_cols: usize, data: Vec<f64>) -> Result<Self, AnalysisError> {
        if data.len() != n_rows * n_cols {
            return Err(AnalysisError::DataValidation(format!(
                "feature matrix has wrong length: expected {}x{}={}, got {}",
                n_rows,
                n_cols,
                n_rows * n_cols,
                data.len()
            )));
        }
        Ok(Self { n_rows, n_cols, data })
    }

    /// Build from a list of rows, all of the same width
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, AnalysisError> {
        let n_cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * n_cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_cols {
                return Err(AnalysisError::DataValidation(format!(
                    "feature matrix must be rectangular: row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    n_cols
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            n_rows: rows.len(),
            n_cols,
            data,
        })
    }

    pub fn empty(n_cols: usize) -> Self {
        Self {
            n_rows: 0,
            n_cols,
            data: Vec::new(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.n_cols + col]
    }

    #[inline]
    pub fn row(&self, row: usize) -> &[f64] {
        let start = row * self.n_cols;
        &self.data[start..start + self.n_cols]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.n_rows).map(move |i| self.row(i))
    }

    /// Copy of one column
    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.n_rows).map(|i| self.get(i, col)).collect()
    }

    /// New matrix with the given rows, in the given order (repeats allowed)
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * self.n_cols);
        for &r in rows {
            data.extend_from_slice(self.row(r));
        }
        Self {
            n_rows: rows.len(),
            n_cols: self.n_cols,
            data,
        }
    }

    /// New matrix with the given columns, in the given order
    pub fn select_columns(&self, cols: &[usize]) -> Self {
        let mut data = Vec::with_capacity(self.n_rows * cols.len());
        for i in 0..self.n_rows {
            let row = self.row(i);
            data.extend(cols.iter().map(|&c| row[c]));
        }
        Self {
            n_rows: self.n_rows,
            n_cols: cols.len(),
            data,
        }
    }

    /// True when every value of the row is finite
    pub fn row_is_complete(&self, row: usize) -> bool {
        self.row(row).iter().all(|v| v.is_finite())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}
