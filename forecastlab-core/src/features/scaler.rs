use super::matrix::FeatureMatrix;
use super::FeatureError;
use serde::{Deserialize, Serialize};

/// Per-column standardization: `(x - mean) / std`, with population std.
///
/// Missing cells are ignored when fitting and stay missing after transform.
/// A constant column (std = 0) gets scale 1 so it maps to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub columns: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl Scaler {
    pub fn fit(matrix: &FeatureMatrix) -> Self {
        let mut means = Vec::with_capacity(matrix.n_cols());
        let mut scales = Vec::with_capacity(matrix.n_cols());
        for c in 0..matrix.n_cols() {
            let values: Vec<f64> = matrix.column(c).into_iter().filter(|v| v.is_finite()).collect();
            if values.is_empty() {
                means.push(0.0);
                scales.push(1.0);
                continue;
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            means.push(mean);
            scales.push(if std > f64::EPSILON * mean.abs().max(1.0) { std } else { 1.0 });
        }
        Self {
            columns: matrix.columns().to_vec(),
            means,
            scales,
        }
    }

    pub fn transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix, FeatureError> {
        if matrix.columns() != self.columns.as_slice() {
            return Err(FeatureError::ColumnMismatch {
                expected: self.columns.clone(),
                actual: matrix.columns().to_vec(),
            });
        }
        Ok(self.apply(matrix))
    }

    pub fn fit_transform(matrix: &FeatureMatrix) -> (Self, FeatureMatrix) {
        let scaler = Self::fit(matrix);
        let out = scaler.apply(matrix);
        (scaler, out)
    }

    fn apply(&self, matrix: &FeatureMatrix) -> FeatureMatrix {
        let mut out = matrix.clone();
        let w = self.columns.len().max(1);
        for (i, v) in out.as_mut_slice().iter_mut().enumerate() {
            let c = i % w;
            *v = (*v - self.means[c]) / self.scales[c];
        }
        out
    }
}
