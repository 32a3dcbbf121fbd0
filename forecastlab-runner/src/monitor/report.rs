//! Fixed-schema drift report, one per evaluated window.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Dataset-level drift: either a flag or a drifted-column share in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetDrift {
    Detected(bool),
    Score(f64),
}

impl DatasetDrift {
    /// A flag fires when set; a score fires when strictly above `threshold`.
    pub fn exceeds(&self, threshold: f64) -> bool {
        match *self {
            DatasetDrift::Detected(flag) => flag,
            DatasetDrift::Score(score) => score > threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMetric {
    Rmse,
    Mae,
}

impl ErrorMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorMetric::Rmse => "rmse",
            ErrorMetric::Mae => "mae",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub window_start: NaiveDateTime,
    pub window_end: NaiveDateTime,
    pub row_count: usize,
    pub dataset_drift: DatasetDrift,
    pub drifted_columns: usize,
    pub column_count: usize,
    /// KS distance between reference and current prediction distributions.
    pub prediction_drift: f64,
    pub missing_share: f64,
    pub rmse: Option<f64>,
    pub mae: Option<f64>,
    pub model_version: u32,
    pub drift_detected: bool,
}

impl DriftReport {
    /// rmse when present, otherwise mae.
    pub fn applicable_error(&self) -> Option<(ErrorMetric, f64)> {
        self.rmse
            .map(|v| (ErrorMetric::Rmse, v))
            .or_else(|| self.mae.map(|v| (ErrorMetric::Mae, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_threshold_is_strict() {
        assert!(!DatasetDrift::Score(0.5).exceeds(0.5));
        assert!(DatasetDrift::Score(0.51).exceeds(0.5));
        assert!(DatasetDrift::Detected(true).exceeds(0.5));
        assert!(!DatasetDrift::Detected(false).exceeds(0.0));
    }

    #[test]
    fn rmse_takes_precedence_over_mae() {
        let mut r = DriftReport {
            window_start: NaiveDateTime::default(),
            window_end: NaiveDateTime::default(),
            row_count: 1,
            dataset_drift: DatasetDrift::Score(0.0),
            drifted_columns: 0,
            column_count: 6,
            prediction_drift: 0.0,
            missing_share: 0.0,
            rmse: Some(3.0),
            mae: Some(9.0),
            model_version: 1,
            drift_detected: false,
        };
        assert_eq!(r.applicable_error(), Some((ErrorMetric::Rmse, 3.0)));
        r.rmse = None;
        assert_eq!(r.applicable_error(), Some((ErrorMetric::Mae, 9.0)));
        r.mae = None;
        assert_eq!(r.applicable_error(), None);
    }
}
