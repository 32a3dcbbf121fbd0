//! Feature preparation: standardization, chronological splits and per-run artifacts.

pub mod artifacts;
pub mod matrix;
pub mod scaler;
pub mod split;
pub mod store;

pub use artifacts::{ArtifactError, ArtifactPaths, ArtifactStore};
pub use matrix::FeatureMatrix;
pub use scaler::Scaler;
pub use split::{chronological_split, ChronoSplit, Partition};
pub use store::{FeatureStore, PreparedData, ProcessedRow, FEATURE_COLUMNS, LABEL_COLUMN};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("shape mismatch: expected {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("column mismatch: expected {expected:?}, got {actual:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("features have {features} rows but labels have {labels}")]
    LengthMismatch { features: usize, labels: usize },

    #[error("split fraction must be in (0, 1), got {0}")]
    InvalidFraction(f64),

    #[error("need at least {needed} rows, got {actual}")]
    TooFewRows { needed: usize, actual: usize },
}
