//! Drift monitoring: per-window drift and quality reports against a reference dataset.

pub mod drift;
pub mod report;
pub mod sink;
pub mod stats;
pub mod window_loop;

pub use drift::{DriftMonitor, MonitorSettings};
pub use report::{DatasetDrift, DriftReport, ErrorMetric};
pub use sink::MetricsSink;
pub use stats::{DriftStatistic, DriftTest, KsTest};
pub use window_loop::{aligned_start, LoopSummary, MonitorLoop};

use crate::registry::RegistryError;
use chrono::NaiveDateTime;
use forecastlab_core::data::DataError;
use forecastlab_core::features::{ArtifactError, FeatureError};
use forecastlab_core::model::TrainError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("no registered model named '{0}'; the monitor needs a model to score")]
    ModelNotFound(String),

    #[error("reference dataset is empty")]
    EmptyReference,

    #[error("window starting {expected} expected next, got {actual}")]
    WindowOutOfSequence {
        expected: NaiveDateTime,
        actual: NaiveDateTime,
    },

    #[error("window starting {0} has no records")]
    EmptyWindow(NaiveDateTime),

    #[error("a report for window {0} is already persisted")]
    DuplicateWindow(NaiveDateTime),

    #[error("non-finite predictions for window {0}")]
    NonFinitePredictions(NaiveDateTime),

    #[error("metrics io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Artifacts(#[from] ArtifactError),

    #[error(transparent)]
    Features(#[from] FeatureError),

    #[error(transparent)]
    Model(#[from] TrainError),

    #[error(transparent)]
    Data(#[from] DataError),
}
