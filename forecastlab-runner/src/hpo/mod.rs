//! Hyperparameter search: space definition, TPE sampler, trial engine.

pub mod engine;
pub mod space;
pub mod tpe;

pub use engine::{rank_trials, HpoEngine, HpoOutcome, HpoSettings};
pub use space::{ParamDomain, Point, SearchSpace};
pub use tpe::TpeSampler;

use forecastlab_core::features::FeatureError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HpoError {
    #[error("trial_count must be >= 1")]
    NoTrials,

    #[error("search space error: {0}")]
    Space(String),

    #[error("cannot split training data: {0}")]
    Split(#[from] FeatureError),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),

    #[error("all {count} trials failed")]
    AllTrialsFailed { count: usize },
}
