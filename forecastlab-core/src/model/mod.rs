//! The trainable unit: an opaque forecaster behind `fit` / `predict`.
//!
//! The pipeline only talks to [`Forecaster`] and [`ModelFactory`]; the bundled
//! [`MlpFactory`] is one implementation and can be swapped out.

pub mod adam;
pub mod mlp;

pub use mlp::{MlpFactory, MlpForecaster};

use crate::features::FeatureMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("features have {features} rows but labels have {labels}")]
    LengthMismatch { features: usize, labels: usize },

    #[error("expected {expected} feature columns, got {actual}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("non-finite value in {0}")]
    NonFiniteInput(&'static str),

    #[error("training diverged at epoch {epoch}")]
    Diverged { epoch: usize },

    #[error("invalid hyperparameters: {0}")]
    InvalidHyperparameters(String),

    #[error("model is not fitted")]
    NotFitted,

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

/// One point of the search space plus the fixed training schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub units: usize,
    pub dropout: f64,
    pub learning_rate: f64,
    pub epochs: usize,
    pub batch_size: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            units: 50,
            dropout: 0.2,
            learning_rate: 1e-3,
            epochs: 100,
            batch_size: 64,
        }
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.units == 0 {
            return Err(TrainError::InvalidHyperparameters("units must be >= 1".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainError::InvalidHyperparameters(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainError::InvalidHyperparameters(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(TrainError::InvalidHyperparameters(
                "epochs and batch_size must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-epoch loss trajectory (mean squared error in label units).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub val_loss: Vec<f64>,
}

impl TrainingHistory {
    /// Lowest validation loss over all epochs, not the last one.
    pub fn min_val_loss(&self) -> Option<f64> {
        self.val_loss
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .min_by(f64::total_cmp)
    }

    pub fn final_train_loss(&self) -> Option<f64> {
        self.train_loss.last().copied()
    }

    pub fn final_val_loss(&self) -> Option<f64> {
        self.val_loss.last().copied()
    }

    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }
}

pub trait Forecaster: Send {
    /// Fit on `(features, labels)`; when `validation` is given, record its loss each epoch.
    fn fit(
        &mut self,
        features: &FeatureMatrix,
        labels: &[f64],
        validation: Option<(&FeatureMatrix, &[f64])>,
    ) -> Result<TrainingHistory, TrainError>;

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, TrainError>;

    /// Serializable state, enough for [`ModelFactory::restore`] to rebuild the model.
    fn snapshot(&self) -> Result<serde_json::Value, TrainError>;
}

pub trait ModelFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Fresh, unfitted model. Same `(params, n_features, seed)` gives the same initial state.
    fn build(
        &self,
        params: &Hyperparameters,
        n_features: usize,
        seed: u64,
    ) -> Result<Box<dyn Forecaster>, TrainError>;

    fn restore(&self, snapshot: &serde_json::Value) -> Result<Box<dyn Forecaster>, TrainError>;
}

/// Mean squared error; `None` when empty or lengths differ.
pub fn mse(predictions: &[f64], targets: &[f64]) -> Option<f64> {
    if predictions.is_empty() || predictions.len() != targets.len() {
        return None;
    }
    let sum: f64 = predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t).powi(2))
        .sum();
    Some(sum / predictions.len() as f64)
}
