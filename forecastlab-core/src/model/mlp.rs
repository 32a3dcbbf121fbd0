//! Single-hidden-layer network: `tanh` hidden units, inverted dropout, linear output.
//!
//! Targets are standardized internally with the training labels' mean/std;
//! reported losses are MSE in label units.

use super::adam::Adam;
use super::{mse, Forecaster, Hyperparameters, ModelFactory, TrainError, TrainingHistory};
use crate::features::FeatureMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MlpState {
    params: Hyperparameters,
    n_features: usize,
    // w1 is units x n_features, row-major
    w1: Vec<f64>,
    b1: Vec<f64>,
    w2: Vec<f64>,
    b2: f64,
    y_mean: f64,
    y_std: f64,
    fitted: bool,
}

pub struct MlpForecaster {
    state: MlpState,
    rng: StdRng,
}

impl MlpForecaster {
    pub fn new(params: Hyperparameters, n_features: usize, seed: u64) -> Result<Self, TrainError> {
        params.validate()?;
        if n_features == 0 {
            return Err(TrainError::WidthMismatch {
                expected: 1,
                actual: 0,
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let h = params.units;
        let limit1 = (6.0 / (n_features + h) as f64).sqrt();
        let limit2 = (6.0 / (h + 1) as f64).sqrt();
        let w1 = (0..h * n_features)
            .map(|_| rng.gen_range(-limit1..limit1))
            .collect();
        let w2 = (0..h).map(|_| rng.gen_range(-limit2..limit2)).collect();
        Ok(Self {
            state: MlpState {
                params,
                n_features,
                w1,
                b1: vec![0.0; h],
                w2,
                b2: 0.0,
                y_mean: 0.0,
                y_std: 1.0,
                fitted: false,
            },
            rng,
        })
    }

    pub fn params(&self) -> &Hyperparameters {
        &self.state.params
    }

    fn check_width(&self, features: &FeatureMatrix) -> Result<(), TrainError> {
        if features.n_cols() != self.state.n_features {
            return Err(TrainError::WidthMismatch {
                expected: self.state.n_features,
                actual: features.n_cols(),
            });
        }
        Ok(())
    }

    /// Forward pass without dropout, in standardized target units.
    fn forward_eval(&self, x: &[f64]) -> f64 {
        let s = &self.state;
        let d = s.n_features;
        let mut out = s.b2;
        for j in 0..s.params.units {
            let row = &s.w1[j * d..(j + 1) * d];
            let z: f64 = row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f64>() + s.b1[j];
            out += s.w2[j] * z.tanh();
        }
        out
    }

    fn predict_raw(&self, features: &FeatureMatrix) -> Vec<f64> {
        (0..features.n_rows())
            .map(|i| self.forward_eval(features.row(i)) * self.state.y_std + self.state.y_mean)
            .collect()
    }

    /// One mini-batch: forward with dropout, backprop, Adam step. Returns the batch MSE (scaled units).
    fn train_batch(
        &mut self,
        features: &FeatureMatrix,
        targets: &[f64],
        batch: &[usize],
        opt: &mut Adam,
        flat: &mut Vec<f64>,
        grads: &mut [f64],
    ) -> f64 {
        let d = self.state.n_features;
        let h = self.state.params.units;
        let keep = 1.0 - self.state.params.dropout;
        let n_w1 = h * d;
        grads.iter_mut().for_each(|g| *g = 0.0);

        let mut hidden = vec![0.0; h];
        let mut mask = vec![0.0; h];
        let mut loss = 0.0;
        let inv_b = 1.0 / batch.len() as f64;

        for &i in batch {
            let x = features.row(i);
            for j in 0..h {
                let row = &self.state.w1[j * d..(j + 1) * d];
                let z: f64 = row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f64>() + self.state.b1[j];
                hidden[j] = z.tanh();
                mask[j] = if keep >= 1.0 || self.rng.gen::<f64>() < keep {
                    1.0 / keep
                } else {
                    0.0
                };
            }
            let y: f64 = (0..h).map(|j| self.state.w2[j] * hidden[j] * mask[j]).sum::<f64>() + self.state.b2;
            let err = y - targets[i];
            loss += err * err;
            let dy = 2.0 * err * inv_b;

            // layout of grads: [w1 | b1 | w2 | b2]
            for j in 0..h {
                grads[n_w1 + h + j] += dy * hidden[j] * mask[j];
                let dz = dy * self.state.w2[j] * mask[j] * (1.0 - hidden[j] * hidden[j]);
                if dz != 0.0 {
                    for (k, xk) in x.iter().enumerate() {
                        grads[j * d + k] += dz * xk;
                    }
                    grads[n_w1 + j] += dz;
                }
            }
            grads[n_w1 + 2 * h] += dy;
        }

        self.pack(flat);
        opt.step(flat, grads);
        self.unpack(flat);
        loss * inv_b
    }

    fn pack(&self, flat: &mut Vec<f64>) {
        flat.clear();
        flat.extend_from_slice(&self.state.w1);
        flat.extend_from_slice(&self.state.b1);
        flat.extend_from_slice(&self.state.w2);
        flat.push(self.state.b2);
    }

    fn unpack(&mut self, flat: &[f64]) {
        let n_w1 = self.state.w1.len();
        let h = self.state.b1.len();
        self.state.w1.copy_from_slice(&flat[..n_w1]);
        self.state.b1.copy_from_slice(&flat[n_w1..n_w1 + h]);
        self.state.w2.copy_from_slice(&flat[n_w1 + h..n_w1 + 2 * h]);
        self.state.b2 = flat[n_w1 + 2 * h];
    }
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

impl Forecaster for MlpForecaster {
    fn fit(
        &mut self,
        features: &FeatureMatrix,
        labels: &[f64],
        validation: Option<(&FeatureMatrix, &[f64])>,
    ) -> Result<TrainingHistory, TrainError> {
        if features.n_rows() != labels.len() {
            return Err(TrainError::LengthMismatch {
                features: features.n_rows(),
                labels: labels.len(),
            });
        }
        if labels.is_empty() {
            return Err(TrainError::EmptyTrainingSet);
        }
        self.check_width(features)?;
        if !all_finite(features.as_slice()) {
            return Err(TrainError::NonFiniteInput("training features"));
        }
        if !all_finite(labels) {
            return Err(TrainError::NonFiniteInput("training labels"));
        }
        if let Some((vf, vl)) = validation {
            self.check_width(vf)?;
            if vf.n_rows() != vl.len() {
                return Err(TrainError::LengthMismatch {
                    features: vf.n_rows(),
                    labels: vl.len(),
                });
            }
            if !all_finite(vf.as_slice()) || !all_finite(vl) {
                return Err(TrainError::NonFiniteInput("validation data"));
            }
        }

        let n = labels.len() as f64;
        let mean = labels.iter().sum::<f64>() / n;
        let std = (labels.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        self.state.y_mean = mean;
        self.state.y_std = if std > 0.0 { std } else { 1.0 };
        let targets: Vec<f64> = labels.iter().map(|v| (v - mean) / self.state.y_std).collect();
        let scale2 = self.state.y_std * self.state.y_std;

        let n_params = self.state.w1.len() + 2 * self.state.params.units + 1;
        let mut opt = Adam::new(self.state.params.learning_rate, n_params);
        let mut flat = Vec::with_capacity(n_params);
        let mut grads = vec![0.0; n_params];
        let mut order: Vec<usize> = (0..labels.len()).collect();
        let batch_size = self.state.params.batch_size;
        let mut history = TrainingHistory::default();

        for epoch in 0..self.state.params.epochs {
            order.shuffle(&mut self.rng);
            let mut sum = 0.0;
            for batch in order.chunks(batch_size) {
                let batch_loss = self.train_batch(features, &targets, batch, &mut opt, &mut flat, &mut grads);
                sum += batch_loss * batch.len() as f64;
            }
            let train_loss = sum / n * scale2;
            if !train_loss.is_finite() {
                return Err(TrainError::Diverged { epoch });
            }
            history.train_loss.push(train_loss);

            if let Some((vf, vl)) = validation {
                let preds = self.predict_raw(vf);
                let val = mse(&preds, vl).unwrap_or(f64::NAN);
                history.val_loss.push(val);
            }
            trace!(epoch, train_loss, val_loss = ?history.val_loss.last(), "epoch done");
        }

        self.state.fitted = true;
        Ok(history)
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, TrainError> {
        if !self.state.fitted {
            return Err(TrainError::NotFitted);
        }
        self.check_width(features)?;
        Ok(self.predict_raw(features))
    }

    fn snapshot(&self) -> Result<serde_json::Value, TrainError> {
        serde_json::to_value(&self.state).map_err(|e| TrainError::Snapshot(e.to_string()))
    }
}

/// Builds [`MlpForecaster`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MlpFactory;

impl ModelFactory for MlpFactory {
    fn name(&self) -> &str {
        "mlp"
    }

    fn build(
        &self,
        params: &Hyperparameters,
        n_features: usize,
        seed: u64,
    ) -> Result<Box<dyn Forecaster>, TrainError> {
        Ok(Box::new(MlpForecaster::new(params.clone(), n_features, seed)?))
    }

    fn restore(&self, snapshot: &serde_json::Value) -> Result<Box<dyn Forecaster>, TrainError> {
        let state: MlpState = serde_json::from_value(snapshot.clone())
            .map_err(|e| TrainError::Snapshot(e.to_string()))?;
        let h = state.params.units;
        if state.w1.len() != h * state.n_features || state.b1.len() != h || state.w2.len() != h {
            return Err(TrainError::Snapshot("weight shapes do not match units".into()));
        }
        Ok(Box::new(MlpForecaster {
            state,
            rng: StdRng::seed_from_u64(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_data(n: usize) -> (FeatureMatrix, Vec<f64>) {
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let a = (i as f64 / n as f64) * 2.0 - 1.0;
                let b = ((i * 7) % n) as f64 / n as f64 - 0.5;
                vec![a, b]
            })
            .collect();
        let labels = rows.iter().map(|r| 100.0 + 10.0 * r[0] - 4.0 * r[1]).collect();
        (FeatureMatrix::from_rows(vec!["a".into(), "b".into()], &rows).unwrap(), labels)
    }

    fn params(epochs: usize) -> Hyperparameters {
        Hyperparameters {
            units: 16,
            dropout: 0.0,
            learning_rate: 1e-2,
            epochs,
            batch_size: 16,
        }
    }

    #[test]
    fn learns_a_linear_target() {
        let (x, y) = linear_data(120);
        let mut model = MlpForecaster::new(params(200), 2, 1).unwrap();
        let history = model.fit(&x, &y, Some((&x, &y))).unwrap();
        assert_eq!(history.epochs(), 200);
        let first = history.train_loss[0];
        let last = history.final_train_loss().unwrap();
        assert!(last < first * 0.1, "loss {first} -> {last}");
        assert!(history.min_val_loss().unwrap() < 2.0);
    }

    #[test]
    fn same_seed_same_history() {
        let (x, y) = linear_data(50);
        let p = Hyperparameters {
            dropout: 0.3,
            ..params(10)
        };
        let mut a = MlpForecaster::new(p.clone(), 2, 9).unwrap();
        let mut b = MlpForecaster::new(p, 2, 9).unwrap();
        assert_eq!(a.fit(&x, &y, None).unwrap(), b.fit(&x, &y, None).unwrap());
    }

    #[test]
    fn predict_requires_fit() {
        let (x, _) = linear_data(5);
        let model = MlpForecaster::new(params(1), 2, 0).unwrap();
        assert!(matches!(model.predict(&x), Err(TrainError::NotFitted)));
    }

    #[test]
    fn rejects_non_finite_labels() {
        let (x, mut y) = linear_data(5);
        y[2] = f64::NAN;
        let mut model = MlpForecaster::new(params(1), 2, 0).unwrap();
        assert!(matches!(
            model.fit(&x, &y, None),
            Err(TrainError::NonFiniteInput(_))
        ));
    }

    #[test]
    fn snapshot_restores_predictions() {
        let (x, y) = linear_data(40);
        let mut model = MlpForecaster::new(params(5), 2, 4).unwrap();
        model.fit(&x, &y, None).unwrap();
        let snap = model.snapshot().unwrap();
        let restored = MlpFactory.restore(&snap).unwrap();
        assert_eq!(model.predict(&x).unwrap(), restored.predict(&x).unwrap());
    }
}
