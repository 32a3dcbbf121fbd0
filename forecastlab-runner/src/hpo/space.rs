//! Hyperparameter search space.

use super::HpoError;
use crate::config::SpaceConfig;
use forecastlab_core::model::Hyperparameters;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A sampled point: parameter name to value (integers carried as whole `f64`s).
pub type Point = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamDomain {
    /// `low, low + step, ...` up to and including `high` when it lands on the grid.
    Int { low: i64, high: i64, step: i64 },
    /// Uniform on `[low, high]`, or log-uniform when `log` is set.
    Float { low: f64, high: f64, log: bool },
}

impl ParamDomain {
    /// Number of grid points of an integer domain.
    pub fn grid_len(&self) -> Option<usize> {
        match *self {
            ParamDomain::Int { low, high, step } => Some(((high - low) / step) as usize + 1),
            ParamDomain::Float { .. } => None,
        }
    }

    pub fn sample_uniform<R: Rng>(&self, rng: &mut R) -> f64 {
        match *self {
            ParamDomain::Int { low, step, .. } => {
                let n = self.grid_len().unwrap_or(1);
                (low + step * rng.gen_range(0..n) as i64) as f64
            }
            ParamDomain::Float { low, high, log } => {
                if high <= low {
                    return low;
                }
                if log {
                    rng.gen_range(low.ln()..=high.ln()).exp().clamp(low, high)
                } else {
                    rng.gen_range(low..=high)
                }
            }
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        match *self {
            ParamDomain::Int { low, high, step } => {
                let v = value.round() as i64;
                value.fract() == 0.0 && v >= low && v <= high && (v - low) % step == 0
            }
            ParamDomain::Float { low, high, .. } => value >= low && value <= high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    params: Vec<(String, ParamDomain)>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    pub fn int(mut self, name: &str, low: i64, high: i64, step: i64) -> Result<Self, HpoError> {
        if step < 1 || high < low {
            return Err(HpoError::Space(format!("{name}: bad int range {low}..={high} step {step}")));
        }
        self.params.push((name.to_string(), ParamDomain::Int { low, high, step }));
        Ok(self)
    }

    pub fn float(mut self, name: &str, low: f64, high: f64, log: bool) -> Result<Self, HpoError> {
        if !(low.is_finite() && high.is_finite()) || high < low || (log && low <= 0.0) {
            return Err(HpoError::Space(format!("{name}: bad float range [{low}, {high}]")));
        }
        self.params.push((name.to_string(), ParamDomain::Float { low, high, log }));
        Ok(self)
    }

    /// `units` (int, stepped), `dropout` (uniform), `learning_rate` (log-uniform).
    pub fn from_config(cfg: &SpaceConfig) -> Result<Self, HpoError> {
        Self::new()
            .int("units", cfg.units_low, cfg.units_high, cfg.units_step)?
            .float("dropout", cfg.dropout_low, cfg.dropout_high, false)?
            .float("learning_rate", cfg.lr_low, cfg.lr_high, true)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamDomain)> {
        self.params.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn sample_uniform<R: Rng>(&self, rng: &mut R) -> Point {
        self.params
            .iter()
            .map(|(name, domain)| (name.clone(), domain.sample_uniform(rng)))
            .collect()
    }

    /// Turn a point into the forecaster's hyperparameters plus the fixed training schedule.
    pub fn to_hyperparameters(
        &self,
        point: &Point,
        epochs: usize,
        batch_size: usize,
    ) -> Result<Hyperparameters, HpoError> {
        let get = |name: &str| {
            point
                .get(name)
                .copied()
                .ok_or_else(|| HpoError::Space(format!("point has no '{name}'")))
        };
        Ok(Hyperparameters {
            units: get("units")?.round().max(1.0) as usize,
            dropout: get("dropout")?,
            learning_rate: get("learning_rate")?,
            epochs,
            batch_size,
        })
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_space_samples_in_range() {
        let space = SearchSpace::from_config(&SpaceConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let p = space.sample_uniform(&mut rng);
            for (name, domain) in space.iter() {
                assert!(domain.contains(p[name]), "{name} = {}", p[name]);
            }
            let units = p["units"] as i64;
            assert_eq!(units % 10, 0);
            assert!((10..=100).contains(&units));
        }
    }

    #[test]
    fn int_grid_len() {
        let d = ParamDomain::Int { low: 10, high: 100, step: 10 };
        assert_eq!(d.grid_len(), Some(10));
        assert!(d.contains(40.0));
        assert!(!d.contains(45.0));
    }

    #[test]
    fn bad_ranges_rejected() {
        assert!(SearchSpace::new().int("u", 5, 1, 1).is_err());
        assert!(SearchSpace::new().float("lr", 0.0, 1.0, true).is_err());
    }

    #[test]
    fn point_maps_to_hyperparameters() {
        let space = SearchSpace::from_config(&SpaceConfig::default()).unwrap();
        let point: Point = [
            ("units".to_string(), 30.0),
            ("dropout".to_string(), 0.25),
            ("learning_rate".to_string(), 1e-3),
        ]
        .into_iter()
        .collect();
        let hp = space.to_hyperparameters(&point, 100, 64).unwrap();
        assert_eq!(hp.units, 30);
        assert_eq!(hp.batch_size, 64);
        let mut missing = point.clone();
        missing.remove("dropout");
        assert!(space.to_hyperparameters(&missing, 1, 1).is_err());
    }
}
