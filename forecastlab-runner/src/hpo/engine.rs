//! HPO engine: drives seeded TPE trials over a chronological train/validation split.
//!
//! Trials run in batches of `workers`. Every point of a batch is suggested from the
//! trials completed before the batch started and results are collected in trial
//! order, so for a given `workers` the whole run is reproducible from the seed.
//! A trial that fails to fit is logged as failed and the search carries on.

use super::space::{Point, SearchSpace};
use super::tpe::TpeSampler;
use super::HpoError;
use crate::config::HpoConfig;
use crate::experiment::{ExperimentStore, RunRecord, TrialRecord, TrialStatus};
use forecastlab_core::domain::{PipelineRunId, TrialId};
use forecastlab_core::features::{chronological_split, FeatureMatrix, Partition};
use forecastlab_core::model::{Hyperparameters, ModelFactory};
use forecastlab_core::rng::RngHierarchy;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct HpoSettings {
    pub seed: u64,
    pub workers: usize,
    pub validation_fraction: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub startup_trials: usize,
}

impl From<&HpoConfig> for HpoSettings {
    fn from(cfg: &HpoConfig) -> Self {
        Self {
            seed: cfg.seed,
            workers: cfg.workers,
            validation_fraction: cfg.validation_fraction,
            epochs: cfg.epochs,
            batch_size: cfg.batch_size,
            startup_trials: cfg.startup_trials,
        }
    }
}

/// Order trials ascending by score; ties go to the earlier trial. Unscored trials sort last.
pub fn rank_trials(trials: &mut [TrialRecord]) {
    trials.sort_by(|a, b| {
        let by_score = match (a.score, b.score) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_score.then(a.trial.cmp(&b.trial))
    });
}

/// Result of one search: completed trials ranked best first, failed trials in creation order.
#[derive(Debug, Clone)]
pub struct HpoOutcome {
    pub run_id: PipelineRunId,
    pub ranked: Vec<TrialRecord>,
    pub failed: Vec<TrialRecord>,
}

impl HpoOutcome {
    pub fn best(&self) -> Option<&TrialRecord> {
        self.ranked.first()
    }
}

pub struct HpoEngine {
    factory: Arc<dyn ModelFactory>,
    store: Arc<ExperimentStore>,
    experiment: String,
    settings: HpoSettings,
}

impl HpoEngine {
    pub fn new(
        factory: Arc<dyn ModelFactory>,
        store: Arc<ExperimentStore>,
        experiment: impl Into<String>,
        settings: HpoSettings,
    ) -> Self {
        Self {
            factory,
            store,
            experiment: experiment.into(),
            settings,
        }
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Run `trial_count` trials and return them ranked by minimum validation loss.
    pub fn search(
        &self,
        run_id: &PipelineRunId,
        features: &FeatureMatrix,
        labels: &[f64],
        trial_count: usize,
        space: &SearchSpace,
    ) -> Result<HpoOutcome, HpoError> {
        if trial_count == 0 {
            return Err(HpoError::NoTrials);
        }
        if space.is_empty() {
            return Err(HpoError::Space("search space is empty".into()));
        }
        let (train, validation) =
            chronological_split(features, labels, self.settings.validation_fraction)?;
        info!(
            run_id = %run_id,
            trial_count,
            train_rows = train.len(),
            validation_rows = validation.len(),
            workers = self.settings.workers,
            "starting hyperparameter search"
        );

        let rngs = RngHierarchy::new(self.settings.seed);
        let mut sampler = TpeSampler::new(space.clone(), rngs.sub_seed("sampler", 0))
            .with_startup(self.settings.startup_trials);

        let pool = if self.settings.workers > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.settings.workers)
                    .build()
                    .map_err(|e| HpoError::ThreadPool(e.to_string()))?,
            )
        } else {
            None
        };

        let mut completed: Vec<(Point, f64)> = Vec::new();
        let mut records: Vec<TrialRecord> = Vec::with_capacity(trial_count);
        let mut next = 0u64;
        while (next as usize) < trial_count {
            let batch_len = self.settings.workers.min(trial_count - next as usize);
            let batch: Vec<(TrialId, Point)> = (0..batch_len)
                .map(|i| (TrialId(next + i as u64), sampler.suggest(&completed)))
                .collect();
            next += batch_len as u64;

            let run = |(id, point): &(TrialId, Point)| {
                self.run_trial(run_id, *id, point, space, &train, &validation, &rngs)
            };
            let results: Vec<(Point, TrialRecord)> = match &pool {
                Some(pool) => pool.install(|| batch.par_iter().map(run).collect()),
                None => batch.iter().map(run).collect(),
            };

            for (point, record) in results {
                if let (true, Some(score)) = (record.is_scored(), record.score) {
                    completed.push((point, score));
                }
                records.push(record);
            }
        }

        let (mut ranked, failed): (Vec<_>, Vec<_>) = records.into_iter().partition(TrialRecord::is_scored);
        rank_trials(&mut ranked);
        if ranked.is_empty() {
            return Err(HpoError::AllTrialsFailed { count: failed.len() });
        }
        if let Some(best) = ranked.first() {
            info!(
                run_id = %run_id,
                best_trial = %best.trial,
                best_score = best.score.unwrap_or(f64::NAN),
                failed = failed.len(),
                "hyperparameter search finished"
            );
        }
        Ok(HpoOutcome {
            run_id: run_id.clone(),
            ranked,
            failed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_trial(
        &self,
        run_id: &PipelineRunId,
        id: TrialId,
        point: &Point,
        space: &SearchSpace,
        train: &Partition,
        validation: &Partition,
        rngs: &RngHierarchy,
    ) -> (Point, TrialRecord) {
        let now = chrono::Utc::now().naive_utc();
        let params = match space.to_hyperparameters(point, self.settings.epochs, self.settings.batch_size) {
            Ok(p) => p,
            Err(e) => {
                let fallback = Hyperparameters {
                    epochs: self.settings.epochs,
                    batch_size: self.settings.batch_size,
                    ..Hyperparameters::default()
                };
                let record = failed_record(run_id, id, fallback, e.to_string(), now);
                return (point.clone(), self.log_trial(record));
            }
        };

        let fitted = self
            .factory
            .build(&params, train.features.n_cols(), rngs.sub_seed("trial", id.0))
            .and_then(|mut model| {
                model.fit(
                    &train.features,
                    &train.labels,
                    Some((&validation.features, &validation.labels)),
                )
            });

        let record = match fitted {
            Ok(history) => match history.min_val_loss() {
                Some(score) => TrialRecord {
                    run_id: run_id.clone(),
                    trial: id,
                    params,
                    status: TrialStatus::Complete,
                    score: Some(score),
                    train_loss: history.final_train_loss(),
                    val_loss: history.final_val_loss(),
                    error: None,
                    created_at: now,
                },
                None => failed_record(run_id, id, params, "no finite validation loss".into(), now),
            },
            Err(e) => failed_record(run_id, id, params, e.to_string(), now),
        };
        (point.clone(), self.log_trial(record))
    }

    /// Append the trial to the experiment log. A trial that cannot be logged comes back
    /// as failed, so the ranking only holds trials the registry will read back.
    fn log_trial(&self, record: TrialRecord) -> TrialRecord {
        let (run_id, id) = (record.run_id.clone(), record.trial);
        match &record.error {
            None => info!(run_id = %run_id, trial = %id, score = record.score.unwrap_or(f64::NAN), "trial complete"),
            Some(msg) => warn!(run_id = %run_id, trial = %id, error = %msg, "trial failed"),
        }
        match self.store.append(&self.experiment, &RunRecord::Trial(record.clone())) {
            Ok(()) => record,
            Err(e) => {
                error!(run_id = %run_id, trial = %id, error = %e, "failed to log trial; treating it as failed");
                TrialRecord {
                    status: TrialStatus::Failed,
                    score: None,
                    error: Some(format!("trial not logged: {e}")),
                    ..record
                }
            }
        }
    }
}

fn failed_record(
    run_id: &PipelineRunId,
    id: TrialId,
    params: Hyperparameters,
    error: String,
    created_at: chrono::NaiveDateTime,
) -> TrialRecord {
    TrialRecord {
        run_id: run_id.clone(),
        trial: id,
        params,
        status: TrialStatus::Failed,
        score: None,
        train_loss: None,
        val_loss: None,
        error: Some(error),
        created_at,
    }
}
