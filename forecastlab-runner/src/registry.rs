//! Model registry and the promotion protocol.
//!
//! Layout: `{root}/{model_name}/versions.jsonl` (one line per version) and
//! `{root}/{model_name}/v{N}/model.json` (the forecaster snapshot).
//!
//! A version exists once its line is in `versions.jsonl`. The snapshot is written
//! first (tmp + rename); if the index append then fails the snapshot is removed,
//! so a version is either fully resolvable or absent.
//!
//! Registration holds an exclusive lock on `{root}/{model_name}/.lock` from reading
//! the current maximum until the index line is appended. Registries in other
//! processes that share the root serialize on the same file.

use crate::experiment::{CandidateRecord, ExperimentError, ExperimentStore, RunRecord};
use crate::hpo::rank_trials;
use chrono::NaiveDateTime;
use fd_lock::RwLock;
use forecastlab_core::domain::{PipelineRunId, TrialId};
use forecastlab_core::features::Partition;
use forecastlab_core::model::{mse, Forecaster, Hyperparameters, ModelFactory, TrainError};
use forecastlab_core::rng::RngHierarchy;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("top_n must be >= 1, got {0}")]
    InvalidTopN(usize),

    #[error("no scored trials for run {0}")]
    NoTrials(PipelineRunId),

    #[error("every finalist failed to retrain ({count} tried)")]
    NoCandidates { count: usize },

    #[error("no registered model named '{0}'")]
    ModelNotFound(String),

    #[error("version {version} of '{name}' not found")]
    VersionNotFound { name: String, version: u32 },

    #[error("test set is empty")]
    EmptyTestSet,

    #[error("registry io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error("model error: {0}")]
    Model(#[from] TrainError),
}

/// An immutable registered version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    pub version: u32,
    pub source_run_id: PipelineRunId,
    pub source_trial: TrialId,
    pub factory: String,
    pub params: Hyperparameters,
    pub test_loss: f64,
    pub created_at: NaiveDateTime,
}

/// A registered version with its forecaster restored.
pub struct LoadedModel {
    pub meta: RegisteredModel,
    pub forecaster: Box<dyn Forecaster>,
}

/// Data for promotion: the full training set (train + validation) and the held-out test set.
#[derive(Debug, Clone)]
pub struct PromotionData {
    pub train: Partition,
    pub test: Partition,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub model_name: String,
    pub hpo_experiment: String,
    pub candidate_experiment: String,
    pub seed: u64,
}

pub struct ModelRegistry {
    root: PathBuf,
    factory: Arc<dyn ModelFactory>,
    experiments: Arc<ExperimentStore>,
    settings: RegistrySettings,
}

impl ModelRegistry {
    pub fn new(
        root: impl Into<PathBuf>,
        factory: Arc<dyn ModelFactory>,
        experiments: Arc<ExperimentStore>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            root: root.into(),
            factory,
            experiments,
            settings,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.settings.model_name
    }

    fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.model_dir(name).join("versions.jsonl")
    }

    fn blob_path(&self, name: &str, version: u32) -> PathBuf {
        self.model_dir(name).join(format!("v{version}")).join("model.json")
    }

    /// All registered versions of `name`, ascending by version.
    pub fn versions(&self, name: &str) -> Result<Vec<RegisteredModel>, RegistryError> {
        let path = self.index_path(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path).map_err(io_err(&path))?;
        let mut versions = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line.map_err(io_err(&path))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RegisteredModel>(&line) {
                Ok(m) => versions.push(m),
                Err(e) => warn!(model = name, error = %e, "skipping malformed registry line"),
            }
        }
        versions.sort_by_key(|m| m.version);
        Ok(versions)
    }

    /// Highest integer version under `name`.
    pub fn latest(&self, name: &str) -> Result<Option<RegisteredModel>, RegistryError> {
        Ok(self.versions(name)?.into_iter().max_by_key(|m| m.version))
    }

    pub fn load(&self, name: &str, version: u32) -> Result<LoadedModel, RegistryError> {
        let meta = self
            .versions(name)?
            .into_iter()
            .find(|m| m.version == version)
            .ok_or_else(|| RegistryError::VersionNotFound {
                name: name.to_string(),
                version,
            })?;
        let path = self.blob_path(name, version);
        let raw = fs::read(&path).map_err(io_err(&path))?;
        let snapshot: serde_json::Value = serde_json::from_slice(&raw)?;
        let forecaster = self.factory.restore(&snapshot)?;
        Ok(LoadedModel { meta, forecaster })
    }

    pub fn load_latest(&self, name: &str) -> Result<LoadedModel, RegistryError> {
        let latest = self
            .latest(name)?
            .ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))?;
        self.load(name, latest.version)
    }

    /// Register a snapshot as version `max + 1` (or 1).
    pub fn register(
        &self,
        source_run_id: &PipelineRunId,
        source_trial: TrialId,
        params: &Hyperparameters,
        test_loss: f64,
        snapshot: &serde_json::Value,
    ) -> Result<RegisteredModel, RegistryError> {
        let name = self.settings.model_name.as_str();
        let dir = self.model_dir(name);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let lock_path = dir.join(".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;
        let mut lock = RwLock::new(lock_file);
        let _held = lock.write().map_err(io_err(&lock_path))?;

        let version = self.latest(name)?.map_or(1, |m| m.version + 1);
        let model = RegisteredModel {
            name: name.to_string(),
            version,
            source_run_id: source_run_id.clone(),
            source_trial,
            factory: self.factory.name().to_string(),
            params: params.clone(),
            test_loss,
            created_at: chrono::Utc::now().naive_utc(),
        };
        let mut line = serde_json::to_string(&model)?;
        line.push('\n');
        let blob = serde_json::to_vec(snapshot)?;

        let blob_path = self.blob_path(name, version);
        if let Some(dir) = blob_path.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        let tmp = blob_path.with_extension("json.tmp");
        fs::write(&tmp, &blob).map_err(io_err(&tmp))?;
        if let Err(e) = fs::rename(&tmp, &blob_path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&blob_path)(e));
        }

        let index = self.index_path(name);
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .and_then(|mut f| {
                f.write_all(line.as_bytes())?;
                f.flush()
            });
        if let Err(e) = appended {
            let _ = fs::remove_file(&blob_path);
            return Err(io_err(&index)(e));
        }

        info!(model = name, version, run_id = %source_run_id, trial = %source_trial, test_loss, "registered model version");
        Ok(model)
    }

    /// Retrain the `top_n` best trials of `hpo_run` on the full training set, score them
    /// on the test set, and register the one with the lowest test loss.
    pub fn promote(
        &self,
        top_n: usize,
        hpo_run: &PipelineRunId,
        target_run: &PipelineRunId,
        data: &PromotionData,
    ) -> Result<RegisteredModel, RegistryError> {
        if top_n == 0 {
            return Err(RegistryError::InvalidTopN(top_n));
        }
        if data.test.is_empty() {
            return Err(RegistryError::EmptyTestSet);
        }

        let mut trials: Vec<_> = self
            .experiments
            .trials(&self.settings.hpo_experiment, hpo_run)?
            .into_iter()
            .filter(|t| t.is_scored())
            .collect();
        rank_trials(&mut trials);
        if trials.is_empty() {
            return Err(RegistryError::NoTrials(hpo_run.clone()));
        }
        trials.truncate(top_n);
        info!(hpo_run = %hpo_run, finalists = trials.len(), "retraining finalists on full training set");

        let rngs = RngHierarchy::new(self.settings.seed);
        let mut best: Option<(f64, TrialId, Hyperparameters, serde_json::Value)> = None;
        for trial in &trials {
            let now = chrono::Utc::now().naive_utc();
            let result = self.retrain(trial.trial, &trial.params, data, &rngs);
            let candidate = match &result {
                Ok((test_loss, train_loss, _)) => CandidateRecord {
                    run_id: target_run.clone(),
                    source_trial: trial.trial,
                    params: trial.params.clone(),
                    test_loss: Some(*test_loss),
                    train_loss: *train_loss,
                    error: None,
                    created_at: now,
                },
                Err(e) => {
                    warn!(trial = %trial.trial, error = %e, "finalist failed to retrain");
                    CandidateRecord {
                        run_id: target_run.clone(),
                        source_trial: trial.trial,
                        params: trial.params.clone(),
                        test_loss: None,
                        train_loss: None,
                        error: Some(e.to_string()),
                        created_at: now,
                    }
                }
            };
            self.experiments
                .append(&self.settings.candidate_experiment, &RunRecord::Candidate(candidate))?;

            if let Ok((test_loss, _, snapshot)) = result {
                info!(trial = %trial.trial, test_loss, "finalist scored");
                // strict less-than keeps the earliest finalist on ties
                let better = best.as_ref().map_or(true, |(b, ..)| test_loss < *b);
                if better {
                    best = Some((test_loss, trial.trial, trial.params.clone(), snapshot));
                }
            }
        }

        let (test_loss, trial, params, snapshot) =
            best.ok_or(RegistryError::NoCandidates { count: trials.len() })?;
        self.register(target_run, trial, &params, test_loss, &snapshot)
    }

    fn retrain(
        &self,
        trial: TrialId,
        params: &Hyperparameters,
        data: &PromotionData,
        rngs: &RngHierarchy,
    ) -> Result<(f64, Option<f64>, serde_json::Value), RegistryError> {
        let mut model = self
            .factory
            .build(params, data.train.features.n_cols(), rngs.sub_seed("candidate", trial.0))?;
        let history = model.fit(&data.train.features, &data.train.labels, None)?;
        let predictions = model.predict(&data.test.features)?;
        let test_loss = mse(&predictions, &data.test.labels)
            .filter(|v| v.is_finite())
            .ok_or(TrainError::NonFiniteInput("test predictions"))?;
        Ok((test_loss, history.final_train_loss(), model.snapshot()?))
    }
}

fn io_err(path: &Path) -> impl Fn(io::Error) -> RegistryError + '_ {
    move |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}
