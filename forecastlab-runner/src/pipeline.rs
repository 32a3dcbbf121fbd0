//! PipelineOrchestrator: Collect → Prepare → Search → Register.
//!
//! Each stage takes only the previous stage's output. A failing stage aborts the
//! invocation and is reported with its stage name; earlier experiment records and
//! registered versions are left as they were. At most one invocation runs at a time
//! per storage root: an in-process flag rejects re-entry and an exclusive lock on
//! `{root}/.pipeline.lock` rejects invocations from other orchestrators or processes.

use crate::config::PipelineConfig;
use crate::experiment::ExperimentStore;
use crate::hpo::{HpoEngine, HpoError, HpoOutcome, HpoSettings, SearchSpace};
use crate::registry::{ModelRegistry, PromotionData, RegisteredModel, RegistryError, RegistrySettings};
use crate::trigger::PipelineInvoker;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use fd_lock::RwLock;
use forecastlab_core::data::{dataset_hash, DataError, FetchResult, MarketDataSource};
use forecastlab_core::domain::PipelineRunId;
use forecastlab_core::features::{chronological_split, ArtifactError, ArtifactStore, FeatureError, FeatureStore};
use forecastlab_core::model::ModelFactory;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Artifacts(#[from] ArtifactError),

    #[error("cannot hold out test set: {0}")]
    Split(#[from] FeatureError),

    #[error(transparent)]
    Hpo(#[from] HpoError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("another pipeline invocation is already running")]
    AlreadyRunning,

    #[error("cannot take pipeline lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("collect stage failed: {0}")]
    Collect(#[source] DataError),

    #[error("prepare stage failed: {0}")]
    Prepare(#[source] ArtifactError),

    #[error("search stage failed: {0}")]
    Search(#[source] SearchError),

    #[error("register stage failed: {0}")]
    Register(#[source] RegistryError),
}

impl PipelineError {
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::AlreadyRunning | PipelineError::Lock { .. } => "guard",
            PipelineError::Collect(_) => "collect",
            PipelineError::Prepare(_) => "prepare",
            PipelineError::Search(_) => "search",
            PipelineError::Register(_) => "register",
        }
    }
}

/// Output of the prepare stage: artifacts are on disk under `run_id`.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run_id: PipelineRunId,
    pub rows: usize,
}

/// Output of the search stage.
#[derive(Debug, Clone)]
pub struct SearchedRun {
    pub run_id: PipelineRunId,
    pub outcome: HpoOutcome,
    pub promotion: PromotionData,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: PipelineRunId,
    pub symbol: String,
    pub rows: usize,
    pub trials: usize,
    pub failed_trials: usize,
    pub best_validation_loss: Option<f64>,
    pub model: RegisteredModel,
    pub elapsed_secs: f64,
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl<'a> ActiveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    source: Arc<dyn MarketDataSource>,
    factory: Arc<dyn ModelFactory>,
    experiments: Arc<ExperimentStore>,
    artifacts: Arc<ArtifactStore>,
    registry: Arc<ModelRegistry>,
    active: AtomicBool,
}

impl PipelineOrchestrator {
    /// Build the orchestrator and its stores under `config.paths.root`.
    pub fn new(config: PipelineConfig, source: Arc<dyn MarketDataSource>, factory: Arc<dyn ModelFactory>) -> Self {
        let experiments = Arc::new(ExperimentStore::new(config.paths.experiments_dir()));
        let artifacts = Arc::new(ArtifactStore::new(config.paths.artifacts_dir()));
        let registry = Arc::new(ModelRegistry::new(
            config.paths.registry_dir(),
            factory.clone(),
            experiments.clone(),
            RegistrySettings {
                model_name: config.registry.model_name.clone(),
                hpo_experiment: config.hpo.experiment.clone(),
                candidate_experiment: config.registry.experiment.clone(),
                seed: config.hpo.seed,
            },
        ));
        Self {
            config,
            source,
            factory,
            experiments,
            artifacts,
            registry,
            active: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ModelRegistry> {
        self.registry.clone()
    }

    pub fn artifacts(&self) -> Arc<ArtifactStore> {
        self.artifacts.clone()
    }

    pub fn experiments(&self) -> Arc<ExperimentStore> {
        self.experiments.clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run every stage with the current time.
    pub fn run(&self) -> Result<PipelineReport, PipelineError> {
        self.run_at(chrono::Utc::now().naive_utc())
    }

    /// Run every stage as if invoked at `now`.
    pub fn run_at(&self, now: NaiveDateTime) -> Result<PipelineReport, PipelineError> {
        let _guard = ActiveGuard::acquire(&self.active).ok_or_else(rejected)?;
        let mut run_lock = self.open_run_lock()?;
        let _held = match run_lock.try_write() {
            Ok(held) => held,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(rejected()),
            Err(source) => {
                return Err(PipelineError::Lock {
                    path: self.run_lock_path(),
                    source,
                })
            }
        };
        let started = Instant::now();
        let result = self.run_stages(now);
        match &result {
            Ok(report) => info!(
                run_id = %report.run_id,
                version = report.model.version,
                elapsed_secs = report.elapsed_secs,
                "pipeline run complete"
            ),
            Err(e) => error!(stage = e.stage(), error = %e, elapsed_secs = started.elapsed().as_secs_f64(), "pipeline run failed"),
        }
        result
    }

    fn run_lock_path(&self) -> PathBuf {
        self.config.paths.root.join(".pipeline.lock")
    }

    fn open_run_lock(&self) -> Result<RwLock<File>, PipelineError> {
        let path = self.run_lock_path();
        let opened = fs::create_dir_all(&self.config.paths.root).and_then(|()| {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
        });
        match opened {
            Ok(file) => Ok(RwLock::new(file)),
            Err(source) => Err(PipelineError::Lock { path, source }),
        }
    }

    fn run_stages(&self, now: NaiveDateTime) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let fetched = self.collect(now.date()).map_err(PipelineError::Collect)?;
        let prepared = self.prepare(&fetched, now).map_err(PipelineError::Prepare)?;
        let searched = self.search(&prepared).map_err(PipelineError::Search)?;
        let model = self.register(&searched).map_err(PipelineError::Register)?;
        Ok(PipelineReport {
            run_id: searched.run_id,
            symbol: fetched.symbol,
            rows: prepared.rows,
            trials: searched.outcome.ranked.len() + searched.outcome.failed.len(),
            failed_trials: searched.outcome.failed.len(),
            best_validation_loss: searched.outcome.best().and_then(|t| t.score),
            model,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Collect `[today - lookback_days, today]` from the configured source.
    pub fn collect(&self, today: NaiveDate) -> Result<FetchResult, DataError> {
        let data = &self.config.data;
        let start = today - Duration::days(data.lookback_days);
        info!(stage = "collect", source = self.source.name(), symbol = %data.symbol, %start, end = %today, "collecting");
        let fetched = self.source.fetch(&data.symbol, data.granularity, start, today)?;
        if fetched.is_empty() {
            warn!(stage = "collect", symbol = %data.symbol, "source returned no records");
        }
        info!(stage = "collect", records = fetched.records.len(), "collected");
        Ok(fetched)
    }

    /// Standardize the collected records and write the run's artifacts.
    pub fn prepare(&self, fetched: &FetchResult, invoked_at: NaiveDateTime) -> Result<PreparedRun, ArtifactError> {
        let hash = dataset_hash(&fetched.records);
        let first = fetched.records.first().map(|r| r.timestamp.to_string()).unwrap_or_default();
        let last = fetched.records.last().map(|r| r.timestamp.to_string()).unwrap_or_default();
        let run_id = PipelineRunId::derive(&[
            &fetched.symbol,
            fetched.granularity.as_str(),
            &first,
            &last,
            &hash,
            &invoked_at.to_string(),
        ]);

        let prepared = FeatureStore::with_fill(0.0).prepare(&fetched.records);
        let paths = self.artifacts.write(&run_id, &prepared)?;
        info!(
            stage = "prepare",
            run_id = %run_id,
            rows = prepared.len(),
            features = %paths.features.display(),
            "artifacts written"
        );
        Ok(PreparedRun {
            run_id,
            rows: prepared.len(),
        })
    }

    /// Hold out the test tail, then search hyperparameters on the rest.
    pub fn search(&self, prepared: &PreparedRun) -> Result<SearchedRun, SearchError> {
        let run_id = &prepared.run_id;
        let features = self.artifacts.read_features(run_id)?;
        let labels = self.artifacts.read_labels(run_id)?;
        let (head, test) = chronological_split(&features, &labels, self.config.registry.test_fraction)?;
        info!(stage = "search", run_id = %run_id, search_rows = head.len(), test_rows = test.len(), "held out test set");

        let hpo = &self.config.hpo;
        let space = SearchSpace::from_config(&hpo.space)?;
        let engine = HpoEngine::new(
            self.factory.clone(),
            self.experiments.clone(),
            hpo.experiment.clone(),
            HpoSettings::from(hpo),
        );
        let outcome = engine.search(run_id, &head.features, &head.labels, hpo.trial_count, &space)?;
        Ok(SearchedRun {
            run_id: run_id.clone(),
            outcome,
            promotion: PromotionData { train: head, test },
        })
    }

    /// Promote the best finalists of the search into a new registered version.
    pub fn register(&self, searched: &SearchedRun) -> Result<RegisteredModel, RegistryError> {
        info!(stage = "register", run_id = %searched.run_id, top_n = self.config.registry.top_n, "promoting finalists");
        self.registry.promote(
            self.config.registry.top_n,
            &searched.run_id,
            &searched.run_id,
            &searched.promotion,
        )
    }
}

fn rejected() -> PipelineError {
    warn!("pipeline invocation rejected: another one is active");
    PipelineError::AlreadyRunning
}

impl PipelineInvoker for PipelineOrchestrator {
    fn invoke(&self) -> Result<PipelineRunId, PipelineError> {
        self.run().map(|report| report.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forecastlab_core::data::SyntheticSource;
    use forecastlab_core::model::MlpFactory;

    fn orchestrator(root: &std::path::Path) -> PipelineOrchestrator {
        let mut config = PipelineConfig::default();
        config.paths.root = root.to_path_buf();
        PipelineOrchestrator::new(config, Arc::new(SyntheticSource::new(1)), Arc::new(MlpFactory))
    }

    #[test]
    fn overlapping_invocation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        orch.active.store(true, Ordering::SeqCst);
        let err = orch.run().unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning));
        assert_eq!(err.stage(), "guard");
        // the rejected call must not clear the other invocation's flag
        assert!(orch.is_running());
    }

    #[test]
    fn held_run_lock_rejects_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut other = orch.open_run_lock().unwrap();
        let held = other.try_write().unwrap();

        let err = orch.run().unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning));
        assert!(!orch.is_running());

        drop(held);
        assert!(orch.open_run_lock().unwrap().try_write().is_ok());
    }

    #[test]
    fn guard_releases_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _g = ActiveGuard::acquire(&flag).unwrap();
            assert!(ActiveGuard::acquire(&flag).is_none());
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn collect_uses_lookback_window() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let today = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let fetched = orch.collect(today).unwrap();
        assert_eq!(fetched.records.len(), 601);
        let first = fetched.records.first().unwrap().timestamp.date();
        assert_eq!(first, today - Duration::days(600));
    }
}
