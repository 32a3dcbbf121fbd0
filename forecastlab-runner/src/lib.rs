//! ForecastLab Runner: pipeline orchestration and the closed retraining loop.
//!
//! This crate builds on `forecastlab-core` to provide:
//! - TOML pipeline configuration
//! - Append-only JSONL experiment store (trials and finalists)
//! - Seeded TPE hyperparameter search with bounded parallel trials
//! - Model registry with atomic version registration and promotion
//! - Windowed drift monitoring with a persisted metrics table
//! - Retrain trigger (alert and retrain rules, idempotent per report)
//! - The Collect → Prepare → Search → Register orchestrator

pub mod config;
pub mod experiment;
pub mod hpo;
pub mod monitor;
pub mod pipeline;
pub mod registry;
pub mod trigger;

pub use config::{ConfigError, PipelineConfig, SourceChoice};
pub use experiment::{CandidateRecord, ExperimentError, ExperimentStore, RunRecord, TrialRecord, TrialStatus};
pub use hpo::{rank_trials, HpoEngine, HpoError, HpoOutcome, HpoSettings, SearchSpace, TpeSampler};
pub use monitor::{
    aligned_start, DatasetDrift, DriftMonitor, DriftReport, DriftStatistic, KsTest, LoopSummary, MetricsSink,
    MonitorError, MonitorLoop, MonitorSettings,
};
pub use pipeline::{PipelineError, PipelineOrchestrator, PipelineReport, PreparedRun, SearchError, SearchedRun};
pub use registry::{LoadedModel, ModelRegistry, PromotionData, RegisteredModel, RegistryError, RegistrySettings};
pub use trigger::{
    ActionStatus, AlertLog, PipelineInvoker, RetrainDecision, RetrainTrigger, TriggerError, TriggerOutcome,
};
