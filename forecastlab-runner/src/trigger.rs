//! RetrainTrigger: turns one drift report into at most one alert and at most one retrain.
//!
//! Rules, evaluated independently:
//! - **Retrain**: dataset drift flag set, or drift score above `drift_threshold`.
//! - **Alert**: rmse (or mae when rmse is absent) above `error_threshold`.
//!
//! A report is consumed on first evaluation; evaluating it again does nothing.

use crate::config::TriggerConfig;
use crate::monitor::{DriftReport, ErrorMetric};
use crate::pipeline::PipelineError;
use chrono::NaiveDateTime;
use forecastlab_core::domain::PipelineRunId;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("alert log io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Runs the full pipeline once. Takes no arguments.
pub trait PipelineInvoker: Send + Sync {
    fn invoke(&self) -> Result<PipelineRunId, PipelineError>;
}

/// Append-only text log, one timestamped line per alert.
pub struct AlertLog {
    path: PathBuf,
}

impl AlertLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) -> Result<String, TriggerError> {
        let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let line = format!("{stamp} {message}\n");
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.io(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io(e))?;
        file.write_all(line.as_bytes()).map_err(|e| self.io(e))?;
        Ok(line.trim_end().to_string())
    }

    pub fn lines(&self) -> Result<Vec<String>, TriggerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io(e))?;
        Ok(content.lines().map(str::to_string).collect())
    }

    fn io(&self, source: std::io::Error) -> TriggerError {
        TriggerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionStatus {
    NotNeeded,
    Done,
    Failed(String),
}

impl ActionStatus {
    pub fn fired(&self) -> bool {
        !matches!(self, ActionStatus::NotNeeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    NoAction,
    AlertRaised,
    RetrainRequested,
    AlertAndRetrain,
    AlreadyConsumed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrainDecision {
    pub window_start: NaiveDateTime,
    pub consumed_before: bool,
    pub alert: ActionStatus,
    pub retrain: ActionStatus,
    pub retrain_run: Option<PipelineRunId>,
}

impl RetrainDecision {
    pub fn outcome(&self) -> TriggerOutcome {
        if self.consumed_before {
            return TriggerOutcome::AlreadyConsumed;
        }
        match (self.alert.fired(), self.retrain.fired()) {
            (false, false) => TriggerOutcome::NoAction,
            (true, false) => TriggerOutcome::AlertRaised,
            (false, true) => TriggerOutcome::RetrainRequested,
            (true, true) => TriggerOutcome::AlertAndRetrain,
        }
    }
}

pub struct RetrainTrigger {
    config: TriggerConfig,
    alerts: AlertLog,
    invoker: Arc<dyn PipelineInvoker>,
    consumed: Mutex<HashSet<NaiveDateTime>>,
}

impl RetrainTrigger {
    pub fn new(config: TriggerConfig, alerts: AlertLog, invoker: Arc<dyn PipelineInvoker>) -> Self {
        Self {
            config,
            alerts,
            invoker,
            consumed: Mutex::new(HashSet::new()),
        }
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }

    pub fn is_consumed(&self, report: &DriftReport) -> bool {
        self.consumed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&report.window_start)
    }

    /// Evaluate both rules for `report`. Failures of either action are logged and
    /// reported in the decision, never retried.
    pub fn evaluate(&self, report: &DriftReport) -> RetrainDecision {
        let first = self
            .consumed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(report.window_start);
        if !first {
            info!(window_start = %report.window_start, "report already evaluated; skipping");
            return RetrainDecision {
                window_start: report.window_start,
                consumed_before: true,
                alert: ActionStatus::NotNeeded,
                retrain: ActionStatus::NotNeeded,
                retrain_run: None,
            };
        }

        let alert = self.apply_alert_rule(report);
        let (retrain, retrain_run) = self.apply_retrain_rule(report);
        RetrainDecision {
            window_start: report.window_start,
            consumed_before: false,
            alert,
            retrain,
            retrain_run,
        }
    }

    fn apply_alert_rule(&self, report: &DriftReport) -> ActionStatus {
        let Some((metric, value)) = report.applicable_error() else {
            warn!(window_start = %report.window_start, "report has neither rmse nor mae; alert rule skipped");
            return ActionStatus::NotNeeded;
        };
        if metric == ErrorMetric::Mae {
            warn!(window_start = %report.window_start, "rmse absent; using mae for the alert rule");
        }
        if value <= self.config.error_threshold {
            return ActionStatus::NotNeeded;
        }
        match self.alerts.append(&self.config.alert_message) {
            Ok(line) => {
                warn!(window_start = %report.window_start, metric = metric.as_str(), value, "{line}");
                ActionStatus::Done
            }
            Err(e) => {
                error!(window_start = %report.window_start, error = %e, "failed to append alert");
                ActionStatus::Failed(e.to_string())
            }
        }
    }

    fn apply_retrain_rule(&self, report: &DriftReport) -> (ActionStatus, Option<PipelineRunId>) {
        if !report.dataset_drift.exceeds(self.config.drift_threshold) {
            return (ActionStatus::NotNeeded, None);
        }
        info!(window_start = %report.window_start, drift = ?report.dataset_drift, "dataset drift detected; retraining");
        match self.invoker.invoke() {
            Ok(run_id) => {
                info!(window_start = %report.window_start, run_id = %run_id, "retraining run completed");
                (ActionStatus::Done, Some(run_id))
            }
            Err(e) => {
                error!(window_start = %report.window_start, stage = e.stage(), error = %e, "retraining run failed");
                (ActionStatus::Failed(e.to_string()), None)
            }
        }
    }
}
