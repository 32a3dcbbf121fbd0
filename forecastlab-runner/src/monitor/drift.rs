//! DriftMonitor: scores one window against the reference data of the registered model.

use super::report::{DatasetDrift, DriftReport};
use super::sink::MetricsSink;
use super::stats::DriftStatistic;
use super::MonitorError;
use crate::registry::{LoadedModel, ModelRegistry, RegistryError};
use forecastlab_core::domain::{RawRecord, TimeWindow};
use forecastlab_core::features::{ArtifactStore, FeatureMatrix, FeatureStore, Scaler};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Column excluded from dataset drift: it differs between any two windows by construction.
const TIME_COLUMN: &str = "Timestamp";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub p_value_threshold: f64,
    /// Drifted-column share above which `drift_detected` is set.
    pub drift_share: f64,
    /// Replacement for missing standardized cells before prediction.
    pub fill_value: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            p_value_threshold: 0.05,
            drift_share: 0.5,
            fill_value: 0.0,
        }
    }
}

struct Reference {
    raw: FeatureMatrix,
    scaler: Scaler,
    predictions: Vec<f64>,
}

pub struct DriftMonitor {
    registry: Arc<ModelRegistry>,
    artifacts: Option<Arc<ArtifactStore>>,
    reference_records: Vec<RawRecord>,
    model: LoadedModel,
    reference: Reference,
    statistic: Box<dyn DriftStatistic>,
    sink: MetricsSink,
    settings: MonitorSettings,
    last_window: Option<TimeWindow>,
}

impl DriftMonitor {
    /// Monitor the latest registered version, using its source run's records as reference
    /// and the scaler that run was trained with.
    pub fn open(
        registry: Arc<ModelRegistry>,
        artifacts: Arc<ArtifactStore>,
        statistic: Box<dyn DriftStatistic>,
        sink: MetricsSink,
        settings: MonitorSettings,
    ) -> Result<Self, MonitorError> {
        let model = load_latest(&registry)?;
        let (reference_records, scaler) = reference_from_artifacts(&artifacts, &model)?;
        Self::build(registry, Some(artifacts), reference_records, Some(scaler), model, statistic, sink, settings)
    }

    /// Monitor the latest registered version against an explicit reference dataset.
    /// The scaler is fitted on `reference`.
    pub fn with_reference(
        registry: Arc<ModelRegistry>,
        reference: Vec<RawRecord>,
        statistic: Box<dyn DriftStatistic>,
        sink: MetricsSink,
        settings: MonitorSettings,
    ) -> Result<Self, MonitorError> {
        let model = load_latest(&registry)?;
        Self::build(registry, None, reference, None, model, statistic, sink, settings)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        registry: Arc<ModelRegistry>,
        artifacts: Option<Arc<ArtifactStore>>,
        reference_records: Vec<RawRecord>,
        scaler: Option<Scaler>,
        model: LoadedModel,
        statistic: Box<dyn DriftStatistic>,
        sink: MetricsSink,
        settings: MonitorSettings,
    ) -> Result<Self, MonitorError> {
        let reference = build_reference(&reference_records, scaler, &model, settings.fill_value)?;
        // resume after the last persisted window so restarts keep the sequence
        let last_window = sink.last()?.map(|r| {
            TimeWindow::new(r.window_start, r.window_end - r.window_start)
        });
        info!(
            model = %model.meta.name,
            version = model.meta.version,
            reference_rows = reference_records.len(),
            statistic = statistic.name(),
            "drift monitor ready"
        );
        Ok(Self {
            registry,
            artifacts,
            reference_records,
            model,
            reference,
            statistic,
            sink,
            settings,
            last_window,
        })
    }

    pub fn model_version(&self) -> u32 {
        self.model.meta.version
    }

    pub fn sink(&self) -> &MetricsSink {
        &self.sink
    }

    /// Scaler applied to reference and current windows before prediction.
    pub fn scaler(&self) -> &Scaler {
        &self.reference.scaler
    }

    /// The window the next `evaluate` call must use, if one has been evaluated before.
    pub fn next_window(&self) -> Option<TimeWindow> {
        self.last_window.map(|w| w.next())
    }

    /// Switch to a newer registered version if one exists. Returns true on switch.
    pub fn refresh_model(&mut self) -> Result<bool, MonitorError> {
        let latest = self
            .registry
            .latest(self.registry.model_name())?
            .ok_or_else(|| MonitorError::ModelNotFound(self.registry.model_name().to_string()))?;
        if latest.version <= self.model.meta.version {
            return Ok(false);
        }
        let model = self.registry.load(&latest.name, latest.version)?;
        let scaler = match &self.artifacts {
            Some(artifacts) => {
                let (records, scaler) = reference_from_artifacts(artifacts, &model)?;
                self.reference_records = records;
                Some(scaler)
            }
            None => None,
        };
        self.reference = build_reference(&self.reference_records, scaler, &model, self.settings.fill_value)?;
        info!(from = self.model.meta.version, to = model.meta.version, "monitor switched to newer model version");
        self.model = model;
        Ok(true)
    }

    /// Consume `window` without producing a report. Used when its data cannot be fetched.
    pub fn skip(&mut self, window: TimeWindow) -> Result<(), MonitorError> {
        self.claim(window)
    }

    /// Evaluate one window and persist its report.
    ///
    /// `window` must follow the previously evaluated window exactly. It is consumed
    /// even when evaluation fails; a failed window is never persisted.
    pub fn evaluate(&mut self, window: TimeWindow, records: &[RawRecord]) -> Result<DriftReport, MonitorError> {
        self.claim(window)?;
        let report = self.compute(window, records)?;
        self.sink.append(&report)?;
        info!(
            window_start = %report.window_start,
            rows = report.row_count,
            drift_share = ?report.dataset_drift,
            prediction_drift = report.prediction_drift,
            rmse = ?report.rmse,
            "window report persisted"
        );
        Ok(report)
    }

    fn claim(&mut self, window: TimeWindow) -> Result<(), MonitorError> {
        if let Some(last) = self.last_window {
            if !last.is_followed_by(&window) {
                return Err(MonitorError::WindowOutOfSequence {
                    expected: last.end(),
                    actual: window.start,
                });
            }
        }
        self.last_window = Some(window);
        Ok(())
    }

    fn compute(&self, window: TimeWindow, records: &[RawRecord]) -> Result<DriftReport, MonitorError> {
        let current: Vec<RawRecord> = records
            .iter()
            .filter(|r| window.contains(r.timestamp))
            .cloned()
            .collect();
        if current.is_empty() {
            return Err(MonitorError::EmptyWindow(window.start));
        }
        let raw = FeatureStore::raw_matrix(&current);

        let (drifted, tested) = self.dataset_drift(&raw);
        let score = if tested == 0 { 0.0 } else { drifted as f64 / tested as f64 };

        let mut scaled = self.reference.scaler.transform(&raw)?;
        let filled = scaled.fill_missing(self.settings.fill_value);
        if filled > 0 {
            debug!(window_start = %window.start, filled, "filled missing cells before prediction");
        }
        let predictions = self.model.forecaster.predict(&scaled)?;
        if predictions.iter().any(|p| !p.is_finite()) {
            return Err(MonitorError::NonFinitePredictions(window.start));
        }
        let prediction_drift = self
            .statistic
            .test(&self.reference.predictions, &predictions)
            .map_or(0.0, |t| t.statistic);

        let missing: usize = current.iter().map(RawRecord::missing_fields).sum();
        let missing_share = missing as f64 / (current.len() * RawRecord::NUMERIC_FIELDS) as f64;

        let (rmse, mae) = error_metrics(&predictions, &current);
        if rmse.is_none() {
            warn!(window_start = %window.start, "no observed close prices in window; error metrics unavailable");
        }

        Ok(DriftReport {
            window_start: window.start,
            window_end: window.end(),
            row_count: current.len(),
            dataset_drift: DatasetDrift::Score(score),
            drifted_columns: drifted,
            column_count: tested,
            prediction_drift,
            missing_share,
            rmse,
            mae,
            model_version: self.model.meta.version,
            drift_detected: score > self.settings.drift_share,
        })
    }

    /// (drifted, tested) column counts over the predictor columns.
    fn dataset_drift(&self, current: &FeatureMatrix) -> (usize, usize) {
        let mut drifted = 0;
        let mut tested = 0;
        for (j, name) in current.columns().iter().enumerate() {
            if name == TIME_COLUMN {
                continue;
            }
            let Some(t) = self.statistic.test(&self.reference.raw.column(j), &current.column(j)) else {
                continue;
            };
            tested += 1;
            if t.p_value < self.settings.p_value_threshold {
                drifted += 1;
                debug!(column = %name, statistic = t.statistic, p_value = t.p_value, "column drifted");
            }
        }
        (drifted, tested)
    }
}

fn load_latest(registry: &ModelRegistry) -> Result<LoadedModel, MonitorError> {
    registry.load_latest(registry.model_name()).map_err(|e| match e {
        RegistryError::ModelNotFound(name) => MonitorError::ModelNotFound(name),
        other => MonitorError::Registry(other),
    })
}

/// Records and training scaler of the run a version was registered from.
fn reference_from_artifacts(
    artifacts: &ArtifactStore,
    model: &LoadedModel,
) -> Result<(Vec<RawRecord>, Scaler), MonitorError> {
    let run_id = &model.meta.source_run_id;
    let rows = artifacts.read_records(run_id)?;
    let scaler = artifacts.read_scaler(run_id)?;
    Ok((rows.iter().map(RawRecord::from).collect(), scaler))
}

fn build_reference(
    records: &[RawRecord],
    scaler: Option<Scaler>,
    model: &LoadedModel,
    fill: f64,
) -> Result<Reference, MonitorError> {
    if records.is_empty() {
        return Err(MonitorError::EmptyReference);
    }
    let raw = FeatureStore::raw_matrix(records);
    let (scaler, mut scaled) = match scaler {
        Some(scaler) => {
            let scaled = scaler.transform(&raw)?;
            (scaler, scaled)
        }
        None => Scaler::fit_transform(&raw),
    };
    scaled.fill_missing(fill);
    let predictions = model.forecaster.predict(&scaled)?;
    Ok(Reference { raw, scaler, predictions })
}

/// rmse and mae over rows with an observed close.
fn error_metrics(predictions: &[f64], records: &[RawRecord]) -> (Option<f64>, Option<f64>) {
    let errors: Vec<f64> = predictions
        .iter()
        .zip(records)
        .filter(|(_, r)| r.close.is_finite())
        .map(|(p, r)| p - r.close)
        .collect();
    if errors.is_empty() {
        return (None, None);
    }
    let n = errors.len() as f64;
    let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
    let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n;
    (Some(rmse), Some(mae))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_metrics_skip_missing_close() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let rec = |close: f64| RawRecord {
            timestamp: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close,
            volume: 1.0,
            vwap: 1.0,
            trade_count: 1.0,
        };
        let (rmse, mae) = error_metrics(&[3.0, 0.0, 5.0], &[rec(0.0), rec(f64::NAN), rec(1.0)]);
        assert!((rmse.unwrap() - (12.5f64).sqrt()).abs() < 1e-12);
        assert!((mae.unwrap() - 3.5).abs() < 1e-12);
        assert_eq!(error_metrics(&[1.0], &[rec(f64::NAN)]), (None, None));
    }
}
