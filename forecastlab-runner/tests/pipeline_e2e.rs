//! End-to-end: the orchestrator, the monitor on its artifacts, and retraining through the trigger.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use forecastlab_core::data::{DataError, FetchResult, MarketDataSource, SyntheticSource};
use forecastlab_core::domain::{Granularity, TimeWindow};
use forecastlab_core::model::MlpFactory;
use forecastlab_runner::{
    AlertLog, DatasetDrift, DriftMonitor, KsTest, MetricsSink, MonitorLoop, MonitorSettings, PipelineConfig,
    PipelineError, PipelineOrchestrator, RetrainTrigger, TriggerOutcome,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.paths.root = root.to_path_buf();
    config.data.lookback_days = 150;
    config.hpo.trial_count = 3;
    config.hpo.epochs = 10;
    config.hpo.batch_size = 16;
    config.registry.top_n = 2;
    config
}

fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 30).unwrap().and_hms_opt(12, 0, 0).unwrap()
}

struct Unreachable;

impl MarketDataSource for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }

    fn fetch(&self, _: &str, _: Granularity, _: NaiveDate, _: NaiveDate) -> Result<FetchResult, DataError> {
        Err(DataError::NetworkUnreachable("connection refused".into()))
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Synthetic data with the close of one record blanked out.
struct GappyClose {
    inner: SyntheticSource,
    gap: usize,
}

impl MarketDataSource for GappyClose {
    fn name(&self) -> &str {
        "gappy"
    }

    fn fetch(&self, symbol: &str, g: Granularity, start: NaiveDate, end: NaiveDate) -> Result<FetchResult, DataError> {
        let mut fetched = self.inner.fetch(symbol, g, start, end)?;
        if let Some(rec) = fetched.records.get_mut(self.gap) {
            rec.close = f64::NAN;
        }
        Ok(fetched)
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Blocks the first fetch until released, so a run can be held mid-pipeline.
struct Gated {
    inner: SyntheticSource,
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl MarketDataSource for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    fn fetch(&self, symbol: &str, g: Granularity, start: NaiveDate, end: NaiveDate) -> Result<FetchResult, DataError> {
        if let Some(entered) = self.entered.lock().unwrap().take() {
            entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        self.inner.fetch(symbol, g, start, end)
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[test]
fn pipeline_registers_a_new_version_per_run() {
    let dir = tempfile::tempdir().unwrap();
    let orch = PipelineOrchestrator::new(config(dir.path()), Arc::new(SyntheticSource::new(11)), Arc::new(MlpFactory));

    let first = orch.run_at(now()).unwrap();
    assert_eq!(first.rows, 151);
    assert_eq!(first.trials, 3);
    assert_eq!(first.model.version, 1);
    assert_eq!(first.model.source_run_id, first.run_id);
    assert!(orch.artifacts().exists(&first.run_id));

    let second = orch.run_at(now() + Duration::hours(1)).unwrap();
    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.model.version, 2);
    assert!(!orch.is_running());
}

#[test]
fn failed_collect_leaves_registry_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let good = PipelineOrchestrator::new(cfg.clone(), Arc::new(SyntheticSource::new(11)), Arc::new(MlpFactory));
    good.run_at(now()).unwrap();

    let bad = PipelineOrchestrator::new(cfg, Arc::new(Unreachable), Arc::new(MlpFactory));
    let err = bad.run_at(now()).unwrap_err();

    assert!(matches!(err, PipelineError::Collect(_)));
    assert_eq!(err.stage(), "collect");
    let versions = bad.registry().versions("forecast-best-model").unwrap();
    assert_eq!(versions.len(), 1);
    assert!(!bad.is_running());
}

#[test]
fn too_little_data_fails_in_search_stage() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.data.lookback_days = 0;
    let orch = PipelineOrchestrator::new(cfg, Arc::new(SyntheticSource::new(2)), Arc::new(MlpFactory));

    let err = orch.run_at(now()).unwrap_err();

    assert_eq!(err.stage(), "search");
    assert!(orch.registry().latest("forecast-best-model").unwrap().is_none());
}

#[test]
fn monitor_loop_feeds_trigger_which_retrains() {
    // GIVEN one registered version and a monitor on its source artifacts
    let dir = tempfile::tempdir().unwrap();
    let orch = Arc::new(PipelineOrchestrator::new(
        config(dir.path()),
        Arc::new(SyntheticSource::new(11)),
        Arc::new(MlpFactory),
    ));
    orch.run_at(now()).unwrap();

    let monitor = DriftMonitor::open(
        orch.registry(),
        orch.artifacts(),
        Box::new(KsTest),
        MetricsSink::new(orch.config().paths.metrics_path()),
        MonitorSettings::default(),
    )
    .unwrap();
    let mut windows = MonitorLoop::new(
        monitor,
        Arc::new(SyntheticSource::new(11)),
        "AAPL",
        Granularity::Day,
        std::time::Duration::ZERO,
    );
    let trigger = RetrainTrigger::new(
        orch.config().trigger.clone(),
        AlertLog::new(orch.config().paths.alerts_path()),
        orch.clone(),
    );

    // WHEN three daily windows run
    let first = TimeWindow::new(NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(), Duration::days(1));
    let cancel = AtomicBool::new(false);
    let mut reports = Vec::new();
    let summary = windows
        .run(first, &cancel, Some(3), |report| reports.push(report.clone()))
        .unwrap();

    // THEN three consecutive reports are persisted
    assert_eq!(summary.persisted, 3);
    assert_eq!(reports.len(), 3);
    for pair in reports.windows(2) {
        assert_eq!(pair[1].window_start, pair[0].window_end);
    }
    assert_eq!(windows.monitor().sink().read_all().unwrap().len(), 3);

    // AND a drifted report sent to the trigger runs the pipeline again, once
    let mut drifted = reports[0].clone();
    drifted.dataset_drift = DatasetDrift::Detected(true);
    drifted.rmse = Some(1.0);
    let decision = trigger.evaluate(&drifted);
    assert_eq!(decision.outcome(), TriggerOutcome::RetrainRequested);
    assert!(decision.retrain_run.is_some());
    assert_eq!(trigger.evaluate(&drifted).outcome(), TriggerOutcome::AlreadyConsumed);
    assert_eq!(orch.registry().latest("forecast-best-model").unwrap().unwrap().version, 2);
}

#[test]
fn cancelled_loop_evaluates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let orch = PipelineOrchestrator::new(config(dir.path()), Arc::new(SyntheticSource::new(4)), Arc::new(MlpFactory));
    orch.run_at(now()).unwrap();
    let monitor = DriftMonitor::open(
        orch.registry(),
        orch.artifacts(),
        Box::new(KsTest),
        MetricsSink::new(orch.config().paths.metrics_path()),
        MonitorSettings::default(),
    )
    .unwrap();
    let mut windows = MonitorLoop::new(
        monitor,
        Arc::new(SyntheticSource::new(4)),
        "AAPL",
        Granularity::Day,
        std::time::Duration::from_secs(3600),
    );

    let cancel = AtomicBool::new(true);
    let first = TimeWindow::new(now(), Duration::days(1));
    let summary = windows.run(first, &cancel, None, |_| {}).unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.attempted, 0);
    assert!(windows.monitor().sink().read_all().unwrap().is_empty());
}

#[test]
fn missing_close_drops_the_row_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();
    let source = GappyClose {
        inner: SyntheticSource::new(11),
        gap: 10,
    };
    let orch = PipelineOrchestrator::new(config(dir.path()), Arc::new(source), Arc::new(MlpFactory));

    let report = orch.run_at(now()).unwrap();

    assert_eq!(report.rows, 150);
    assert_eq!(report.trials, 3);
    assert_eq!(report.model.version, 1);
}

#[test]
fn second_orchestrator_on_the_same_root_is_rejected_while_one_runs() {
    // GIVEN a run held inside its collect stage
    let dir = tempfile::tempdir().unwrap();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gated = Gated {
        inner: SyntheticSource::new(11),
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    };
    let first = PipelineOrchestrator::new(config(dir.path()), Arc::new(gated), Arc::new(MlpFactory));
    let second = PipelineOrchestrator::new(config(dir.path()), Arc::new(SyntheticSource::new(11)), Arc::new(MlpFactory));

    std::thread::scope(|scope| {
        let held = scope.spawn(|| first.run_at(now()));
        entered_rx.recv().unwrap();

        // WHEN another orchestrator on the same root is invoked
        let err = second.run_at(now()).unwrap_err();

        // THEN it is rejected without touching the registry
        assert!(matches!(err, PipelineError::AlreadyRunning));
        assert!(second.registry().latest("forecast-best-model").unwrap().is_none());

        release_tx.send(()).unwrap();
        assert_eq!(held.join().unwrap().unwrap().model.version, 1);
    });

    // AND once the first run is done the second one can run
    assert_eq!(second.run_at(now() + Duration::hours(1)).unwrap().model.version, 2);
}

#[test]
fn monitor_scales_with_the_training_scaler() {
    let dir = tempfile::tempdir().unwrap();
    let orch = PipelineOrchestrator::new(config(dir.path()), Arc::new(SyntheticSource::new(5)), Arc::new(MlpFactory));
    let report = orch.run_at(now()).unwrap();

    let monitor = DriftMonitor::open(
        orch.registry(),
        orch.artifacts(),
        Box::new(KsTest),
        MetricsSink::new(orch.config().paths.metrics_path()),
        MonitorSettings::default(),
    )
    .unwrap();

    let trained = orch.artifacts().read_scaler(&report.run_id).unwrap();
    assert_eq!(monitor.scaler(), &trained);
}

#[test]
fn stop_signal_mid_run_ends_the_loop_at_the_window_boundary() {
    // GIVEN an unbounded loop with a long interval and a shared stop flag
    let dir = tempfile::tempdir().unwrap();
    let orch = PipelineOrchestrator::new(config(dir.path()), Arc::new(SyntheticSource::new(6)), Arc::new(MlpFactory));
    orch.run_at(now()).unwrap();
    let monitor = DriftMonitor::open(
        orch.registry(),
        orch.artifacts(),
        Box::new(KsTest),
        MetricsSink::new(orch.config().paths.metrics_path()),
        MonitorSettings::default(),
    )
    .unwrap();
    let mut windows = MonitorLoop::new(
        monitor,
        Arc::new(SyntheticSource::new(6)),
        "AAPL",
        Granularity::Day,
        std::time::Duration::from_secs(3600),
    );
    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = stop.clone();

    // WHEN the flag is raised while the first window is being reported
    let first = TimeWindow::new(NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(), Duration::days(1));
    let summary = windows
        .run(first, &stop, None, |_| handler_flag.store(true, Ordering::SeqCst))
        .unwrap();

    // THEN that window is persisted and no further window starts
    assert!(summary.cancelled);
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.persisted, 1);
    assert_eq!(windows.monitor().sink().read_all().unwrap().len(), 1);
}
