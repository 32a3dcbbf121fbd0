//! ForecastLab CLI: collect, prepare, run the pipeline, inspect models, monitor drift.
//!
//! Commands:
//! - `collect`: fetch records for the configured symbol and report what came back
//! - `prepare`: collect and write the feature/label artifacts for a new run
//! - `run`: full pipeline: collect, prepare, search, register
//! - `models`: list registered versions
//! - `monitor`: evaluate successive windows and apply the retrain trigger to each report
//! - `evaluate`: apply the retrain trigger to a stored report

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use forecastlab_core::data::{
    dataset_hash, CircuitBreaker, CsvSource, MarketDataSource, PolygonSource, SyntheticSource,
};
use forecastlab_core::domain::TimeWindow;
use forecastlab_core::model::MlpFactory;
use forecastlab_runner::{
    aligned_start, AlertLog, DriftMonitor, DriftReport, KsTest, MetricsSink, MonitorLoop, MonitorSettings,
    PipelineConfig, PipelineOrchestrator, RetrainTrigger, SourceChoice,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "forecastlab", about = "ForecastLab: forecasting pipeline with drift-driven retraining")]
struct Cli {
    /// Pipeline config (TOML). Every field has a default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data source: polygon, csv or synthetic.
    #[arg(long, global = true)]
    source: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch records for the configured symbol.
    Collect {
        /// Last day of the collection window (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,
    },
    /// Collect and write feature/label artifacts.
    Prepare,
    /// Run the full pipeline once.
    Run,
    /// List registered versions of the configured model.
    Models,
    /// Evaluate drift window by window, applying the retrain trigger to each report.
    Monitor {
        /// First window start (YYYY-MM-DDTHH:MM:SS). Defaults to resuming, else the current period.
        #[arg(long)]
        start: Option<String>,

        /// Stop after this many windows.
        #[arg(long)]
        windows: Option<usize>,
    },
    /// Apply the retrain trigger to a report.
    Evaluate {
        /// JSON file holding one report. Defaults to the last persisted report.
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(source) = cli.source.as_deref() {
        config.data.source = parse_source(source)?;
        config.validate()?;
    }

    match cli.command {
        Commands::Collect { end } => run_collect(config, end),
        Commands::Prepare => run_prepare(config),
        Commands::Run => run_pipeline(config),
        Commands::Models => run_models(config),
        Commands::Monitor { start, windows } => run_monitor(config, start, windows),
        Commands::Evaluate { report } => run_evaluate(config, report),
    }
}

fn parse_source(name: &str) -> Result<SourceChoice> {
    Ok(match name {
        "polygon" => SourceChoice::Polygon,
        "csv" => SourceChoice::Csv,
        "synthetic" => SourceChoice::Synthetic,
        _ => bail!("unknown source '{name}'. Valid: polygon, csv, synthetic"),
    })
}

fn build_source(config: &PipelineConfig) -> Result<Arc<dyn MarketDataSource>> {
    let data = &config.data;
    Ok(match data.source {
        SourceChoice::Polygon => {
            let breaker = Arc::new(CircuitBreaker::default_provider());
            Arc::new(PolygonSource::from_env(&data.api_key_env, breaker)?)
        }
        SourceChoice::Csv => {
            let Some(dir) = &data.csv_dir else {
                bail!("data.source = \"csv\" needs data.csv_dir");
            };
            Arc::new(CsvSource::new(dir))
        }
        SourceChoice::Synthetic => Arc::new(SyntheticSource::new(data.synthetic_seed)),
    })
}

fn orchestrator(config: PipelineConfig) -> Result<Arc<PipelineOrchestrator>> {
    let source = build_source(&config)?;
    Ok(Arc::new(PipelineOrchestrator::new(config, source, Arc::new(MlpFactory))))
}

fn run_collect(config: PipelineConfig, end: Option<String>) -> Result<()> {
    let end = end
        .as_deref()
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()?
        .unwrap_or_else(|| chrono::Utc::now().date_naive());
    let orch = orchestrator(config)?;
    let fetched = orch.collect(end)?;

    println!("Symbol:   {} ({})", fetched.symbol, fetched.granularity.as_str());
    println!("Records:  {}", fetched.records.len());
    if let (Some(first), Some(last)) = (fetched.records.first(), fetched.records.last()) {
        println!("Range:    {} .. {}", first.timestamp, last.timestamp);
    }
    println!("Dataset:  {}", dataset_hash(&fetched.records));
    Ok(())
}

fn run_prepare(config: PipelineConfig) -> Result<()> {
    let orch = orchestrator(config)?;
    let now = chrono::Utc::now().naive_utc();
    let fetched = orch.collect(now.date())?;
    let prepared = orch.prepare(&fetched, now)?;
    let paths = orch.artifacts().paths(&prepared.run_id);

    println!("Run:      {}", prepared.run_id);
    println!("Rows:     {}", prepared.rows);
    println!("Features: {}", paths.features.display());
    println!("Labels:   {}", paths.labels.display());
    println!("Records:  {}", paths.records.display());
    Ok(())
}

fn run_pipeline(config: PipelineConfig) -> Result<()> {
    let orch = orchestrator(config)?;
    let report = orch.run()?;

    println!("Run:        {}", report.run_id);
    println!("Symbol:     {}", report.symbol);
    println!("Rows:       {}", report.rows);
    println!("Trials:     {} ({} failed)", report.trials, report.failed_trials);
    if let Some(loss) = report.best_validation_loss {
        println!("Best val:   {loss:.6}");
    }
    println!(
        "Registered: {} v{} (test loss {:.6}, {})",
        report.model.name, report.model.version, report.model.test_loss, report.model.source_trial
    );
    println!("Elapsed:    {:.1}s", report.elapsed_secs);
    Ok(())
}

fn run_models(config: PipelineConfig) -> Result<()> {
    let orch = orchestrator(config)?;
    let registry = orch.registry();
    let versions = registry.versions(registry.model_name())?;
    if versions.is_empty() {
        println!("No registered versions of '{}'", registry.model_name());
        return Ok(());
    }
    println!("{:<8} {:<18} {:<10} {:>14}  {}", "VERSION", "RUN", "TRIAL", "TEST LOSS", "CREATED");
    for m in versions {
        println!(
            "{:<8} {:<18} {:<10} {:>14.6}  {}",
            m.version,
            m.source_run_id,
            m.source_trial.to_string(),
            m.test_loss,
            m.created_at
        );
    }
    Ok(())
}

fn parse_start(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|d| d.and_time(chrono::NaiveTime::MIN)))
        .with_context(|| format!("invalid window start '{raw}'"))
}

fn run_monitor(config: PipelineConfig, start: Option<String>, windows: Option<usize>) -> Result<()> {
    let orch = orchestrator(config.clone())?;
    let sink = MetricsSink::new(config.paths.metrics_path());
    let settings = MonitorSettings {
        p_value_threshold: config.monitor.p_value_threshold,
        drift_share: config.monitor.drift_share,
        ..MonitorSettings::default()
    };
    let monitor = DriftMonitor::open(orch.registry(), orch.artifacts(), Box::new(KsTest), sink, settings)?;

    let period = chrono::Duration::seconds(config.monitor.period_secs);
    let first = match (start.as_deref().map(parse_start).transpose()?, config.monitor.start, monitor.next_window()) {
        (Some(start), _, _) => TimeWindow::new(start, period),
        (None, _, Some(next)) => next,
        (None, Some(start), None) => TimeWindow::new(start, period),
        (None, None, None) => TimeWindow::new(
            aligned_start(chrono::Utc::now().naive_utc(), config.monitor.period_secs),
            period,
        ),
    };

    let trigger = RetrainTrigger::new(
        config.trigger.clone(),
        AlertLog::new(config.paths.alerts_path()),
        orch.clone(),
    );
    let mut windows_loop = MonitorLoop::new(
        monitor,
        build_source(&config)?,
        config.data.symbol.clone(),
        config.data.granularity,
        std::time::Duration::from_secs(config.monitor.interval_secs),
    )
    .halt_on_error(config.monitor.halt_on_error);

    // first interrupt stops at the next window boundary, a second one exits at once
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        tracing::info!("interrupt received; stopping after the current window");
    })
    .context("installing interrupt handler")?;

    let summary = windows_loop.run(first, &cancel, windows, |report| {
        let decision = trigger.evaluate(report);
        println!(
            "{}  drift={:?}  pred_drift={:.3}  rmse={:?}  -> {:?}",
            report.window_start,
            report.dataset_drift,
            report.prediction_drift,
            report.rmse,
            decision.outcome()
        );
    })?;

    println!(
        "Windows: {} attempted, {} persisted, {} failed{}",
        summary.attempted,
        summary.persisted,
        summary.failed,
        if summary.cancelled { " (interrupted)" } else { "" }
    );
    Ok(())
}

fn run_evaluate(config: PipelineConfig, report: Option<PathBuf>) -> Result<()> {
    let report: DriftReport = match report {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => match MetricsSink::new(config.paths.metrics_path()).last()? {
            Some(r) => r,
            None => bail!("no persisted reports in {}", config.paths.metrics_path().display()),
        },
    };

    let alerts = AlertLog::new(config.paths.alerts_path());
    let trigger = RetrainTrigger::new(config.trigger.clone(), alerts, orchestrator(config)?);
    let decision = trigger.evaluate(&report);

    println!("Window:  {}", decision.window_start);
    println!("Alert:   {:?}", decision.alert);
    println!("Retrain: {:?}", decision.retrain);
    if let Some(run) = &decision.retrain_run {
        println!("New run: {run}");
    }
    println!("Outcome: {:?}", decision.outcome());
    Ok(())
}
