//! Pipeline configuration, loaded from TOML.
//!
//! Every section has defaults, so an empty file is a valid configuration.

use chrono::NaiveDateTime;
use forecastlab_core::domain::Granularity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_ALERT_MESSAGE: &str =
    "The model performance has degraded. Please check the dashboard for details.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataConfig,
    pub paths: PathsConfig,
    pub hpo: HpoConfig,
    pub registry: RegistryConfig,
    pub monitor: MonitorConfig,
    pub trigger: TriggerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceChoice {
    Polygon,
    Csv,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub symbol: String,
    pub granularity: Granularity,
    /// Collection window: `[today - lookback_days, today]`.
    pub lookback_days: i64,
    pub source: SourceChoice,
    pub api_key_env: String,
    pub csv_dir: Option<PathBuf>,
    pub synthetic_seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            symbol: "AAPL".into(),
            granularity: Granularity::Day,
            lookback_days: 600,
            source: SourceChoice::Polygon,
            api_key_env: "POLYGON_API_KEY".into(),
            csv_dir: None,
            synthetic_seed: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("forecastlab-data"),
        }
    }
}

impl PathsConfig {
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn experiments_dir(&self) -> PathBuf {
        self.root.join("experiments")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.root.join("monitoring").join("metrics.jsonl")
    }

    pub fn alerts_path(&self) -> PathBuf {
        self.root.join("alerts.log")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    pub units_low: i64,
    pub units_high: i64,
    pub units_step: i64,
    pub dropout_low: f64,
    pub dropout_high: f64,
    pub lr_low: f64,
    pub lr_high: f64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            units_low: 10,
            units_high: 100,
            units_step: 10,
            dropout_low: 0.0,
            dropout_high: 0.5,
            lr_low: 1e-5,
            lr_high: 1e-2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HpoConfig {
    pub experiment: String,
    pub trial_count: usize,
    pub seed: u64,
    /// Trials trained concurrently. 1 means sequential and fully reproducible.
    pub workers: usize,
    pub validation_fraction: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub startup_trials: usize,
    pub space: SpaceConfig,
}

impl Default for HpoConfig {
    fn default() -> Self {
        Self {
            experiment: "forecast-hpo".into(),
            trial_count: 5,
            seed: 42,
            workers: 1,
            validation_fraction: 0.2,
            epochs: 100,
            batch_size: 64,
            startup_trials: 10,
            space: SpaceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub experiment: String,
    pub model_name: String,
    pub top_n: usize,
    /// Trailing share of prepared rows held out as the test set.
    pub test_fraction: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            experiment: "forecast-candidates".into(),
            model_name: "forecast-best-model".into(),
            top_n: 5,
            test_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub period_secs: i64,
    /// Sleep between windows.
    pub interval_secs: u64,
    /// Start of the first window. Defaults to the start of the current period.
    pub start: Option<NaiveDateTime>,
    /// Per-column KS p-value below which a column counts as drifted.
    pub p_value_threshold: f64,
    /// Share of drifted columns above which the dataset counts as drifted.
    pub drift_share: f64,
    /// Stop the loop on the first failed window instead of moving on.
    pub halt_on_error: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period_secs: 86_400,
            interval_secs: 86_400,
            start: None,
            p_value_threshold: 0.05,
            drift_share: 0.5,
            halt_on_error: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub drift_threshold: f64,
    pub error_threshold: f64,
    pub alert_message: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            drift_threshold: 0.5,
            error_threshold: 100.0,
            alert_message: DEFAULT_ALERT_MESSAGE.into(),
        }
    }
}

fn unit_interval(name: &str, v: f64) -> Result<(), ConfigError> {
    if v > 0.0 && v < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be in (0, 1), got {v}")))
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject malformed values before anything touches disk or network.
    ///
    /// `registry.top_n = 0` passes here; promotion rejects it itself.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.symbol.trim().is_empty() {
            return Err(ConfigError::Invalid("data.symbol is empty".into()));
        }
        if self.data.lookback_days <= 0 {
            return Err(ConfigError::Invalid("data.lookback_days must be positive".into()));
        }
        if self.data.source == SourceChoice::Csv && self.data.csv_dir.is_none() {
            return Err(ConfigError::Invalid("data.source = \"csv\" needs data.csv_dir".into()));
        }
        if self.hpo.trial_count == 0 {
            return Err(ConfigError::Invalid("hpo.trial_count must be >= 1".into()));
        }
        if self.hpo.workers == 0 {
            return Err(ConfigError::Invalid("hpo.workers must be >= 1".into()));
        }
        if self.hpo.epochs == 0 || self.hpo.batch_size == 0 {
            return Err(ConfigError::Invalid("hpo.epochs and hpo.batch_size must be >= 1".into()));
        }
        unit_interval("hpo.validation_fraction", self.hpo.validation_fraction)?;
        unit_interval("registry.test_fraction", self.registry.test_fraction)?;
        unit_interval("monitor.p_value_threshold", self.monitor.p_value_threshold)?;
        let s = &self.hpo.space;
        if s.units_low < 1 || s.units_high < s.units_low || s.units_step < 1 {
            return Err(ConfigError::Invalid("hpo.space units range is malformed".into()));
        }
        if !(0.0 <= s.dropout_low && s.dropout_low <= s.dropout_high && s.dropout_high < 1.0) {
            return Err(ConfigError::Invalid("hpo.space dropout range must lie in [0, 1)".into()));
        }
        if !(s.lr_low > 0.0 && s.lr_low <= s.lr_high) {
            return Err(ConfigError::Invalid("hpo.space learning-rate range is malformed".into()));
        }
        if self.registry.model_name.trim().is_empty() {
            return Err(ConfigError::Invalid("registry.model_name is empty".into()));
        }
        if self.monitor.period_secs <= 0 {
            return Err(ConfigError::Invalid("monitor.period_secs must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.monitor.drift_share) {
            return Err(ConfigError::Invalid("monitor.drift_share must be in [0, 1]".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.data.lookback_days, 600);
        assert_eq!(config.hpo.seed, 42);
        assert_eq!(config.registry.model_name, "forecast-best-model");
        assert_eq!(config.trigger.error_threshold, 100.0);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [data]
            symbol = "MSFT"
            granularity = "minute"

            [hpo]
            trial_count = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.data.symbol, "MSFT");
        assert_eq!(config.data.granularity, Granularity::Minute);
        assert_eq!(config.data.api_key_env, "POLYGON_API_KEY");
        assert_eq!(config.hpo.trial_count, 3);
        assert_eq!(config.hpo.batch_size, 64);
    }

    #[test]
    fn bad_values_rejected() {
        assert!(PipelineConfig::from_toml("[hpo]\nworkers = 0").is_err());
        assert!(PipelineConfig::from_toml("[hpo]\nvalidation_fraction = 1.0").is_err());
        assert!(PipelineConfig::from_toml("[data]\nsymbol = \"\"").is_err());
        assert!(PipelineConfig::from_toml("[data]\nsource = \"csv\"").is_err());
        assert!(matches!(
            PipelineConfig::from_toml("[hpo\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn top_n_zero_is_left_to_promotion() {
        let config = PipelineConfig::from_toml("[registry]\ntop_n = 0").unwrap();
        assert_eq!(config.registry.top_n, 0);
    }

    #[test]
    fn toml_round_trip() {
        let mut config = PipelineConfig::default();
        config.monitor.start = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0);
        let text = config.to_toml().unwrap();
        assert_eq!(PipelineConfig::from_toml(&text).unwrap(), config);
    }
}
