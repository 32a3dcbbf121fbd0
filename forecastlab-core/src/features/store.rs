//! FeatureStore: raw records to a standardized predictor matrix and label vector.

use super::matrix::FeatureMatrix;
use super::scaler::Scaler;
use crate::domain::RawRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Predictor columns, in matrix order. `Close` is the label and `Date` is dropped.
pub const FEATURE_COLUMNS: [&str; 7] = [
    "Volume",
    "VWAP",
    "Open",
    "High",
    "Low",
    "Timestamp",
    "Number_of_Trades",
];

pub const LABEL_COLUMN: &str = "Close";

/// Flat, typed form of a raw record as exported to `records.csv`.
///
/// Missing values are `None` and serialize as empty cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRow {
    #[serde(rename = "Volume")]
    pub volume: Option<i64>,
    #[serde(rename = "VWAP")]
    pub vwap: Option<f64>,
    #[serde(rename = "Open")]
    pub open: Option<f64>,
    #[serde(rename = "Close")]
    pub close: Option<f64>,
    #[serde(rename = "High")]
    pub high: Option<f64>,
    #[serde(rename = "Low")]
    pub low: Option<f64>,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Number_of_Trades")]
    pub number_of_trades: Option<i64>,
    #[serde(rename = "Date", with = "date_format")]
    pub date: NaiveDate,
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

impl From<&RawRecord> for ProcessedRow {
    fn from(r: &RawRecord) -> Self {
        Self {
            volume: finite(r.volume).map(|v| v.round() as i64),
            vwap: finite(r.vwap),
            open: finite(r.open),
            close: finite(r.close),
            high: finite(r.high),
            low: finite(r.low),
            timestamp: r.timestamp_ms(),
            number_of_trades: finite(r.trade_count).map(|v| v.round() as i64),
            date: r.timestamp.date(),
        }
    }
}

impl From<&ProcessedRow> for RawRecord {
    fn from(row: &ProcessedRow) -> Self {
        let timestamp = chrono::DateTime::from_timestamp_millis(row.timestamp)
            .map(|dt| dt.naive_utc())
            .unwrap_or_else(|| row.date.and_time(chrono::NaiveTime::MIN));
        let or_nan = |v: Option<f64>| v.unwrap_or(f64::NAN);
        Self {
            timestamp,
            open: or_nan(row.open),
            high: or_nan(row.high),
            low: or_nan(row.low),
            close: or_nan(row.close),
            volume: or_nan(row.volume.map(|v| v as f64)),
            vwap: or_nan(row.vwap),
            trade_count: or_nan(row.number_of_trades.map(|v| v as f64)),
        }
    }
}

mod date_format {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d";

    pub fn serialize<S: Serializer>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDate::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Output of one `prepare` call. Owned by the pipeline run that produced it.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub features: FeatureMatrix,
    pub labels: Vec<f64>,
    pub rows: Vec<ProcessedRow>,
    pub scaler: Scaler,
}

impl PreparedData {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureStore {
    fill_missing: Option<f64>,
}

impl FeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace missing predictor cells with `value` after standardization.
    pub fn with_fill(value: f64) -> Self {
        Self {
            fill_missing: Some(value),
        }
    }

    pub fn feature_columns() -> Vec<String> {
        FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect()
    }

    /// Unscaled predictor matrix, one row per record.
    pub fn raw_matrix(records: &[RawRecord]) -> FeatureMatrix {
        let mut data = Vec::with_capacity(records.len() * FEATURE_COLUMNS.len());
        for r in records {
            data.extend_from_slice(&[
                r.volume,
                r.vwap,
                r.open,
                r.high,
                r.low,
                r.timestamp_ms() as f64,
                r.trade_count,
            ]);
        }
        FeatureMatrix::from_flat(Self::feature_columns(), records.len(), data)
    }

    /// Standardize predictors using statistics of `records` only and split off the label.
    ///
    /// Rows without an observed close are dropped before fitting. Empty input is not an
    /// error: the result has zero rows and a warning is logged.
    pub fn prepare(&self, records: &[RawRecord]) -> PreparedData {
        let labelled: Vec<RawRecord> = records.iter().filter(|r| r.close.is_finite()).cloned().collect();
        let unlabelled = records.len() - labelled.len();
        if unlabelled > 0 {
            warn!(unlabelled, "dropped rows without an observed close");
        }
        let records = labelled.as_slice();

        let rows: Vec<ProcessedRow> = records.iter().map(ProcessedRow::from).collect();
        let labels: Vec<f64> = records.iter().map(|r| r.close).collect();

        if records.is_empty() {
            warn!("feature store received no records; producing an empty matrix");
            let features = FeatureMatrix::empty(Self::feature_columns());
            let scaler = Scaler::fit(&features);
            return PreparedData {
                features,
                labels,
                rows,
                scaler,
            };
        }

        let raw = Self::raw_matrix(records);
        let (scaler, mut features) = Scaler::fit_transform(&raw);

        let missing = features.missing_count();
        if missing > 0 {
            match self.fill_missing {
                Some(value) => {
                    features.fill_missing(value);
                    warn!(missing, value, "filled missing predictor cells");
                }
                None => warn!(missing, "predictor matrix has missing cells"),
            }
        }
        debug!(rows = features.n_rows(), cols = features.n_cols(), "prepared features");
        PreparedData {
            features,
            labels,
            rows,
            scaler,
        }
    }
}
