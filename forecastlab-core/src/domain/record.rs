//! RawRecord: one aggregate bar as delivered by the market-data source.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Aggregate bar for one symbol over one granularity step.
///
/// Missing numeric fields are carried as `NaN` so a window can report its
/// missing-value share instead of dropping rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
    pub trade_count: f64,
}

impl RawRecord {
    /// Number of numeric fields per record (everything except the timestamp).
    pub const NUMERIC_FIELDS: usize = 7;

    /// Epoch milliseconds of the bar start, the unit the upstream source uses.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.and_utc().timestamp_millis()
    }

    /// Count of numeric fields that are missing (`NaN`).
    pub fn missing_fields(&self) -> usize {
        [
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.vwap,
            self.trade_count,
        ]
        .iter()
        .filter(|v| v.is_nan())
        .count()
    }

    /// Basic OHLC sanity check: high >= low, high bounds open/close, low bounds open/close.
    pub fn is_sane(&self) -> bool {
        if self.missing_fields() > 0 {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= 0.0
    }
}

/// Check that records are strictly ascending by timestamp (no duplicates).
pub fn is_strictly_ordered(records: &[RawRecord]) -> bool {
    records.windows(2).all(|w| w[0].timestamp < w[1].timestamp)
}

/// Aggregation step requested from the data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Day,
    Month,
}

impl Granularity {
    /// Timespan keyword used by the aggregates REST API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Day => "day",
            Granularity::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown granularity '{0}' (expected minute, day or month)")]
pub struct ParseGranularityError(pub String);

impl FromStr for Granularity {
    type Err = ParseGranularityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Granularity::Minute),
            "day" => Ok(Granularity::Day),
            "month" => Ok(Granularity::Month),
            other => Err(ParseGranularityError(other.to_string())),
        }
    }
}
