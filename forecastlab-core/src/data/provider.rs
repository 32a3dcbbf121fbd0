//! Market data source trait and structured error types.
//!
//! `MarketDataSource` abstracts over where raw records come from (Polygon REST,
//! CSV import, synthetic generator) so the collect stage can swap implementations
//! and tests can run offline.

use crate::domain::{Granularity, RawRecord};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error types for data collection.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("records out of order at index {index}")]
    OutOfOrder { index: usize },

    #[error("csv import error: {0}")]
    Csv(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data error: {0}")]
    Other(String),
}

/// Where a batch of records came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Polygon,
    CsvImport,
    Synthetic,
}

/// Records returned by one fetch, ascending by timestamp.
///
/// An empty `records` vector is a valid result.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub symbol: String,
    pub granularity: Granularity,
    pub records: Vec<RawRecord>,
    pub source: SourceKind,
}

impl FetchResult {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Upstream market data: `(symbol, granularity, start, end)` to ordered records.
pub trait MarketDataSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch records for `symbol` over the inclusive date range `[start, end]`.
    fn fetch(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchResult, DataError>;

    /// Whether the source is currently accepting requests.
    fn is_available(&self) -> bool;
}

/// Reject an inverted range before any request is made.
pub(crate) fn check_range(start: NaiveDate, end: NaiveDate) -> Result<(), DataError> {
    if start > end {
        return Err(DataError::InvalidRange { start, end });
    }
    Ok(())
}

/// Sort ascending and drop duplicate timestamps, keeping the first occurrence.
pub fn normalize_order(records: &mut Vec<RawRecord>) {
    records.sort_by_key(|r| r.timestamp);
    records.dedup_by_key(|r| r.timestamp);
}

/// BLAKE3 hash over the JSON form of the records, used to fingerprint a collection.
pub fn dataset_hash(records: &[RawRecord]) -> String {
    let mut hasher = blake3::Hasher::new();
    for r in records {
        hasher.update(&r.timestamp_ms().to_le_bytes());
        for v in [r.open, r.high, r.low, r.close, r.volume, r.vwap, r.trade_count] {
            hasher.update(&v.to_bits().to_le_bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(day: u32, close: f64) -> RawRecord {
        RawRecord {
            timestamp: NaiveDate::from_ymd_opt(2024, 3, day)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            vwap: close,
            trade_count: 1.0,
        }
    }

    #[test]
    fn normalize_sorts_and_dedups() {
        let mut records = vec![rec(3, 3.0), rec(1, 1.0), rec(3, 9.0), rec(2, 2.0)];
        normalize_order(&mut records);
        assert_eq!(records.len(), 3);
        assert!(crate::domain::is_strictly_ordered(&records));
    }

    #[test]
    fn dataset_hash_changes_with_values() {
        let a = vec![rec(1, 1.0), rec(2, 2.0)];
        let b = vec![rec(1, 1.0), rec(2, 2.5)];
        assert_eq!(dataset_hash(&a), dataset_hash(&a.clone()));
        assert_ne!(dataset_hash(&a), dataset_hash(&b));
    }

    #[test]
    fn inverted_range_rejected() {
        let a = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let b = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(matches!(
            check_range(a, b),
            Err(DataError::InvalidRange { .. })
        ));
        assert!(check_range(b, a).is_ok());
    }
}
