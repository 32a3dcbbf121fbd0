//! CSV import source.
//!
//! Reads one file per symbol from a directory (`{dir}/{SYMBOL}.csv`). Headers are
//! matched case-insensitively and accept both the exported column names
//! (`Volume`, `VWAP`, `Number_of_Trades`, ...) and the short aggregate keys
//! (`v`, `vw`, `n`, ...). Cells are text; blanks and unparsable numbers become
//! missing values instead of failing the import.

use super::provider::{
    check_range, normalize_order, DataError, FetchResult, MarketDataSource, SourceKind,
};
use crate::domain::{Granularity, RawRecord};
use chrono::{NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct CsvSource {
    dir: PathBuf,
}

#[derive(Debug, Default)]
struct ColumnMap {
    timestamp: Option<usize>,
    date: Option<usize>,
    open: Option<usize>,
    high: Option<usize>,
    low: Option<usize>,
    close: Option<usize>,
    volume: Option<usize>,
    vwap: Option<usize>,
    trade_count: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let mut map = ColumnMap::default();
        for (i, h) in headers.iter().enumerate() {
            match h.trim().to_ascii_lowercase().as_str() {
                "timestamp" | "t" => map.timestamp = Some(i),
                "date" => map.date = Some(i),
                "open" | "o" => map.open = Some(i),
                "high" | "h" => map.high = Some(i),
                "low" | "l" => map.low = Some(i),
                "close" | "c" => map.close = Some(i),
                "volume" | "v" => map.volume = Some(i),
                "vwap" | "vw" => map.vwap = Some(i),
                "number_of_trades" | "trade_count" | "n" => map.trade_count = Some(i),
                _ => {}
            }
        }
        map
    }
}

impl CsvSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.csv"))
    }

    /// Read every row of a CSV file, ascending and deduplicated by timestamp.
    pub fn read_file(path: &Path) -> Result<Vec<RawRecord>, DataError> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| DataError::Csv(format!("{}: {e}", path.display())))?;
        let headers = rdr
            .headers()
            .map_err(|e| DataError::Csv(format!("headers: {e}")))?
            .clone();
        let cols = ColumnMap::from_headers(&headers);
        if cols.timestamp.is_none() && cols.date.is_none() {
            return Err(DataError::Csv(format!(
                "{}: needs a Timestamp or Date column",
                path.display()
            )));
        }

        let mut records = Vec::new();
        for (line, row) in rdr.records().enumerate() {
            let row = row.map_err(|e| DataError::Csv(format!("row {}: {e}", line + 2)))?;
            let Some(timestamp) = row_timestamp(&row, &cols) else {
                warn!(file = %path.display(), row = line + 2, "skipping row without a parsable timestamp");
                continue;
            };
            let num = |idx: Option<usize>| idx.and_then(|i| row.get(i)).map_or(f64::NAN, coerce_number);
            records.push(RawRecord {
                timestamp,
                open: num(cols.open),
                high: num(cols.high),
                low: num(cols.low),
                close: num(cols.close),
                volume: num(cols.volume),
                vwap: num(cols.vwap),
                trade_count: num(cols.trade_count),
            });
        }
        normalize_order(&mut records);
        Ok(records)
    }
}

/// Text cell to number; blanks and garbage become `NaN`.
pub fn coerce_number(cell: &str) -> f64 {
    let cell = cell.trim();
    if cell.is_empty() {
        return f64::NAN;
    }
    cell.parse::<f64>().unwrap_or(f64::NAN)
}

fn row_timestamp(row: &csv::StringRecord, cols: &ColumnMap) -> Option<NaiveDateTime> {
    if let Some(ms) = cols
        .timestamp
        .and_then(|i| row.get(i))
        .and_then(|s| s.trim().parse::<i64>().ok())
    {
        return chrono::DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc());
    }
    cols.date
        .and_then(|i| row.get(i))
        .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

impl MarketDataSource for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn fetch(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchResult, DataError> {
        check_range(start, end)?;
        let path = self.path_for(symbol);
        let records: Vec<RawRecord> = Self::read_file(&path)?
            .into_iter()
            .filter(|r| {
                let d = r.timestamp.date();
                d >= start && d <= end
            })
            .collect();
        debug!(symbol, rows = records.len(), "loaded csv records");
        Ok(FetchResult {
            symbol: symbol.to_string(),
            granularity,
            records,
            source: SourceKind::CsvImport,
        })
    }

    fn is_available(&self) -> bool {
        self.dir.is_dir()
    }
}
