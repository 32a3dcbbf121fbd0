//! Append-only JSONL metrics table keyed by window start.

use super::report::DriftReport;
use super::MonitorError;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

pub struct MetricsSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetricsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one report as a single write. A window start already present is rejected.
    pub fn append(&self, report: &DriftReport) -> Result<(), MonitorError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self
            .read_all()?
            .iter()
            .any(|r| r.window_start == report.window_start)
        {
            return Err(MonitorError::DuplicateWindow(report.window_start));
        }
        let mut line = serde_json::to_string(report)?;
        line.push('\n');

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.io(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io(e))?;
        file.write_all(line.as_bytes()).map_err(|e| self.io(e))?;
        file.flush().map_err(|e| self.io(e))
    }

    /// All persisted reports, skipping malformed lines.
    pub fn read_all(&self) -> Result<Vec<DriftReport>, MonitorError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path).map_err(|e| self.io(e))?;
        let mut reports = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io(e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(r) => reports.push(r),
                Err(e) => warn!(line = n + 1, error = %e, "skipping malformed metrics line"),
            }
        }
        Ok(reports)
    }

    pub fn last(&self) -> Result<Option<DriftReport>, MonitorError> {
        Ok(self.read_all()?.into_iter().max_by_key(|r| r.window_start))
    }

    fn io(&self, source: std::io::Error) -> MonitorError {
        MonitorError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::report::DatasetDrift;
    use chrono::{Duration, NaiveDate};

    fn report(day: u32) -> DriftReport {
        let start = NaiveDate::from_ymd_opt(2024, 1, day).unwrap().and_hms_opt(0, 0, 0).unwrap();
        DriftReport {
            window_start: start,
            window_end: start + Duration::days(1),
            row_count: 10,
            dataset_drift: DatasetDrift::Score(0.25),
            drifted_columns: 1,
            column_count: 4,
            prediction_drift: 0.1,
            missing_share: 0.0,
            rmse: Some(1.5),
            mae: None,
            model_version: 2,
            drift_detected: false,
        }
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MetricsSink::new(dir.path().join("monitoring/metrics.jsonl"));
        sink.append(&report(1)).unwrap();
        sink.append(&report(2)).unwrap();
        let all = sink.read_all().unwrap();
        assert_eq!(all, vec![report(1), report(2)]);
        assert_eq!(sink.last().unwrap(), Some(report(2)));
    }

    #[test]
    fn duplicate_window_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MetricsSink::new(dir.path().join("metrics.jsonl"));
        sink.append(&report(1)).unwrap();
        assert!(matches!(sink.append(&report(1)), Err(MonitorError::DuplicateWindow(_))));
        assert_eq!(sink.read_all().unwrap().len(), 1);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let sink = MetricsSink::new(&path);
        sink.append(&report(1)).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();
        assert_eq!(sink.read_all().unwrap().len(), 1);
    }
}
