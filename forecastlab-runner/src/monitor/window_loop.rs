//! Long-running window loop: fetch, evaluate, persist, sleep, advance.

use super::drift::DriftMonitor;
use super::report::DriftReport;
use super::MonitorError;
use chrono::{Duration, NaiveDateTime};
use forecastlab_core::data::MarketDataSource;
use forecastlab_core::domain::{Granularity, RawRecord, TimeWindow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

const SLEEP_SLICE: std::time::Duration = std::time::Duration::from_millis(250);

/// Start of the period containing `now`, counted from the Unix epoch.
pub fn aligned_start(now: NaiveDateTime, period_secs: i64) -> NaiveDateTime {
    let secs = now.and_utc().timestamp();
    let aligned = secs - secs.rem_euclid(period_secs.max(1));
    chrono::DateTime::from_timestamp(aligned, 0).map_or(now, |dt| dt.naive_utc())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub attempted: usize,
    pub persisted: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct MonitorLoop {
    monitor: DriftMonitor,
    source: Arc<dyn MarketDataSource>,
    symbol: String,
    granularity: Granularity,
    interval: std::time::Duration,
    halt_on_error: bool,
}

impl MonitorLoop {
    pub fn new(
        monitor: DriftMonitor,
        source: Arc<dyn MarketDataSource>,
        symbol: impl Into<String>,
        granularity: Granularity,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            monitor,
            source,
            symbol: symbol.into(),
            granularity,
            interval,
            halt_on_error: false,
        }
    }

    pub fn halt_on_error(mut self, halt: bool) -> Self {
        self.halt_on_error = halt;
        self
    }

    pub fn monitor(&self) -> &DriftMonitor {
        &self.monitor
    }

    /// Run windows starting at `first` until `cancel` is set or `max_windows` have been attempted.
    ///
    /// `cancel` is checked between windows and during the sleep; a window already being
    /// evaluated runs to completion.
    pub fn run<F>(
        &mut self,
        first: TimeWindow,
        cancel: &AtomicBool,
        max_windows: Option<usize>,
        mut on_report: F,
    ) -> Result<LoopSummary, MonitorError>
    where
        F: FnMut(&DriftReport),
    {
        let mut summary = LoopSummary::default();
        let mut window = first;
        loop {
            if cancel.load(Ordering::SeqCst) {
                info!(next_window = %window.start, "monitor loop cancelled");
                summary.cancelled = true;
                break;
            }
            summary.attempted += 1;
            match self.run_window(window) {
                Ok(report) => {
                    summary.persisted += 1;
                    on_report(&report);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(window_start = %window.start, error = %e, "window evaluation failed; no report persisted");
                    if self.halt_on_error {
                        return Err(e);
                    }
                }
            }
            window = window.next();
            if max_windows.is_some_and(|m| summary.attempted >= m) {
                break;
            }
            self.sleep(cancel);
        }
        Ok(summary)
    }

    fn run_window(&mut self, window: TimeWindow) -> Result<DriftReport, MonitorError> {
        let records = match self.monitor.refresh_model().and_then(|_| self.fetch(window)) {
            Ok(records) => records,
            Err(e) => {
                self.monitor.skip(window)?;
                return Err(e);
            }
        };
        self.monitor.evaluate(window, &records)
    }

    fn fetch(&self, window: TimeWindow) -> Result<Vec<RawRecord>, MonitorError> {
        let start = window.start.date();
        let last = (window.end() - Duration::milliseconds(1)).date();
        let fetched = self.source.fetch(&self.symbol, self.granularity, start, last)?;
        Ok(fetched.records)
    }

    fn sleep(&self, cancel: &AtomicBool) {
        let mut remaining = self.interval;
        while !remaining.is_zero() && !cancel.load(Ordering::SeqCst) {
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn aligned_start_floors_to_period() {
        let now = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(13, 7, 9).unwrap();
        let day = aligned_start(now, 86_400);
        assert_eq!(day, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(0, 0, 0).unwrap());
        let hour = aligned_start(now, 3_600);
        assert_eq!(hour, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(13, 0, 0).unwrap());
    }
}
