//! Half-open time windows evaluated by the drift monitor.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open interval `[start, start + period)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub period_secs: i64,
}

impl TimeWindow {
    pub fn new(start: NaiveDateTime, period: Duration) -> Self {
        Self {
            start,
            period_secs: period.num_seconds(),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::seconds(self.period_secs)
    }

    /// Exclusive end of the window.
    pub fn end(&self) -> NaiveDateTime {
        self.start + self.period()
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts < self.end()
    }

    /// The adjacent window: starts exactly where this one ends.
    pub fn next(&self) -> Self {
        Self {
            start: self.end(),
            period_secs: self.period_secs,
        }
    }

    /// True when `other` starts exactly one period after this window, with the same period.
    pub fn is_followed_by(&self, other: &TimeWindow) -> bool {
        self.period_secs == other.period_secs && other.start == self.end()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day_window() -> TimeWindow {
        let start = NaiveDate::from_ymd_opt(2023, 2, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        TimeWindow::new(start, Duration::days(1))
    }

    #[test]
    fn window_is_half_open() {
        let w = day_window();
        assert!(w.contains(w.start));
        assert!(!w.contains(w.end()));
        assert!(w.contains(w.end() - Duration::seconds(1)));
    }

    #[test]
    fn next_window_is_adjacent() {
        let w = day_window();
        let n = w.next();
        assert_eq!(n.start, w.end());
        assert!(w.is_followed_by(&n));
        assert!(!n.is_followed_by(&w));
    }

    #[test]
    fn overlapping_window_is_not_a_successor() {
        let w = day_window();
        let overlap = TimeWindow::new(w.start + Duration::hours(12), Duration::days(1));
        assert!(!w.is_followed_by(&overlap));
        let gap = TimeWindow::new(w.end() + Duration::days(1), Duration::days(1));
        assert!(!w.is_followed_by(&gap));
    }
}
