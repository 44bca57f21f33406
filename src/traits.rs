//! Time abstraction so update windows can be tested deterministically.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, DurationRound, Utc};

/// Source of the current time for scheduled runs.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current time truncated to the start of the hour.
    fn current_hour(&self) -> DateTime<Utc> {
        truncate_to_hour(self.now_utc())
    }

    /// Hour-aligned window reaching `history_days` back and `horizon_days`
    /// ahead of the current hour.
    fn fetch_window(&self, history_days: i64, horizon_days: i64) -> HourWindow {
        let now = self.current_hour();
        HourWindow {
            start: now - Duration::days(history_days),
            now,
            end: now + Duration::days(horizon_days),
        }
    }
}

/// Span of hours fetched by one data update.
///
/// Observations are requested for `start..=now`, forecasts for `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourWindow {
    pub start: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HourWindow {
    /// Number of hourly records the window covers, both ends included.
    pub fn hours(&self) -> i64 {
        (self.end - self.start).num_hours() + 1
    }

    pub fn is_past(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp <= self.now
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a settable instant, shared between clones.
#[derive(Debug, Clone)]
pub struct MockClock {
    instant: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Arc::new(Mutex::new(instant)),
        }
    }

    pub fn set_time(&self, instant: DateTime<Utc>) {
        *self.instant.lock().unwrap() = instant;
    }

    /// Move forward, e.g. by one scheduler interval.
    pub fn advance(&self, by: Duration) {
        *self.instant.lock().unwrap() += by;
    }
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.instant.lock().unwrap()
    }
}

/// Truncate a timestamp to the start of its hour.
///
/// Record keys are hour-aligned; anything finer would create a second record
/// for the same hour.
pub fn truncate_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.duration_trunc(Duration::hours(1)).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, d, h, m, 0).unwrap()
    }

    #[test]
    fn test_system_clock_is_close_to_now() {
        let drift = Utc::now() - SystemClock.now_utc();
        assert!(drift.num_seconds().abs() < 5);
    }

    #[test]
    fn test_current_hour_truncates() {
        let clock = MockClock::new(at(17, 10, 42));

        let hour = clock.current_hour();

        assert_eq!(hour, at(17, 10, 0));
        assert_eq!(hour.second(), 0);
    }

    #[test]
    fn test_truncate_keeps_aligned_hour() {
        assert_eq!(truncate_to_hour(at(17, 23, 0)), at(17, 23, 0));
    }

    #[test]
    fn test_default_update_window() {
        let clock = MockClock::new(at(15, 12, 20));

        let window = clock.fetch_window(1, 2);

        assert_eq!(window.start, at(14, 12, 0));
        assert_eq!(window.now, at(15, 12, 0));
        assert_eq!(window.end, at(17, 12, 0));
        assert_eq!(window.hours(), 73);
        assert!(window.is_past(at(15, 12, 0)));
        assert!(!window.is_past(at(15, 13, 0)));
    }

    #[test]
    fn test_window_follows_clones_of_mock_clock() {
        let clock = MockClock::new(at(15, 23, 30));
        let scheduler_view = clock.clone();

        clock.advance(Duration::hours(1));

        assert_eq!(scheduler_view.fetch_window(1, 2).now, at(16, 0, 0));

        clock.set_time(at(1, 0, 0));
        assert_eq!(scheduler_view.current_hour(), at(1, 0, 0));
    }
}
