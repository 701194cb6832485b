//! Time source used by every scheduling and budgeting decision.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;

/// Upper bound for durations built from external numbers (100 years)
const MAX_SECS: u64 = 100 * 365 * 24 * 3600;

/// Whole seconds as a `chrono::Duration`, saturating instead of panicking
#[inline]
#[must_use]
pub fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_SECS) as i64)
}

/// Source of "now"
pub trait Clock: Send + Sync + Debug {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create clock frozen at `start`
    #[inline]
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Jump to `at`
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
    }

    #[test]
    fn seconds_saturates() {
        assert_eq!(seconds(90), Duration::seconds(90));
        assert_eq!(seconds(u64::MAX), seconds(MAX_SECS));
        let _ = Utc::now() + seconds(u64::MAX);
    }
}
