//! Injectable wall clock.
//!
//! Components that stamp or compare timestamps take an `Arc<dyn Clock>` so
//! tests can pin or step time instead of racing `Utc::now()`.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Source of the current UTC instant.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock. Every call to [`Clock::now`] returns the current
/// instant and then advances it by `step` (zero by default).
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(DateTime<Utc>, Duration)>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::stepping(start, Duration::zero())
    }

    /// Clock that advances by `step` after every read.
    pub fn stepping(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            state: Mutex::new((start, step)),
        }
    }

    /// Jump to `t`.
    pub fn set(&self, t: DateTime<Utc>) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.0 = t;
    }

    /// Move forward by `d`.
    pub fn advance(&self, d: Duration) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.0 += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let t = guard.0;
        guard.0 = t + guard.1;
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stepping_clock_advances_after_each_read() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let c = ManualClock::stepping(t0, Duration::seconds(1));
        assert_eq!(c.now(), t0);
        assert_eq!(c.now(), t0 + Duration::seconds(1));
        c.set(t0);
        assert_eq!(c.now(), t0);
    }

    #[test]
    fn frozen_clock_stays_put() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let c = ManualClock::new(t0);
        assert_eq!(c.now(), c.now());
        c.advance(Duration::minutes(3));
        assert_eq!(c.now(), t0 + Duration::minutes(3));
    }
}
