//! Clock abstraction for age and expiry decisions
//!
//! Separates wall-clock acquisition from the components that consume it,
//! so that token lifetimes and cache expiry can be tested deterministically.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// Clock trait for generating wall-clock timestamps
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time (UTC)
    fn now(&self) -> DateTime<Utc>;

    /// Current wall-clock time in nanoseconds since the Unix epoch
    fn now_nanos(&self) -> i64 {
        self.now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

/// System clock, the default for production use
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for testing
///
/// Returns a predetermined instant which tests can advance explicitly.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Create a fixed clock from epoch seconds
    pub fn at_timestamp(secs: i64) -> Self {
        Self::new(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    /// Move the clock forward
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock();
        *now += duration;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotone_enough() {
        let clock = SystemClock;
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_fixed_clock_advance() {
        let clock = FixedClock::at_timestamp(1_700_000_000);
        let t1 = clock.now();
        clock.advance(chrono::Duration::seconds(90));
        let t2 = clock.now();
        assert_eq!((t2 - t1).num_seconds(), 90);
    }

    #[test]
    fn test_now_nanos() {
        let clock = FixedClock::at_timestamp(1_700_000_000);
        assert_eq!(clock.now_nanos(), 1_700_000_000 * 1_000_000_000);
    }
}
