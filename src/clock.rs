//! Wall-clock abstraction so expiry and rotation timing can be driven in tests.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Seconds since the Unix epoch, with millisecond precision.
    fn now_secs(&self) -> f64 {
        self.now().timestamp_millis() as f64 / 1000.0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    /// Move the clock forward by `secs` (fractions allowed).
    pub fn advance(&self, secs: f64) {
        let step = chrono::Duration::milliseconds((secs * 1000.0) as i64);
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += step;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(120.5);
        assert_eq!((clock.now() - start).num_milliseconds(), 120_500);
        assert!((clock.now_secs() - (start.timestamp_millis() as f64 / 1000.0 + 120.5)).abs() < 1e-6);
    }
}
