//! Rotation pattern learning and the polling schedule derived from it.
//!
//! Everything here is pure: callers pass `now` in (epoch seconds) so the
//! state machine can be driven deterministically from tests.

use serde::Serialize;
use zeroize::Zeroize;

/// Maximum number of rotation intervals kept for pattern detection.
pub const MAX_INTERVALS: usize = 5;

/// Population variance (seconds²) under which a window counts as consistent.
pub const VARIANCE_THRESHOLD: f64 = 100.0;

/// Confidence at which the learned cadence drives scheduling.
pub const CONFIDENCE_THRESHOLD: u32 = 3;

/// Poll interval used when a credential source call fails.
pub const ERROR_BACKOFF_SECS: u64 = 30;

/// Sliding window of observed rotation intervals plus a running confidence score.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntervalPattern {
    /// Whole seconds between consecutive rotations, oldest first.
    pub observed_intervals: Vec<u64>,
    /// Epoch seconds of the last detected rotation; 0.0 before any.
    pub last_rotation_time: f64,
    pub confidence: u32,
}

impl IntervalPattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interval, evict the oldest beyond [`MAX_INTERVALS`], and
    /// re-score confidence against the new window.
    pub fn record_interval(&mut self, interval_secs: u64) {
        self.observed_intervals.push(interval_secs);
        if self.observed_intervals.len() > MAX_INTERVALS {
            self.observed_intervals.remove(0);
        }
        self.update_confidence();
    }

    fn update_confidence(&mut self) {
        let Some(variance) = self.variance() else {
            return;
        };

        if variance < VARIANCE_THRESHOLD {
            self.confidence += 1;
            tracing::info!(
                confidence = self.confidence,
                avg_interval = self.average_interval().unwrap_or_default(),
                "Rotation pattern consistent"
            );
        } else {
            self.confidence = self.confidence.saturating_sub(1);
            tracing::debug!(
                confidence = self.confidence,
                variance,
                "Rotation pattern inconsistent"
            );
        }
    }

    /// Mean of the current window, `None` when empty.
    pub fn average_interval(&self) -> Option<f64> {
        if self.observed_intervals.is_empty() {
            return None;
        }
        let sum: u64 = self.observed_intervals.iter().sum();
        Some(sum as f64 / self.observed_intervals.len() as f64)
    }

    /// Population variance of the current window, `None` when empty.
    pub fn variance(&self) -> Option<f64> {
        let avg = self.average_interval()?;
        let n = self.observed_intervals.len() as f64;
        Some(
            self.observed_intervals
                .iter()
                .map(|&x| (x as f64 - avg).powi(2))
                .sum::<f64>()
                / n,
        )
    }

    /// True once the learned cadence is trusted for scheduling.
    pub fn is_adaptive(&self) -> bool {
        self.confidence >= CONFIDENCE_THRESHOLD && !self.observed_intervals.is_empty()
    }

    /// Mean interval, but only once the pattern is trusted.
    pub fn learned_interval(&self) -> Option<f64> {
        if self.is_adaptive() {
            self.average_interval()
        } else {
            None
        }
    }

    /// Seconds since the last rotation, 0 before any rotation was seen.
    pub fn age(&self, now: f64) -> f64 {
        if self.last_rotation_time > 0.0 {
            now - self.last_rotation_time
        } else {
            0.0
        }
    }
}

/// Which rule produced the current poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollingStrategy {
    /// Polls are timed against the learned rotation cadence.
    Adaptive,
    /// Generic idle backoff while the cadence is still unknown.
    Discovery,
}

impl PollingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollingStrategy::Adaptive => "adaptive",
            PollingStrategy::Discovery => "discovery",
        }
    }
}

/// Result of folding one successful fetch into the state.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The very first credential seen; nothing to measure against yet.
    First,
    /// The credential changed after `interval_secs`.
    Rotated { interval_secs: u64 },
    /// Same credential as last time.
    Unchanged,
}

/// Mutable poller state. Lives behind the poller's mutex.
#[derive(Debug, Clone)]
pub struct PollerState {
    pub current_credential: Option<String>,
    pub pattern: IntervalPattern,
    pub consecutive_same_count: u32,
    pub current_poll_interval: u64,
}

impl Default for PollerState {
    fn default() -> Self {
        Self {
            current_credential: None,
            pattern: IntervalPattern::new(),
            consecutive_same_count: 0,
            current_poll_interval: ERROR_BACKOFF_SECS,
        }
    }
}

impl PollerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a freshly fetched credential into the state.
    ///
    /// `count_same` is false for out-of-band fetches, which must not push the
    /// idle backoff forward.
    pub fn observe(&mut self, credential: String, now: f64, count_same: bool) -> FetchOutcome {
        if self.current_credential.as_deref() == Some(credential.as_str()) {
            if count_same {
                self.consecutive_same_count += 1;
            }
            return FetchOutcome::Unchanged;
        }

        let outcome = if self.current_credential.is_some() {
            let interval = (now - self.pattern.last_rotation_time).max(0.0);
            let interval_secs = interval as u64;
            self.pattern.record_interval(interval_secs);
            FetchOutcome::Rotated { interval_secs }
        } else {
            FetchOutcome::First
        };

        if let Some(mut previous) = self.current_credential.replace(credential) {
            previous.zeroize();
        }
        self.pattern.last_rotation_time = now;
        self.consecutive_same_count = 0;
        outcome
    }

    pub fn strategy(&self) -> PollingStrategy {
        if self.pattern.is_adaptive() {
            PollingStrategy::Adaptive
        } else {
            PollingStrategy::Discovery
        }
    }

    /// Seconds to wait before the next poll.
    pub fn next_poll_interval(&self, now: f64) -> u64 {
        if let Some(avg) = self.pattern.learned_interval() {
            let remaining = avg - (now - self.pattern.last_rotation_time);
            return if remaining > 300.0 {
                120
            } else if remaining > 120.0 {
                60
            } else {
                30
            };
        }

        match self.consecutive_same_count {
            0..=4 => 30,
            5..=19 => 60,
            20..=39 => 120,
            _ => 300,
        }
    }
}
