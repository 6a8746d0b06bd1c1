//! Adaptive credential poller.
//!
//! Runs one background task that repeatedly asks a [`CredentialSource`] for
//! the current credential, detects rotations, learns the rotation cadence,
//! and schedules the next poll from what it has learned. Source failures are
//! logged and retried after a fixed backoff; they never end the loop.

pub mod pattern;
pub mod source;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{RelayError, Result};

pub use pattern::{FetchOutcome, IntervalPattern, PollerState, PollingStrategy};
pub use source::{CommandSource, CredentialSource};

/// Immutable copy of the poller's view of the current credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenSnapshot {
    pub token: String,
    /// Epoch seconds of the last detected rotation.
    pub last_refresh: f64,
    pub age_seconds: f64,
    pub confidence_level: u32,
    pub refresh_intervals: Vec<u64>,
    pub polling_interval: u64,
    /// Mean rotation interval, present once confidence is high enough to
    /// schedule from it.
    pub learned_interval: Option<f64>,
    pub polling_strategy: PollingStrategy,
}

/// Pattern statistics. Unlike [`TokenSnapshot`] this is available before
/// the first credential arrives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollerStats {
    pub pattern_confidence: u32,
    pub observed_intervals: Vec<u64>,
    pub average_interval: Option<f64>,
    pub last_refresh: f64,
    pub current_age: f64,
    pub consecutive_same_count: u32,
    pub current_poll_interval: u64,
    pub current_polling_strategy: PollingStrategy,
}

pub struct AdaptivePoller {
    source: Arc<dyn CredentialSource>,
    clock: Arc<dyn Clock>,
    state: Mutex<PollerState>,
    running: AtomicBool,
    wake: Notify,
    error_backoff: Duration,
}

impl AdaptivePoller {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self::with_clock(source, Arc::new(SystemClock))
    }

    pub fn with_clock(source: Arc<dyn CredentialSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            state: Mutex::new(PollerState::new()),
            running: AtomicBool::new(false),
            wake: Notify::new(),
            error_backoff: Duration::from_secs(pattern::ERROR_BACKOFF_SECS),
        }
    }

    /// Override the fixed delay used after a failed source call.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the polling loop on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> PollerTask {
        self.running.store(true, Ordering::SeqCst);
        info!("Starting adaptive credential polling");
        let poller = Arc::clone(self);
        PollerTask {
            handle: tokio::spawn(async move { poller.run().await }),
        }
    }

    /// Ask the loop to exit. Wakes a pending sleep so shutdown is prompt.
    ///
    /// Only a loop already waiting is woken; no permit is left behind for a
    /// later `start()` to trip over.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping adaptive credential polling");
        }
        self.wake.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        while self.is_running() {
            let next = match self.poll_once().await {
                Ok(secs) => Duration::from_secs(secs),
                Err(e) => {
                    error!(error = %e, "Polling error");
                    self.lock_state().current_poll_interval = self.error_backoff.as_secs();
                    self.error_backoff
                }
            };

            // Register for the wake-up before re-checking the flag, so a
            // stop() landing in between is not missed.
            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            if !self.is_running() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(next) => {}
                _ = woken => {
                    debug!("Poll sleep interrupted");
                }
            }
        }
        info!("Adaptive credential polling stopped");
    }

    /// One scheduled iteration: fetch, fold into the pattern, and return the
    /// number of seconds until the next poll.
    pub async fn poll_once(&self) -> Result<u64> {
        let credential = self.source.fetch().await?;
        let now = self.clock.now_secs();

        let mut state = self.lock_state();
        match state.observe(credential, now, true) {
            FetchOutcome::First => info!("Initial credential acquired"),
            FetchOutcome::Rotated { interval_secs } => {
                info!(
                    interval_secs,
                    confidence = state.pattern.confidence,
                    "Credential rotated"
                );
            }
            FetchOutcome::Unchanged => {}
        }

        let next = state.next_poll_interval(now);
        state.current_poll_interval = next;
        debug!(
            next_poll_secs = next,
            same_count = state.consecutive_same_count,
            strategy = state.strategy().as_str(),
            "Next poll scheduled"
        );
        Ok(next)
    }

    /// Fetch immediately, outside the schedule.
    ///
    /// A changed credential is recorded as a rotation just like a scheduled
    /// poll would record it. An unchanged one leaves the idle backoff
    /// counter and the running sleep alone.
    pub async fn force_refresh(&self) -> Result<String> {
        let credential = match self.source.fetch().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Forced poll failed");
                return Err(e);
            }
        };
        let now = self.clock.now_secs();

        let mut state = self.lock_state();
        if let FetchOutcome::Rotated { interval_secs } =
            state.observe(credential.clone(), now, false)
        {
            info!(interval_secs, "Credential rotation found by forced poll");
        }
        info!("Forced poll completed");
        Ok(credential)
    }

    pub fn snapshot(&self) -> Result<TokenSnapshot> {
        let now = self.clock.now_secs();
        let state = self.lock_state();
        let token = state
            .current_credential
            .clone()
            .ok_or(RelayError::NoCredentialYet)?;

        Ok(TokenSnapshot {
            token,
            last_refresh: state.pattern.last_rotation_time,
            age_seconds: now - state.pattern.last_rotation_time,
            confidence_level: state.pattern.confidence,
            refresh_intervals: state.pattern.observed_intervals.clone(),
            polling_interval: state.current_poll_interval,
            learned_interval: state.pattern.learned_interval(),
            polling_strategy: state.strategy(),
        })
    }

    pub fn stats(&self) -> PollerStats {
        let now = self.clock.now_secs();
        let state = self.lock_state();
        PollerStats {
            pattern_confidence: state.pattern.confidence,
            observed_intervals: state.pattern.observed_intervals.clone(),
            average_interval: state.pattern.average_interval(),
            last_refresh: state.pattern.last_rotation_time,
            current_age: state.pattern.age(now),
            consecutive_same_count: state.consecutive_same_count,
            current_poll_interval: state.current_poll_interval,
            current_polling_strategy: state.strategy(),
        }
    }
}

/// Handle to the spawned polling loop.
pub struct PollerTask {
    handle: JoinHandle<()>,
}

impl PollerTask {
    /// Cancel the task outright, including an in-flight source call.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit. Cancellation counts as a clean exit; only a
    /// panic inside the loop is reported.
    pub async fn join(self) -> std::result::Result<(), JoinError> {
        match self.handle.await {
            Err(e) if e.is_cancelled() => {
                debug!("Poller task cancelled");
                Ok(())
            }
            other => other,
        }
    }
}
