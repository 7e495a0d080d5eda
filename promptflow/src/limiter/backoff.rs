//! Explicit backoff state machine for transient-failure retries.
//!
//! Retry timing is data (attempt counter, next-eligible time) rather than
//! control flow, so the dispatcher can drive it through the injected clock
//! and tests can assert on delays without real waits.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Initial delay in seconds.
    pub initial_seconds: f64,
    /// Delay cap in seconds.
    pub max_seconds: f64,
    /// Jitter fraction added to each delay (0.0–1.0).
    pub jitter_factor: f64,
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_seconds: 2.0,
            max_seconds: 60.0,
            jitter_factor: 0.2,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Creates a new policy.
    #[must_use]
    pub fn new(initial_seconds: f64, max_seconds: f64, max_retries: u32) -> Self {
        Self {
            initial_seconds,
            max_seconds,
            jitter_factor: 0.2,
            max_retries,
        }
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Base delay for an attempt: `min(initial * 2^attempt, max)`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> f64 {
        let factor = 2_f64.powi(attempt.min(31) as i32);
        (self.initial_seconds * factor).min(self.max_seconds)
    }
}

/// Mutable retry state for one operation.
#[derive(Debug, Default)]
pub struct BackoffState {
    attempt: u32,
    next_eligible: f64,
}

impl BackoffState {
    /// Creates fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of failures recorded so far.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Earliest monotonic time the next attempt is eligible.
    #[must_use]
    pub fn next_eligible(&self) -> f64 {
        self.next_eligible
    }

    /// Records a failure at `now` and returns the delay before the next
    /// attempt, or `None` if retries are exhausted.
    pub fn record_failure(&mut self, policy: &BackoffPolicy, now: f64) -> Option<Duration> {
        if self.attempt >= policy.max_retries {
            return None;
        }

        let base = policy.base_delay(self.attempt);
        let jitter = base * policy.jitter_factor * rand::thread_rng().gen::<f64>();
        let delay = base + jitter;

        self.attempt += 1;
        self.next_eligible = now + delay;

        Some(Duration::from_secs_f64(delay))
    }

    /// Resets the state for a new operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_eligible = 0.0;
    }
}
