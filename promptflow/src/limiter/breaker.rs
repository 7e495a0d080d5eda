//! Per-model circuit breaking.
//!
//! A model's circuit opens after a run of consecutive failures. While open,
//! calls are rejected locally with [`CircuitOpenError`] — no network I/O and
//! no rate-limit token consumption. After the cooldown the circuit admits
//! exactly one probe call: success closes it, failure re-opens it with a
//! grown cooldown.

use crate::clock::Clock;
use crate::config::RateLimitSettings;
use crate::errors::CircuitOpenError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Circuit state for a model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests pass through.
    #[default]
    Closed,
    /// Endpoint considered down; requests fail fast.
    Open,
    /// Cooldown elapsed; one probe call is testing the endpoint.
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<f64>,
    current_cooldown: f64,
    probe_in_flight: bool,
}

impl BreakerEntry {
    fn new(cooldown: f64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            current_cooldown: cooldown,
            probe_in_flight: false,
        }
    }
}

/// Per-model circuit breaker map.
///
/// Long-lived, shared across runs; injected into the dispatcher rather than
/// held as a process-wide singleton so tests can isolate state and clocks.
#[derive(Debug)]
pub struct CircuitBreaker {
    entries: DashMap<String, BreakerEntry>,
    threshold: u32,
    base_cooldown: f64,
    growth: f64,
    max_cooldown: f64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Creates a breaker from settings and a clock.
    #[must_use]
    pub fn new(settings: &RateLimitSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            threshold: settings.failure_threshold,
            base_cooldown: settings.cooldown_seconds,
            growth: settings.cooldown_growth,
            max_cooldown: settings.max_backoff_seconds,
            clock,
        }
    }

    /// Checks whether a call to the model may proceed.
    ///
    /// Moves an open circuit to half-open once its cooldown elapsed and
    /// reserves the single probe slot for the caller.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] while the circuit is open or while a
    /// half-open probe is already in flight.
    pub fn check(&self, model: &str) -> Result<(), CircuitOpenError> {
        let now = self.clock.monotonic();
        let mut entry = self
            .entries
            .entry(model.to_string())
            .or_insert_with(|| BreakerEntry::new(self.base_cooldown));
        let entry = entry.value_mut();

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = entry.last_failure.map_or(f64::MAX, |t| now - t);
                if elapsed >= entry.current_cooldown {
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    debug!(model = %model, "Circuit half-open; admitting probe call");
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        model: model.to_string(),
                        retry_after_seconds: entry.current_cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    Err(CircuitOpenError {
                        model: model.to_string(),
                        retry_after_seconds: 0.0,
                    })
                } else {
                    entry.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, model: &str) {
        let mut entry = self
            .entries
            .entry(model.to_string())
            .or_insert_with(|| BreakerEntry::new(self.base_cooldown));
        let entry = entry.value_mut();

        entry.failure_count = 0;
        if entry.state == CircuitState::HalfOpen {
            entry.state = CircuitState::Closed;
            entry.current_cooldown = self.base_cooldown;
            debug!(model = %model, "Circuit closed after successful probe");
        }
        entry.probe_in_flight = false;
    }

    /// Records a failed call.
    pub fn record_failure(&self, model: &str) {
        let now = self.clock.monotonic();
        let mut entry = self
            .entries
            .entry(model.to_string())
            .or_insert_with(|| BreakerEntry::new(self.base_cooldown));
        let entry = entry.value_mut();

        entry.failure_count += 1;
        entry.last_failure = Some(now);

        match entry.state {
            CircuitState::Closed if entry.failure_count >= self.threshold => {
                entry.state = CircuitState::Open;
                warn!(
                    model = %model,
                    failures = entry.failure_count,
                    cooldown_s = entry.current_cooldown,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.probe_in_flight = false;
                entry.current_cooldown =
                    (entry.current_cooldown * self.growth).min(self.max_cooldown);
                warn!(
                    model = %model,
                    cooldown_s = entry.current_cooldown,
                    "Circuit re-opened after failed probe"
                );
            }
            _ => {}
        }
    }

    /// Returns the circuit state for a model.
    #[must_use]
    pub fn state(&self, model: &str) -> CircuitState {
        self.entries
            .get(model)
            .map_or(CircuitState::Closed, |e| e.state)
    }
}
