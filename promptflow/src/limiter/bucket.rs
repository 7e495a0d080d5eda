//! Token-bucket rate limiting.
//!
//! Each model id owns a bucket of capacity `C` refilling at `r` tokens/sec.
//! A call consumes one token; a caller finding the bucket empty computes its
//! wait, releases the bucket, and suspends on the injected clock before
//! retrying admission. A global semaphore additionally caps in-flight calls
//! across all models.

use crate::clock::Clock;
use crate::config::RateLimitSettings;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Token budget for a single model id.
#[derive(Debug, Clone)]
pub struct RateBudget {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: f64,
}

impl RateBudget {
    /// Creates a full budget.
    #[must_use]
    pub fn new(capacity: f64, refill_rate: f64, now: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: now,
        }
    }

    /// Refills the bucket for the elapsed time, clamped to capacity.
    pub fn refill(&mut self, now: f64) {
        let elapsed = (now - self.last_refill).max(0.0);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
    }

    /// Consumes one token, or returns the wait in seconds until one is due.
    pub fn try_consume(&mut self, now: f64) -> Result<(), f64> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err((1.0 - self.tokens) / self.refill_rate)
        }
    }

    /// Current token count.
    #[must_use]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Bucket capacity.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Per-model token-bucket admission plus the global in-flight cap.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, RateBudget>,
    capacity: f64,
    refill_rate: f64,
    jitter_factor: f64,
    semaphore: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter from settings and a clock.
    #[must_use]
    pub fn new(settings: &RateLimitSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: settings.bucket_capacity,
            refill_rate: settings.refill_rate(),
            jitter_factor: settings.jitter_factor,
            semaphore: Arc::new(Semaphore::new(settings.max_parallel_requests)),
            clock,
        }
    }

    /// Acquires one admission token for the model, waiting as needed.
    ///
    /// The bucket entry is released before every suspension; no lock is held
    /// while sleeping.
    pub async fn acquire(&self, model: &str) {
        loop {
            let wait = {
                let now = self.clock.monotonic();
                let mut entry = self
                    .buckets
                    .entry(model.to_string())
                    .or_insert_with(|| RateBudget::new(self.capacity, self.refill_rate, now));
                entry.value_mut().try_consume(now)
            };

            match wait {
                Ok(()) => return,
                Err(base_wait) => {
                    let jitter = base_wait * self.jitter_factor * rand::thread_rng().gen::<f64>();
                    let wait = base_wait + jitter;
                    debug!(model = %model, wait_s = wait, "Rate limit: waiting for token");
                    self.clock.sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }
    }

    /// Acquires a slot from the global in-flight cap.
    ///
    /// The returned permit releases the slot on drop.
    pub async fn acquire_slot(&self) -> OwnedSemaphorePermit {
        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed.
            Err(_) => unreachable!("global request semaphore closed"),
        }
    }

    /// Current token count for a model, if its bucket exists.
    #[must_use]
    pub fn tokens(&self, model: &str) -> Option<f64> {
        let now = self.clock.monotonic();
        self.buckets.get_mut(model).map(|mut entry| {
            entry.value_mut().refill(now);
            entry.value().tokens()
        })
    }

    /// Number of free in-flight slots.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::ManualClock;

    fn settings(rpm: f64, capacity: f64) -> RateLimitSettings {
        RateLimitSettings {
            requests_per_minute: rpm,
            bucket_capacity: capacity,
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_budget_refill_formula() {
        let mut budget = RateBudget::new(10.0, 0.5, 0.0);
        budget.tokens = 2.0;

        budget.refill(4.0);

        // min(capacity, tokens + r * dt) = min(10, 2 + 0.5 * 4) = 4
        assert!((budget.tokens() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_budget_never_exceeds_capacity() {
        let mut budget = RateBudget::new(5.0, 1.0, 0.0);

        budget.refill(1000.0);

        assert!((budget.tokens() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_budget_never_negative() {
        let mut budget = RateBudget::new(1.0, 0.1, 0.0);

        assert!(budget.try_consume(0.0).is_ok());
        let wait = budget.try_consume(0.0).unwrap_err();

        assert!(budget.tokens() >= 0.0);
        assert!((wait - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_acquire_consumes_and_waits() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(&settings(60.0, 1.0), clock.clone());

        limiter.acquire("m/a").await;
        assert_eq!(clock.sleeps().len(), 0);

        // Bucket empty: the second acquire must wait ~1s (r = 1 token/s).
        limiter.acquire("m/a").await;
        let sleeps = clock.sleeps();
        assert!(!sleeps.is_empty());
        assert!((sleeps[0] - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_buckets_are_per_model() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(&settings(60.0, 1.0), clock.clone());

        limiter.acquire("m/a").await;
        limiter.acquire("m/b").await;

        // Both drew from their own full bucket; no waiting.
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_global_slot_cap() {
        let clock = Arc::new(ManualClock::new());
        let mut s = settings(600.0, 100.0);
        s.max_parallel_requests = 2;
        let limiter = RateLimiter::new(&s, clock);

        let p1 = limiter.acquire_slot().await;
        let _p2 = limiter.acquire_slot().await;
        assert_eq!(limiter.available_slots(), 0);

        drop(p1);
        assert_eq!(limiter.available_slots(), 1);
    }
}
