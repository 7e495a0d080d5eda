//! Injectable clock capability.
//!
//! All waiting in the engine (rate-limiter admission, backoff, breaker
//! cooldowns) goes through a [`Clock`] so tests can substitute a manual
//! clock and assert on timing without real sleeps.

use async_trait::async_trait;
use std::time::Duration;

/// Time capability used by the limiter, breaker, dispatcher, and caches.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic seconds since an arbitrary per-clock origin.
    fn monotonic(&self) -> f64;

    /// Suspends the calling task for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio runtime.
///
/// Uses `tokio::time` for both readings and sleeps, so tests running under
/// `tokio::time::pause` observe virtual time end-to-end.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    /// Creates a new system clock with its origin at construction time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn monotonic(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_monotonic_under_paused_time() {
        let clock = SystemClock::new();
        let before = clock.monotonic();

        clock.sleep(Duration::from_secs(5)).await;

        let after = clock.monotonic();
        assert!((after - before - 5.0).abs() < 0.1);
    }
}
