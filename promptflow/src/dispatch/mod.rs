//! Model dispatch with failover.
//!
//! The dispatcher walks a stage's ordered candidate list. For each
//! candidate: circuit check (skipped immediately when open), rate-limiter
//! token, global in-flight slot, then one bounded provider call. Transient
//! failures back off and retry the same candidate up to the configured
//! ceiling before advancing; permanent failures abort the dispatch.

mod provider;

pub use provider::{Completion, CompletionProvider, CompletionRequest};

use crate::clock::Clock;
use crate::config::ModelParams;
use crate::errors::{
    CandidateFailure, CircuitOpenError, DispatchError, ProviderError,
};
use crate::limiter::{BackoffPolicy, BackoffState, CircuitBreaker, RateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A dispatch request for one stage attempt.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Stage id, for diagnostics.
    pub stage: String,
    /// Ordered candidate models (primary first).
    pub candidates: Vec<String>,
    /// System prompt.
    pub system_prompt: String,
    /// User prompt.
    pub user_prompt: String,
    /// Model invocation parameters.
    pub params: ModelParams,
}

impl DispatchRequest {
    /// Creates a new dispatch request.
    #[must_use]
    pub fn new(stage: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            stage: stage.into(),
            candidates,
            system_prompt: String::new(),
            user_prompt: String::new(),
            params: ModelParams::default(),
        }
    }

    /// Sets the prompts.
    #[must_use]
    pub fn with_prompts(
        mut self,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        self.system_prompt = system_prompt.into();
        self.user_prompt = user_prompt.into();
        self
    }

    /// Sets the model parameters.
    #[must_use]
    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    /// The primary candidate model id.
    #[must_use]
    pub fn primary(&self) -> &str {
        self.candidates.first().map_or("", String::as_str)
    }
}

/// Why one candidate was given up on.
enum CandidateOutcome {
    CircuitOpen(CircuitOpenError),
    Transient(ProviderError),
    Permanent(ProviderError),
}

/// Dispatches completion requests across candidate models.
#[derive(Debug)]
pub struct ModelDispatcher {
    provider: Arc<dyn CompletionProvider>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl ModelDispatcher {
    /// Creates a dispatcher over the given provider and shared limiter state.
    #[must_use]
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            limiter,
            breaker,
            backoff,
            clock,
        }
    }

    /// Dispatches a request, failing over through the candidate list.
    ///
    /// No candidate is tried twice within one dispatch; a validation-driven
    /// re-dispatch starts over from the primary.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Permanent`] on an auth or malformed-request failure;
    /// [`DispatchError::AllCandidatesExhausted`] when every candidate failed
    /// or was skipped, carrying the last error per candidate.
    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<Completion, DispatchError> {
        let mut failures = Vec::with_capacity(request.candidates.len());

        for model in &request.candidates {
            match self.try_candidate(model, request).await {
                Ok(completion) => {
                    debug!(
                        stage = %request.stage,
                        model = %model,
                        "Dispatch succeeded"
                    );
                    return Ok(completion);
                }
                Err(CandidateOutcome::CircuitOpen(err)) => {
                    debug!(stage = %request.stage, model = %model, "Skipping candidate: circuit open");
                    failures.push(CandidateFailure {
                        model: model.clone(),
                        error: err.to_string(),
                    });
                }
                Err(CandidateOutcome::Transient(err)) => {
                    warn!(
                        stage = %request.stage,
                        model = %model,
                        error = %err,
                        "Candidate exhausted transient retries; failing over"
                    );
                    failures.push(CandidateFailure {
                        model: model.clone(),
                        error: err.to_string(),
                    });
                }
                Err(CandidateOutcome::Permanent(err)) => {
                    warn!(
                        stage = %request.stage,
                        model = %model,
                        error = %err,
                        "Permanent provider failure; aborting dispatch"
                    );
                    return Err(DispatchError::Permanent(err));
                }
            }
        }

        Err(DispatchError::AllCandidatesExhausted { failures })
    }

    /// Runs one candidate through admission, the bounded call, and the
    /// transient retry loop.
    async fn try_candidate(
        &self,
        model: &str,
        request: &DispatchRequest,
    ) -> Result<Completion, CandidateOutcome> {
        let mut backoff = BackoffState::new();

        loop {
            // Re-checked every attempt: a failed half-open probe re-opens
            // the circuit and must stop the retry loop here, not at the
            // next dispatch.
            self.breaker
                .check(model)
                .map_err(CandidateOutcome::CircuitOpen)?;

            self.limiter.acquire(model).await;
            let permit = self.limiter.acquire_slot().await;

            let completion_request = CompletionRequest {
                model: model.to_string(),
                system_prompt: request.system_prompt.clone(),
                user_prompt: request.user_prompt.clone(),
                temperature: request.params.temperature,
                max_tokens: request.params.max_tokens,
                timeout: Duration::from_secs_f64(request.params.timeout_seconds),
            };

            let result = tokio::time::timeout(
                completion_request.timeout,
                self.provider.send(&completion_request),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::timed_out(
                    model,
                    request.params.timeout_seconds,
                ))
            });
            drop(permit);

            match result {
                Ok(completion) => {
                    self.breaker.record_success(model);
                    return Ok(completion);
                }
                Err(err) if err.is_transient() => {
                    self.breaker.record_failure(model);
                    let now = self.clock.monotonic();
                    match backoff.record_failure(&self.backoff, now) {
                        Some(delay) => {
                            debug!(
                                model = %model,
                                attempt = backoff.attempt(),
                                delay_s = delay.as_secs_f64(),
                                error = %err,
                                "Transient failure; backing off"
                            );
                            self.clock.sleep(delay).await;
                        }
                        None => return Err(CandidateOutcome::Transient(err)),
                    }
                }
                Err(err) => return Err(CandidateOutcome::Permanent(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSettings;
    use crate::errors::ProviderErrorKind;
    use crate::testing::mocks::{ManualClock, ScriptedProvider};

    fn harness(
        provider: ScriptedProvider,
        settings: &RateLimitSettings,
    ) -> (ModelDispatcher, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::new(settings, clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(settings, clock.clone()));
        let backoff = BackoffPolicy::new(
            settings.initial_backoff_seconds,
            settings.max_backoff_seconds,
            settings.max_transient_retries,
        )
        .with_jitter(0.0);

        (
            ModelDispatcher::new(Arc::new(provider), limiter, breaker, backoff, clock.clone()),
            clock,
        )
    }

    fn settings() -> RateLimitSettings {
        RateLimitSettings {
            requests_per_minute: 6000.0,
            bucket_capacity: 100.0,
            jitter_factor: 0.0,
            max_transient_retries: 1,
            initial_backoff_seconds: 2.0,
            failure_threshold: 5,
            ..Default::default()
        }
    }

    fn request(candidates: &[&str]) -> DispatchRequest {
        DispatchRequest::new("design", candidates.iter().map(ToString::to_string).collect())
            .with_prompts("You are a designer.", "Design the system.")
    }

    #[tokio::test]
    async fn test_primary_success() {
        let provider = ScriptedProvider::new();
        provider.succeed_with("m/a", "primary answer");
        let (dispatcher, _) = harness(provider, &settings());

        let completion = dispatcher.dispatch(&request(&["m/a", "m/b"])).await.unwrap();

        assert_eq!(completion.content, "primary answer");
        assert_eq!(completion.model, "m/a");
    }

    #[tokio::test]
    async fn test_failover_to_backup_on_server_error() {
        let provider = ScriptedProvider::new();
        provider.fail_with("m/a", ProviderErrorKind::ServerError);
        provider.succeed_with("m/b", "backup answer");
        let (dispatcher, _) = harness(provider, &settings());

        let completion = dispatcher.dispatch(&request(&["m/a", "m/b"])).await.unwrap();

        assert_eq!(completion.model, "m/b");
        assert_eq!(completion.content, "backup answer");
    }

    #[tokio::test]
    async fn test_transient_retry_same_candidate_before_failover() {
        let provider = ScriptedProvider::new();
        provider.fail_then_succeed("m/a", ProviderErrorKind::RateLimited, 1, "recovered");
        let (dispatcher, clock) = harness(provider, &settings());

        let completion = dispatcher.dispatch(&request(&["m/a", "m/b"])).await.unwrap();

        assert_eq!(completion.content, "recovered");
        // One backoff sleep of initial_backoff_seconds.
        assert!(clock
            .sleeps()
            .iter()
            .any(|s| (*s - 2.0).abs() < 1e-6));
    }

    #[tokio::test]
    async fn test_permanent_error_aborts_without_failover() {
        let provider = ScriptedProvider::new();
        provider.fail_with("m/a", ProviderErrorKind::AuthError);
        provider.succeed_with("m/b", "never used");
        let (dispatcher, _) = harness(provider, &settings());

        let err = dispatcher.dispatch(&request(&["m/a", "m/b"])).await.unwrap_err();

        assert!(matches!(err, DispatchError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_all_candidates_exhausted_records_each_failure() {
        let provider = ScriptedProvider::new();
        provider.fail_with("m/a", ProviderErrorKind::ServerError);
        provider.fail_with("m/b", ProviderErrorKind::Timeout);
        let (dispatcher, _) = harness(provider, &settings());

        let err = dispatcher.dispatch(&request(&["m/a", "m/b"])).await.unwrap_err();

        match err {
            DispatchError::AllCandidatesExhausted { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].model, "m/a");
                assert_eq!(failures[1].model, "m/b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_skips_candidate_without_calls() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.succeed_with("m/a", "unused");
        provider.succeed_with("m/b", "backup answer");

        let s = settings();
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::new(&s, clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(&s, clock.clone()));
        let dispatcher = ModelDispatcher::new(
            provider.clone(),
            limiter,
            breaker.clone(),
            BackoffPolicy::default().with_jitter(0.0),
            clock,
        );

        // Open m/a's circuit directly.
        for _ in 0..5 {
            breaker.record_failure("m/a");
        }

        let completion = dispatcher.dispatch(&request(&["m/a", "m/b"])).await.unwrap();

        assert_eq!(completion.model, "m/b");
        assert_eq!(
            provider.calls_for("m/a"),
            0,
            "open circuit must produce zero provider calls"
        );
    }
}
