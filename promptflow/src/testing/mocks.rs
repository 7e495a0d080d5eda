//! Mock collaborators for testing.
//!
//! All mocks are deterministic: the provider replays scripted outcomes, the
//! embedder hashes tokens into a fixed-dimension bag-of-words vector, and
//! the clock advances only when something sleeps on it.

use crate::clock::Clock;
use crate::dispatch::{Completion, CompletionProvider, CompletionRequest};
use crate::errors::{EmbedError, ProviderError, ProviderErrorKind, SummarizeError};
use crate::memory::{Embedder, Summarizer};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// A recorded provider call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Target model.
    pub model: String,
    /// System prompt sent.
    pub system_prompt: String,
    /// User prompt sent.
    pub user_prompt: String,
    /// Clock reading at call time (0.0 without an attached clock).
    pub at: f64,
}

type Scripted = Result<String, ProviderErrorKind>;

/// A completion provider that replays scripted outcomes per model.
///
/// One-shot outcomes (queued with [`ScriptedProvider::push_response`] or
/// [`ScriptedProvider::fail_then_succeed`]) are consumed first; the sticky
/// outcome then applies to every further call. Unscripted models fail with
/// `invalid_request`.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    one_shots: Mutex<HashMap<String, VecDeque<Scripted>>>,
    sticky: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<RecordedCall>>,
    clock: Mutex<Option<Arc<dyn Clock>>>,
}

impl ScriptedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a clock used to timestamp recorded calls.
    pub fn attach_clock(&self, clock: Arc<dyn Clock>) {
        *self.clock.lock() = Some(clock);
    }

    /// Scripts a sticky success for a model.
    pub fn succeed_with(&self, model: impl Into<String>, content: impl Into<String>) {
        self.sticky.lock().insert(model.into(), Ok(content.into()));
    }

    /// Scripts a sticky failure for a model.
    pub fn fail_with(&self, model: impl Into<String>, kind: ProviderErrorKind) {
        self.sticky.lock().insert(model.into(), Err(kind));
    }

    /// Scripts `failures` one-shot failures followed by a sticky success.
    pub fn fail_then_succeed(
        &self,
        model: impl Into<String>,
        kind: ProviderErrorKind,
        failures: usize,
        content: impl Into<String>,
    ) {
        let model = model.into();
        {
            let mut one_shots = self.one_shots.lock();
            let queue = one_shots.entry(model.clone()).or_default();
            for _ in 0..failures {
                queue.push_back(Err(kind));
            }
        }
        self.succeed_with(model, content);
    }

    /// Queues a single one-shot outcome for a model.
    pub fn push_response(&self, model: impl Into<String>, outcome: Scripted) {
        self.one_shots
            .lock()
            .entry(model.into())
            .or_default()
            .push_back(outcome);
    }

    /// All recorded calls, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls made to a model.
    #[must_use]
    pub fn calls_for(&self, model: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.model == model).count()
    }

    /// Total number of calls.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_outcome(&self, model: &str) -> Scripted {
        if let Some(queue) = self.one_shots.lock().get_mut(model) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        self.sticky
            .lock()
            .get(model)
            .cloned()
            .unwrap_or(Err(ProviderErrorKind::InvalidRequest))
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn send(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let at = self
            .clock
            .lock()
            .as_ref()
            .map_or(0.0, |clock| clock.monotonic());

        self.calls.lock().push(RecordedCall {
            model: request.model.clone(),
            system_prompt: request.system_prompt.clone(),
            user_prompt: request.user_prompt.clone(),
            at,
        });

        match self.next_outcome(&request.model) {
            Ok(content) => Ok(Completion::new(content, &request.model)),
            Err(kind) => Err(ProviderError::new(&request.model, kind, "scripted failure")),
        }
    }
}

const EMBED_DIM: usize = 256;

/// Deterministic bag-of-words embedder.
///
/// Each lowercased token is hashed into one of 256 dimensions; identical
/// texts embed identically and disjoint vocabularies are near-orthogonal,
/// making similarity assertions exact.
#[derive(Debug, Default, Clone)]
pub struct HashEmbedder;

impl HashEmbedder {
    /// Creates a new embedder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vector = vec![0.0f32; EMBED_DIM];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let index = (usize::from(digest[0]) | (usize::from(digest[1]) << 8)) % EMBED_DIM;
            vector[index] += 1.0;
        }
        Ok(vector)
    }
}

/// An embedder that always fails, for error-path tests.
#[derive(Debug, Default, Clone)]
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::new("embedder offline"))
    }
}

/// A summarizer that returns a fixed text.
#[derive(Debug, Clone)]
pub struct StaticSummarizer {
    summary: String,
}

impl StaticSummarizer {
    /// Creates a summarizer returning `summary`.
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

#[async_trait]
impl Summarizer for StaticSummarizer {
    async fn summarize(&self, _text: &str, _max_tokens: usize) -> Result<String, SummarizeError> {
        Ok(self.summary.clone())
    }
}

/// A clock that advances only when slept on.
///
/// `sleep` records the requested duration and advances the reading
/// immediately, so backoff and admission timing is observable without real
/// waits.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
    sleeps: Mutex<Vec<f64>>,
}

impl ManualClock {
    /// Creates a clock at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the reading without recording a sleep.
    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }

    /// All recorded sleep durations, in order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<f64> {
        self.sleeps.lock().clone()
    }

    /// Total time slept.
    #[must_use]
    pub fn total_slept(&self) -> f64 {
        self.sleeps.lock().iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn monotonic(&self) -> f64 {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.sleeps.lock().push(seconds);
        *self.now.lock() += seconds;
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_provider_sticky_and_one_shot() {
        let provider = ScriptedProvider::new();
        provider.fail_then_succeed("m/a", ProviderErrorKind::Timeout, 2, "finally");

        let request = CompletionRequest {
            model: "m/a".to_string(),
            system_prompt: String::new(),
            user_prompt: String::new(),
            temperature: 0.7,
            max_tokens: 100,
            timeout: Duration::from_secs(60),
        };

        assert!(provider.send(&request).await.is_err());
        assert!(provider.send(&request).await.is_err());
        assert_eq!(provider.send(&request).await.unwrap().content, "finally");
        assert_eq!(provider.send(&request).await.unwrap().content, "finally");
        assert_eq!(provider.calls_for("m/a"), 4);
    }

    #[tokio::test]
    async fn test_unscripted_model_is_invalid_request() {
        let provider = ScriptedProvider::new();
        let request = CompletionRequest {
            model: "m/unknown".to_string(),
            system_prompt: String::new(),
            user_prompt: String::new(),
            temperature: 0.7,
            max_tokens: 100,
            timeout: Duration::from_secs(60),
        };

        let err = provider.send(&request).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_hash_embedder_determinism() {
        let embedder = HashEmbedder::new();

        let a = embedder.embed("alpha beta gamma").await.unwrap();
        let b = embedder.embed("alpha beta gamma").await.unwrap();
        assert_eq!(a, b);

        let c = embedder.embed("Alpha  BETA gamma").await.unwrap();
        assert_eq!(a, c);
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.monotonic(), 0.0);

        clock.sleep(Duration::from_secs_f64(2.5)).await;
        clock.advance(1.0);

        assert!((clock.monotonic() - 3.5).abs() < 1e-9);
        assert_eq!(clock.sleeps(), vec![2.5]);
    }
}
