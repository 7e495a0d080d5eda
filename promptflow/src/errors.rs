//! Error types for the promptflow engine.
//!
//! Provider and validation errors are recovered locally via retry/failover
//! where policy allows; only exhaustion surfaces to the orchestrator, which
//! records it in the stage log instead of raising.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a completion-provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP 429 or an explicit quota rejection.
    RateLimited,
    /// The call exceeded its deadline.
    Timeout,
    /// HTTP 5xx or an equivalent upstream fault.
    ServerError,
    /// Invalid or missing credentials.
    AuthError,
    /// The request itself was malformed.
    InvalidRequest,
}

impl ProviderErrorKind {
    /// Returns true if the failure is worth retrying or failing over.
    ///
    /// Auth and malformed-request failures are caller bugs and are never
    /// retried.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::ServerError
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::AuthError => "auth_error",
            Self::InvalidRequest => "invalid_request",
        };
        f.write_str(s)
    }
}

/// Error returned by a completion provider.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("provider error for model '{model}' ({kind}): {message}")]
pub struct ProviderError {
    /// The model the call targeted.
    pub model: String,
    /// Failure classification.
    pub kind: ProviderErrorKind,
    /// Provider-supplied detail.
    pub message: String,
}

impl ProviderError {
    /// Creates a new provider error.
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            kind,
            message: message.into(),
        }
    }

    /// Creates a timeout error for a call that exceeded its deadline.
    #[must_use]
    pub fn timed_out(model: impl Into<String>, seconds: f64) -> Self {
        Self {
            model: model.into(),
            kind: ProviderErrorKind::Timeout,
            message: format!("no response within {seconds:.1}s"),
        }
    }

    /// Returns true if this error should be retried or failed over.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Error raised when a model's circuit is open.
///
/// Raised locally, before any network I/O or token consumption.
#[derive(Debug, Clone, Error)]
#[error("circuit open for model '{model}'; eligible again in {retry_after_seconds:.1}s")]
pub struct CircuitOpenError {
    /// The model whose circuit is open.
    pub model: String,
    /// Seconds until the breaker will admit a probe call.
    pub retry_after_seconds: f64,
}

/// The last failure observed for one candidate during a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFailure {
    /// The candidate model id.
    pub model: String,
    /// The last error for that candidate, verbatim.
    pub error: String,
}

/// Error returned by the model dispatcher.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Every candidate in the stage's list failed or was skipped.
    #[error("all candidate models exhausted ({})", summarize_failures(.failures))]
    AllCandidatesExhausted {
        /// Last error per candidate, in candidate order.
        failures: Vec<CandidateFailure>,
    },

    /// A permanent provider failure aborted the dispatch.
    #[error("{0}")]
    Permanent(ProviderError),
}

fn summarize_failures(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.model, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Which validation check rejected a stage output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCheck {
    /// A required section header was missing.
    Sections,
    /// A required pattern was missing.
    Patterns,
    /// The output failed the schema check.
    Schema,
    /// The output was inconsistent with a prior stage's output.
    Consistency,
}

impl std::fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sections => "sections",
            Self::Patterns => "patterns",
            Self::Schema => "schema",
            Self::Consistency => "consistency",
        };
        f.write_str(s)
    }
}

/// Error raised when a stage output fails validation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("validation failed ({check}): {detail}")]
pub struct ValidationFailure {
    /// The check that failed.
    pub check: ValidationCheck,
    /// What was missing or inconsistent.
    pub detail: String,
}

impl ValidationFailure {
    /// Creates a new validation failure.
    #[must_use]
    pub fn new(check: ValidationCheck, detail: impl Into<String>) -> Self {
        Self {
            check,
            detail: detail.into(),
        }
    }
}

/// Error raised when the engine configuration is malformed.
///
/// Raised at pipeline start, before any dispatch.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// The stage ids involved, if any.
    pub stages: Vec<String>,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Error raised by an embedder collaborator.
#[derive(Debug, Clone, Error)]
#[error("embedding failed: {message}")]
pub struct EmbedError {
    /// What went wrong.
    pub message: String,
}

impl EmbedError {
    /// Creates a new embed error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error raised by a summarizer collaborator.
#[derive(Debug, Clone, Error)]
#[error("summarization failed: {message}")]
pub struct SummarizeError {
    /// What went wrong.
    pub message: String,
}

impl SummarizeError {
    /// Creates a new summarize error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The terminal failure of a single stage attempt.
///
/// Converted to a stage record by the orchestrator; never propagated as a
/// run-level error.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// Dispatch failed after retries and failover.
    #[error("{0}")]
    Dispatch(#[from] DispatchError),

    /// Validation retries were exhausted.
    #[error("{0}")]
    Validation(#[from] ValidationFailure),

    /// Context assembly failed.
    #[error("{0}")]
    Memory(String),
}

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration was rejected before any dispatch.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}
