//! Completion-provider seam.
//!
//! The concrete wire protocol is out of scope; callers implement
//! [`CompletionProvider`] over whatever transport they use.

use crate::errors::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Target model id.
    pub model: String,
    /// System prompt establishing the role.
    pub system_prompt: String,
    /// User prompt carrying the task and context.
    pub user_prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Call deadline; enforced by the dispatcher.
    pub timeout: Duration,
}

/// A completion returned by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text.
    pub content: String,
    /// Model that produced it.
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

impl Completion {
    /// Creates a completion with content and model only.
    #[must_use]
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            input_tokens: None,
            output_tokens: None,
            latency_ms: None,
        }
    }

    /// Returns total tokens.
    #[must_use]
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
    }
}

/// Trait for external completion endpoints.
#[async_trait]
pub trait CompletionProvider: Send + Sync + std::fmt::Debug {
    /// Sends one completion request.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] classified by kind; the dispatcher
    /// decides retry and failover policy from the classification.
    async fn send(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_tokens() {
        let mut completion = Completion::new("text", "m/a");
        assert_eq!(completion.total_tokens(), 0);

        completion.input_tokens = Some(10);
        completion.output_tokens = Some(32);
        assert_eq!(completion.total_tokens(), 42);
    }
}
