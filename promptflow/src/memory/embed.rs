//! Embedding and summarization seams.
//!
//! The engine never ships a model; embedding and summarization are
//! capabilities injected by the caller. Unit tests use the deterministic
//! hash-based embedder from `testing::mocks`.

use crate::errors::{EmbedError, SummarizeError};
use async_trait::async_trait;

/// Trait for text-embedding collaborators.
#[async_trait]
pub trait Embedder: Send + Sync + std::fmt::Debug {
    /// Embeds one text into a vector.
    ///
    /// # Errors
    ///
    /// Returns an [`EmbedError`] when the collaborator fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Trait for summarization collaborators (the `summary` context strategy).
#[async_trait]
pub trait Summarizer: Send + Sync + std::fmt::Debug {
    /// Summarizes `text` to at most `max_tokens` tokens.
    ///
    /// # Errors
    ///
    /// Returns a [`SummarizeError`] when the collaborator fails.
    async fn summarize(&self, text: &str, max_tokens: usize) -> Result<String, SummarizeError>;
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths or zero-magnitude vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}
