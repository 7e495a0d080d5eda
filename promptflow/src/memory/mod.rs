//! Context-window management.
//!
//! This module provides:
//! - Overlapping document chunking with byte-exact reconstruction
//! - Embedding-based retrieval of relevant chunks
//! - TTL response caching with single-flight dispatch collapsing

mod cache;
mod chunk;
mod embed;

pub use cache::{fingerprint, CacheEntry, ResponseCache};
pub use chunk::{reconstruct, Chunker, MemoryChunk};
pub use embed::{cosine_similarity, Embedder, Summarizer};

use crate::clock::Clock;
use crate::config::{ContextStrategy, MemorySettings};
use crate::errors::{EmbedError, SummarizeError};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Error raised while assembling stage context.
#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    /// The embedder collaborator failed.
    #[error("{0}")]
    Embed(#[from] EmbedError),

    /// The summarizer collaborator failed.
    #[error("{0}")]
    Summarize(#[from] SummarizeError),

    /// The `summary` strategy is configured but no summarizer was injected.
    #[error("context strategy is 'summary' but no summarizer is configured")]
    SummarizerMissing,
}

/// Manages stored documents, chunk retrieval, and the response cache.
#[derive(Debug)]
pub struct MemoryManager {
    settings: MemorySettings,
    chunker: Chunker,
    chunks: RwLock<Vec<MemoryChunk>>,
    documents: RwLock<Vec<(String, String)>>,
    embedder: Arc<dyn Embedder>,
    summarizer: Option<Arc<dyn Summarizer>>,
    cache: ResponseCache,
    clock: Arc<dyn Clock>,
}

impl MemoryManager {
    /// Creates a manager from settings and collaborators.
    #[must_use]
    pub fn new(
        settings: MemorySettings,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let chunker = Chunker::new(settings.chunk_size, settings.overlap);
        let cache = ResponseCache::new(settings.ttl_seconds, clock.clone());
        Self {
            settings,
            chunker,
            chunks: RwLock::new(Vec::new()),
            documents: RwLock::new(Vec::new()),
            embedder,
            summarizer: None,
            cache,
            clock,
        }
    }

    /// Injects a summarizer for the `summary` strategy.
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// The response cache.
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// The memory settings.
    #[must_use]
    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    /// Stores a document: splits it into chunks, embeds each chunk once
    /// (under `smart_selection`), and evicts expired chunks.
    ///
    /// # Errors
    ///
    /// Returns a [`MemoryError`] if embedding fails.
    pub async fn ingest(&self, source: &str, text: &str) -> Result<usize, MemoryError> {
        let now = self.clock.monotonic();
        let mut new_chunks = self.chunker.split(source, text, now);

        if self.settings.context_strategy == ContextStrategy::SmartSelection {
            for chunk in &mut new_chunks {
                chunk.embedding = Some(self.embedder.embed(&chunk.text).await?);
            }
        }

        let added = new_chunks.len();
        {
            let mut chunks = self.chunks.write();
            chunks.retain(|c| !c.is_expired(now, self.settings.chunk_ttl_seconds));
            chunks.extend(new_chunks);
        }
        self.documents
            .write()
            .push((source.to_string(), text.to_string()));

        debug!(source = %source, chunks = added, "Document ingested");
        Ok(added)
    }

    /// Assembles context for a stage, per the configured strategy.
    ///
    /// `query` is the retrieval query (the producing stage's task
    /// description); `model` selects the context-window budget.
    ///
    /// # Errors
    ///
    /// Returns a [`MemoryError`] if a collaborator fails or is missing.
    pub async fn context_for(&self, query: &str, model: &str) -> Result<String, MemoryError> {
        let window = self.settings.window_for(model);

        match self.settings.context_strategy {
            ContextStrategy::SmartSelection => self.retrieve(query, window).await,
            ContextStrategy::Full => Ok(truncate_tokens(&self.joined_documents(), window)),
            ContextStrategy::Summary => {
                let summarizer = self
                    .summarizer
                    .as_ref()
                    .ok_or(MemoryError::SummarizerMissing)?;
                Ok(summarizer
                    .summarize(&self.joined_documents(), window)
                    .await?)
            }
        }
    }

    /// Embedding-based retrieval: chunks with cosine similarity to the
    /// query at or above the threshold, sorted descending, truncated to the
    /// window budget.
    async fn retrieve(&self, query: &str, window: usize) -> Result<String, MemoryError> {
        let query_embedding = self.embedder.embed(query).await?;
        let now = self.clock.monotonic();

        let mut scored: Vec<(f32, String, usize)> = {
            let chunks = self.chunks.read();
            chunks
                .iter()
                .filter(|c| !c.is_expired(now, self.settings.chunk_ttl_seconds))
                .filter_map(|c| {
                    let embedding = c.embedding.as_ref()?;
                    let similarity = cosine_similarity(&query_embedding, embedding);
                    (similarity >= self.settings.similarity_threshold)
                        .then(|| (similarity, c.text.clone(), c.token_count()))
                })
                .collect()
        };

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected = Vec::new();
        let mut budget = window;
        for (similarity, text, tokens) in scored.into_iter().take(self.settings.max_chunks) {
            if tokens > budget {
                break;
            }
            budget -= tokens;
            debug!(similarity, tokens, "Chunk selected for context");
            selected.push(text);
        }

        Ok(selected.join("\n\n"))
    }

    fn joined_documents(&self) -> String {
        self.documents
            .read()
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Number of live chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Clears chunks, documents, and the response cache.
    pub fn clear(&self) {
        self.chunks.write().clear();
        self.documents.write().clear();
        self.cache.clear();
    }
}

/// Truncates `text` to at most `max_tokens` whitespace tokens, cutting on a
/// token boundary.
#[must_use]
fn truncate_tokens(text: &str, max_tokens: usize) -> String {
    let mut count = 0usize;
    let mut in_token = false;
    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_token = false;
        } else if !in_token {
            if count == max_tokens {
                return text[..i].trim_end().to_string();
            }
            count += 1;
            in_token = true;
        }
    }
    text.to_string()
}
