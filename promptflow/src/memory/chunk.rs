//! Document chunking.
//!
//! Documents are split on whitespace-token boundaries into chunks of at most
//! `chunk_size` tokens, each chunk after the first starting `overlap` tokens
//! before the end of its predecessor. Chunks hold exact byte spans of the
//! source, so concatenating them with each declared overlap prefix removed
//! reconstructs the source byte-for-byte.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chunk of a stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryChunk {
    /// Chunk id.
    pub id: Uuid,
    /// Source document id (a run context key).
    pub source: String,
    /// Position of the chunk within its document.
    pub index: usize,
    /// Token offset of the chunk start within the document.
    pub start_token: usize,
    /// Exact byte span of the source text.
    pub text: String,
    /// Bytes at the start of `text` duplicated from the predecessor chunk.
    pub overlap_bytes: usize,
    /// Embedding, populated at ingest when the strategy needs it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Monotonic creation time.
    pub created_at: f64,
}

impl MemoryChunk {
    /// Number of whitespace tokens in the chunk.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    /// Returns true if the chunk has outlived its TTL.
    #[must_use]
    pub fn is_expired(&self, now: f64, ttl_seconds: f64) -> bool {
        now - self.created_at >= ttl_seconds
    }
}

/// Splits documents into overlapping chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    /// Creates a chunker. `overlap` must be smaller than `chunk_size`
    /// (enforced by config validation).
    #[must_use]
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap: overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    /// Byte offsets of each whitespace token's start.
    fn token_starts(text: &str) -> Vec<usize> {
        let mut starts = Vec::new();
        let mut in_token = false;
        for (i, ch) in text.char_indices() {
            if ch.is_whitespace() {
                in_token = false;
            } else if !in_token {
                starts.push(i);
                in_token = true;
            }
        }
        starts
    }

    /// Splits `text` into chunks.
    ///
    /// Returns a single whole-document chunk when the text fits in one
    /// chunk, and nothing for empty text.
    #[must_use]
    pub fn split(&self, source: &str, text: &str, now: f64) -> Vec<MemoryChunk> {
        if text.is_empty() {
            return Vec::new();
        }

        let starts = Self::token_starts(text);
        let token_count = starts.len();
        let stride = self.chunk_size - self.overlap;

        let mut chunks = Vec::new();
        let mut first_token = 0usize;
        let mut index = 0usize;

        loop {
            let last_token = (first_token + self.chunk_size).min(token_count);

            // Chunk span: from this chunk's first token (byte 0 for the
            // first chunk) to the next chunk's overlap end, or EOF.
            let span_start = if index == 0 { 0 } else { starts[first_token] };
            let span_end = if last_token >= token_count {
                text.len()
            } else {
                starts[last_token]
            };

            // Overlap prefix = bytes shared with the predecessor, i.e. from
            // this chunk's start to the predecessor's span end.
            let overlap_bytes = if index == 0 {
                0
            } else {
                let prev_end = if first_token + self.overlap >= token_count {
                    text.len()
                } else {
                    starts[first_token + self.overlap]
                };
                prev_end - span_start
            };

            chunks.push(MemoryChunk {
                id: Uuid::new_v4(),
                source: source.to_string(),
                index,
                start_token: first_token,
                text: text[span_start..span_end].to_string(),
                overlap_bytes,
                embedding: None,
                created_at: now,
            });

            if last_token >= token_count {
                break;
            }
            first_token += stride;
            index += 1;
        }

        chunks
    }
}

/// Reassembles a document from its ordered chunks, dropping each chunk's
/// declared overlap prefix.
#[must_use]
pub fn reconstruct(chunks: &[MemoryChunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(&chunk.text[chunk.overlap_bytes..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_short_text_single_chunk() {
        let chunker = Chunker::new(100, 10);
        let chunks = chunker.split("doc", "one two three", 0.0);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "one two three");
        assert_eq!(chunks[0].overlap_bytes, 0);
    }

    #[test]
    fn test_empty_text_no_chunks() {
        let chunker = Chunker::new(10, 2);
        assert!(chunker.split("doc", "", 0.0).is_empty());
    }

    #[test]
    fn test_chunk_token_budget() {
        let words: Vec<String> = (0..50).map(|i| format!("w{i}")).collect();
        let text = words.join(" ");
        let chunker = Chunker::new(10, 3);

        let chunks = chunker.split("doc", &text, 0.0);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count() <= 10);
        }
    }

    #[test]
    fn test_overlap_shared_with_predecessor() {
        let words: Vec<String> = (0..30).map(|i| format!("w{i}")).collect();
        let text = words.join(" ");
        let chunker = Chunker::new(10, 3);

        let chunks = chunker.split("doc", &text, 0.0);

        for pair in chunks.windows(2) {
            let prev = &pair[0];
            let next = &pair[1];
            let shared = &next.text[..next.overlap_bytes];
            assert!(
                prev.text.ends_with(shared),
                "overlap prefix must be the predecessor's suffix"
            );
        }
    }

    #[test]
    fn test_reconstruction_is_byte_exact() {
        let words: Vec<String> = (0..137).map(|i| format!("word{i}")).collect();
        let text = format!("  {}\n\ntrailing whitespace preserved \t ", words.join("  "));
        let chunker = Chunker::new(16, 4);

        let chunks = chunker.split("doc", &text, 0.0);

        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn test_reconstruction_with_unicode() {
        let text = "días de año señal über straße 日本語のテキスト and plain words repeated "
            .repeat(20);
        let chunker = Chunker::new(12, 5);

        let chunks = chunker.split("doc", &text, 0.0);

        assert!(chunks.len() > 1);
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn test_expiry() {
        let chunker = Chunker::new(10, 2);
        let chunks = chunker.split("doc", "hello world", 100.0);

        assert!(!chunks[0].is_expired(150.0, 100.0));
        assert!(chunks[0].is_expired(200.0, 100.0));
    }
}
