//! Response caching with single-flight dispatch collapsing.
//!
//! Entries are keyed by a deterministic fingerprint of (model id, prompts,
//! parameters) and reusable only within their TTL. Concurrent callers
//! sharing a fingerprint collapse to one underlying computation; this is a
//! required property, not an optimization — collaborative participants can
//! trigger the same dispatch with correlated inputs.

use crate::clock::Clock;
use crate::config::ModelParams;
use crate::dispatch::Completion;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Computes the cache fingerprint for a request.
///
/// The model id is the stage's primary candidate: the fingerprint identifies
/// the logical request, computed before dispatch.
#[must_use]
pub fn fingerprint(
    model: &str,
    system_prompt: &str,
    user_prompt: &str,
    params: &ModelParams,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(system_prompt.as_bytes());
    hasher.update([0]);
    hasher.update(user_prompt.as_bytes());
    hasher.update([0]);
    hasher.update(params.temperature.to_le_bytes());
    hasher.update(params.max_tokens.to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// A cached, validated response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached completion.
    pub completion: Completion,
    /// Monotonic creation time.
    pub created_at: f64,
    /// Time-to-live in seconds.
    pub ttl_seconds: f64,
}

impl CacheEntry {
    /// Returns true if the entry is past its TTL.
    #[must_use]
    pub fn is_expired(&self, now: f64) -> bool {
        now - self.created_at >= self.ttl_seconds
    }
}

/// TTL cache of validated completions with per-fingerprint single-flight.
#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ttl_seconds: f64,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    /// Creates a cache with the given TTL.
    #[must_use]
    pub fn new(ttl_seconds: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            flights: Mutex::new(HashMap::new()),
            ttl_seconds,
            clock,
        }
    }

    /// Looks up a non-expired entry, removing it if expired.
    #[must_use]
    pub fn lookup(&self, fp: &str) -> Option<Completion> {
        let now = self.clock.monotonic();

        if let Some(entry) = self.entries.get(fp) {
            if !entry.is_expired(now) {
                return Some(entry.completion.clone());
            }
        }
        self.entries.remove_if(fp, |_, entry| entry.is_expired(now));
        None
    }

    /// Stores a completion under the fingerprint.
    pub fn insert(&self, fp: &str, completion: &Completion) {
        self.entries.insert(
            fp.to_string(),
            CacheEntry {
                completion: completion.clone(),
                created_at: self.clock.monotonic(),
                ttl_seconds: self.ttl_seconds,
            },
        );
    }

    /// Returns the cached completion or awaits `compute` to produce one,
    /// collapsing concurrent callers with the same fingerprint into a
    /// single computation. `compute` is lazy and is never polled on a hit.
    ///
    /// The result is stored only when `compute` succeeds, so rejected
    /// outputs are never served from cache.
    ///
    /// # Errors
    ///
    /// Propagates the error from `compute`.
    pub async fn get_or_compute<E, Fut>(&self, fp: &str, compute: Fut) -> Result<Completion, E>
    where
        Fut: Future<Output = Result<Completion, E>>,
    {
        if let Some(hit) = self.lookup(fp) {
            debug!(fingerprint = %fp, "Cache hit");
            return Ok(hit);
        }

        let gate = {
            let mut flights = self.flights.lock();
            flights
                .entry(fp.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let _guard = gate.lock().await;

        // A caller that held the gate first may have filled the cache.
        if let Some(hit) = self.lookup(fp) {
            debug!(fingerprint = %fp, "Cache hit after waiting on in-flight call");
            return Ok(hit);
        }

        let result = compute.await;

        if let Ok(completion) = &result {
            self.insert(fp, completion);
        }

        let mut flights = self.flights.lock();
        flights.remove(fp);

        result
    }

    /// Number of live entries (expired entries may still be counted until
    /// their next lookup).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every expired entry.
    pub fn purge_expired(&self) {
        let now = self.clock.monotonic();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    /// Clears all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
