//! Fingerprinted cache for enrichment results
//!
//! Keys bind the conversation, the normalized message text, and the active
//! compressed-context version, so a compression event naturally invalidates
//! everything cached before it. Entries age out after a freshness window and
//! the least recently used fall off when the cache is full.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::EnrichedContext;

struct CachedEnrichment {
    context: EnrichedContext,
    cached_at: Instant,
}

/// Enrichment result cache with single-flight coalescing
pub struct EnrichmentCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, CachedEnrichment>>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EnrichmentCache {
    /// Create a cache with the given freshness window and entry cap
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped to at least one");
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Stable cache key for one enrichment request.
    ///
    /// Message text is case-folded and whitespace-collapsed so trivial
    /// retyping still hits.
    #[must_use]
    pub fn fingerprint(conversation_id: &str, text: &str, context_version: i64) -> String {
        let normalized = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let mut hasher = Sha256::new();
        hasher.update(conversation_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(normalized.as_bytes());
        hasher.update(b"\n");
        hasher.update(context_version.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    /// Fresh cached context for a key, if any. Stale entries are evicted on
    /// the way out.
    pub async fn get(&self, key: &str) -> Option<EnrichedContext> {
        let mut entries = self.entries.lock().await;

        if let Some(cached) = entries.get(key) {
            if cached.cached_at.elapsed() <= self.ttl {
                return Some(cached.context.clone());
            }
            entries.pop(key);
        }

        None
    }

    /// Store a freshly extracted context
    pub async fn insert(&self, key: String, context: EnrichedContext) {
        let mut entries = self.entries.lock().await;
        entries.put(
            key,
            CachedEnrichment {
                context,
                cached_at: Instant::now(),
            },
        );
    }

    /// The per-key gate that coalesces concurrent misses onto one upstream
    /// call. Callers lock the returned mutex, re-check the cache, and only
    /// then go upstream.
    pub async fn flight_gate(&self, key: &str) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().await;
        in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a key's gate once its flight has landed in the cache
    pub async fn release_gate(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(key);
    }

    /// Number of live entries, stale ones included
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
