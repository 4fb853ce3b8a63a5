//! Context enrichment with caching and graceful degradation
//!
//! Each user message is mined for vehicle identity, diagnostic codes, and
//! symptom areas, then merged into the conversation's running context.
//! Provider outages degrade to deterministic pattern extraction; enrichment
//! never blocks a turn.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::db::CompressedContext;
use crate::providers::LanguageService;

use super::cache::EnrichmentCache;
use super::compression::CompressedSummary;
use super::{extract, EnrichedContext};

/// Configuration for context enrichment
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Freshness window for cached extraction results
    pub cache_ttl: Duration,

    /// Maximum number of cached extraction results
    pub cache_capacity: usize,

    /// Time budget for one provider extraction call
    pub timeout: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1024,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Enriches the running conversation context from each incoming message
pub struct ContextEnhancer {
    service: Arc<dyn LanguageService>,
    cache: EnrichmentCache,
    latest: Mutex<LruCache<String, EnrichedContext>>,
    timeout: Duration,
}

impl ContextEnhancer {
    /// Create an enhancer backed by the given language service
    #[must_use]
    pub fn new(config: &EnrichmentConfig, service: Arc<dyn LanguageService>) -> Self {
        let keep = NonZeroUsize::new(256).expect("256 is non-zero");
        Self {
            service,
            cache: EnrichmentCache::new(config.cache_ttl, config.cache_capacity),
            latest: Mutex::new(LruCache::new(keep)),
            timeout: config.timeout,
        }
    }

    /// Enrich the running context with facts from one message.
    ///
    /// Cache keys bind the active compressed-context version, so compression
    /// invalidates earlier results. Concurrent misses for the same key share
    /// one upstream call.
    pub async fn enhance(
        &self,
        conversation_id: &str,
        message: &str,
        history: Option<&str>,
        active: Option<&CompressedContext>,
    ) -> EnrichedContext {
        let prior = self.prior_context(conversation_id, active).await;
        let version = active.map_or(0, |c| c.version);
        let key = EnrichmentCache::fingerprint(conversation_id, message, version);

        if let Some(cached) = self.cache.get(&key).await {
            return self.absorb(conversation_id, prior, cached, message).await;
        }

        let gate = self.cache.flight_gate(&key).await;
        let guard = gate.lock().await;

        // Another flight may have landed while we waited on the gate
        if let Some(cached) = self.cache.get(&key).await {
            drop(guard);
            return self.absorb(conversation_id, prior, cached, message).await;
        }

        let fresh = self.extract_fresh(message, history).await;
        self.cache.insert(key.clone(), fresh.clone()).await;
        drop(guard);
        self.cache.release_gate(&key).await;

        self.absorb(conversation_id, prior, fresh, message).await
    }

    /// Running context for a conversation, seeded from the active compressed
    /// summary after a restart
    async fn prior_context(
        &self,
        conversation_id: &str,
        active: Option<&CompressedContext>,
    ) -> EnrichedContext {
        let mut latest = self.latest.lock().await;
        if let Some(context) = latest.get(conversation_id) {
            return context.clone();
        }
        drop(latest);

        active
            .and_then(|c| serde_json::from_str::<CompressedSummary>(&c.content).ok())
            .map_or_else(EnrichedContext::default, CompressedSummary::into_context)
    }

    async fn extract_fresh(&self, message: &str, history: Option<&str>) -> EnrichedContext {
        let call = self.service.extract_context(message, history);
        match tokio::time::timeout(self.timeout, call).await {
            // Pattern extraction backstops a sparse payload: provider facts
            // overwrite pattern guesses, but a vehicle, symptom, or code
            // plainly present in the message never goes missing
            Ok(Ok(payload)) => extract::context_from_text(message)
                .merged_with(&EnrichedContext::from_payload(&payload)),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "context extraction failed, using pattern fallback");
                extract::context_from_text(message)
            }
            Err(_) => {
                tracing::warn!("context extraction timed out, using pattern fallback");
                extract::context_from_text(message)
            }
        }
    }

    /// Merge fresh facts into the prior context, re-evaluate urgency, and
    /// remember the result as the conversation's running context
    async fn absorb(
        &self,
        conversation_id: &str,
        prior: EnrichedContext,
        fresh: EnrichedContext,
        message: &str,
    ) -> EnrichedContext {
        let mut merged = prior.merged_with(&fresh);
        merged.urgency = extract::escalate_urgency(
            merged.urgency,
            &merged.symptoms,
            !merged.codes.is_empty(),
            message,
        );

        let mut latest = self.latest.lock().await;
        latest.put(conversation_id.to_string(), merged.clone());
        merged
    }
}

impl std::fmt::Debug for ContextEnhancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEnhancer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
