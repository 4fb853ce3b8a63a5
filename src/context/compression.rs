//! Conversation history compression
//!
//! When enough turns accumulate past the last watermark, or the recent
//! window outgrows its token budget, the window is summarized via the
//! language provider and stored as the conversation's single active
//! compressed context. Earlier versions stay behind as an audit trail.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::ConversationRepo;
use crate::providers::{ChatRole, ChatTurn, GenerationRequest, LanguageService};
use crate::{Error, Result};

use super::{EnrichedContext, SafetyUrgency, SymptomCategory, VehicleInfo};

/// Configuration for history compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Compress once this many turns accumulate past the last watermark
    pub threshold: usize,

    /// Compress early when the recent window exceeds this many tokens
    pub token_budget: usize,

    /// Word cap handed to the summarization prompt
    pub max_summary_words: usize,

    /// Time budget for the summarization call
    pub timeout: Duration,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            token_budget: 3000,
            max_summary_words: 200,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Persisted shape of one compressed context.
///
/// Carries the salient facts alongside the prose summary so the running
/// context can be rebuilt without re-reading the raw history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedSummary {
    /// Prose summary of the compressed window
    pub summary: String,
    /// Vehicle identity at time of compression
    pub vehicle: VehicleInfo,
    /// Diagnostic codes mentioned so far
    pub codes: Vec<String>,
    /// Highest safety urgency observed
    pub urgency: SafetyUrgency,
    /// Symptom areas still under discussion
    pub open_symptoms: BTreeSet<SymptomCategory>,
}

impl CompressedSummary {
    /// Rebuild a running context from the persisted summary
    #[must_use]
    pub fn into_context(self) -> EnrichedContext {
        EnrichedContext {
            vehicle: self.vehicle,
            symptoms: self.open_symptoms,
            codes: self.codes,
            urgency: self.urgency,
            predicted_questions: Vec::new(),
        }
    }
}

/// Result of a compression attempt
#[derive(Debug)]
pub struct CompressionOutcome {
    /// Whether a new context version was written
    pub replaced: bool,
    /// Turn watermark the active context now covers
    pub watermark: usize,
    /// Version of the active context
    pub version: i64,
    /// Stored size relative to the summarized transcript
    pub ratio: f64,
}

/// Summarizes conversation windows into compressed context records
pub struct HistoryCompressor {
    config: CompressionConfig,
    service: Arc<dyn LanguageService>,
}

impl HistoryCompressor {
    /// Create a compressor backed by the given language service
    #[must_use]
    pub fn new(config: CompressionConfig, service: Arc<dyn LanguageService>) -> Self {
        Self { config, service }
    }

    /// Whether compression is due for a conversation
    #[must_use]
    pub const fn due(&self, turns: usize, last_watermark: usize, window_tokens: usize) -> bool {
        turns > 0
            && (turns.saturating_sub(last_watermark) >= self.config.threshold
                || window_tokens > self.config.token_budget)
    }

    /// Rough token count, good enough for budget checks
    #[must_use]
    pub const fn estimate_tokens(text: &str) -> usize {
        text.len().div_ceil(4)
    }

    /// Compress everything after the last watermark into a new active context.
    ///
    /// Re-running at an already-covered watermark is a no-op, so a turn retried
    /// after a deferred failure cannot stack summaries.
    ///
    /// # Errors
    ///
    /// Returns an error if summarization or storage fails. Callers treat
    /// compression failure as non-fatal and defer to a later turn.
    pub async fn compress(
        &self,
        conversation_id: &str,
        repo: &ConversationRepo,
        context: &EnrichedContext,
        turns: usize,
    ) -> Result<CompressionOutcome> {
        let active = repo.get_active_context(conversation_id)?;

        if let Some(existing) = &active {
            let covered = usize::try_from(existing.watermark).unwrap_or(0);
            if covered >= turns {
                return Ok(CompressionOutcome {
                    replaced: false,
                    watermark: covered,
                    version: existing.version,
                    ratio: 1.0,
                });
            }
        }

        let cutoff = active.as_ref().map(|c| c.created_at);
        let window = repo.get_messages_since(conversation_id, cutoff.as_ref())?;
        if window.is_empty() {
            return Err(Error::Validation(
                "no messages to compress past the last watermark".to_string(),
            ));
        }

        let mut transcript = window
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        if let Some(previous) = active
            .as_ref()
            .and_then(|c| serde_json::from_str::<CompressedSummary>(&c.content).ok())
        {
            transcript = format!("[Earlier summary]\n{}\n\n{transcript}", previous.summary);
        }

        let prompt = format!(
            "Summarize the following conversation between a driver and an automotive \
             diagnostic assistant concisely, preserving the vehicle details, diagnostic \
             codes, symptoms, advice already given, and anything still unresolved. Keep \
             it under {} words.\n\n{transcript}",
            self.config.max_summary_words
        );
        let request = GenerationRequest {
            system: "You condense automotive support conversations.".to_string(),
            turns: vec![ChatTurn::new(ChatRole::User, prompt)],
        };

        let summary_text =
            tokio::time::timeout(self.config.timeout, self.service.generate_reply(&request))
                .await
                .map_err(|_| Error::Timeout("compression".to_string()))??;

        let summary = CompressedSummary {
            summary: summary_text.trim().to_string(),
            vehicle: context.vehicle.clone(),
            codes: context.codes.clone(),
            urgency: context.urgency,
            open_symptoms: context.symptoms.clone(),
        };
        let content = serde_json::to_string(&summary)?;

        #[allow(clippy::cast_precision_loss)]
        let ratio = content.len() as f64 / transcript.len() as f64;

        let record = repo.replace_context(conversation_id, &content, turns)?;

        tracing::info!(
            conversation = conversation_id,
            watermark = turns,
            version = record.version,
            "conversation history compressed"
        );

        Ok(CompressionOutcome {
            replaced: true,
            watermark: turns,
            version: record.version,
            ratio,
        })
    }
}

impl std::fmt::Debug for HistoryCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryCompressor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
