//! The conversation gateway
//!
//! One entry point, [`ChatGateway::handle_turn`], walks a user message
//! through moderation, relevance, enrichment, generation, compression, and
//! normalization, persisting as it goes. Turns for the same conversation
//! are serialized; different conversations proceed in parallel.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::GatewayConfig;
use crate::context::compression::CompressedSummary;
use crate::context::{ContextEnhancer, EnrichedContext, HistoryCompressor, SafetyUrgency};
use crate::db::{
    CompressedContext, Conversation, ConversationRepo, ConversationStatus, DbPool, Message,
    MessageRole, NewMessage,
};
use crate::pipeline::{
    moderation, relevance, LanguageNormalizer, ModerationGate, ModerationVerdict, RejectionKind,
    RelevanceFilter, StageTimings, TurnOutcome, TurnRejection, TurnReply,
};
use crate::providers::{retry, ChatRole, ChatTurn, GenerationRequest, Language, LanguageService};
use crate::validate;
use crate::{Error, Result};

const MAX_TITLE_CHARS: usize = 50;

/// One user turn
#[derive(Debug, Clone, Deserialize)]
pub struct TurnRequest {
    /// Caller-assigned user id
    pub user_id: String,

    /// Existing conversation, or `None` to start one
    #[serde(default)]
    pub conversation_id: Option<String>,

    /// Message text
    pub message: String,

    /// Explicit language override for this conversation
    #[serde(default)]
    pub language: Option<Language>,
}

/// Liveness of the gateway's dependencies
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthReport {
    pub database: bool,
    pub provider: bool,
}

impl HealthReport {
    #[must_use]
    pub const fn healthy(self) -> bool {
        self.database && self.provider
    }
}

/// The conversation gateway. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChatGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    repo: ConversationRepo,
    service: Arc<dyn LanguageService>,
    gate: ModerationGate,
    filter: RelevanceFilter,
    enhancer: ContextEnhancer,
    compressor: HistoryCompressor,
    normalizer: LanguageNormalizer,
    turn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatGateway {
    /// Assemble a gateway over a database pool and a language service
    #[must_use]
    pub fn new(config: GatewayConfig, pool: DbPool, service: Arc<dyn LanguageService>) -> Self {
        let repo = ConversationRepo::new(pool);
        let gate = ModerationGate::new(config.moderation.clone(), service.clone());
        let filter = RelevanceFilter::new(config.relevance.clone(), service.clone());
        let enhancer = ContextEnhancer::new(&config.enrichment, service.clone());
        let compressor = HistoryCompressor::new(config.compression.clone(), service.clone());
        let normalizer = LanguageNormalizer::new(service.clone(), config.turn.translation_timeout);

        Self {
            inner: Arc::new(GatewayInner {
                config,
                repo,
                service,
                gate,
                filter,
                enhancer,
                compressor,
                normalizer,
                turn_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Process one user turn end to end.
    ///
    /// Work runs on a detached task so persistence completes even when the
    /// caller stops waiting; this call itself gives up after the configured
    /// turn budget.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for malformed input or a closed
    /// conversation, [`Error::NotFound`] for an unknown or foreign
    /// conversation, [`Error::GenerationUnavailable`] when reply generation
    /// exhausts its retries, and [`Error::Timeout`] when the turn budget
    /// elapses first.
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        validate::validate_user_id(&request.user_id)?;
        let message = validate::sanitize_message(&request.message)?;

        let conversation = self.resolve_conversation(&request, &message)?;

        let gateway = self.clone();
        let requested = request.language;
        let task =
            tokio::spawn(async move { gateway.run_turn(conversation, message, requested).await });

        match tokio::time::timeout(self.inner.config.turn.timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(Error::Internal(format!("turn task failed: {e}"))),
            Err(_) => Err(Error::Timeout("turn".to_string())),
        }
    }

    /// Conversations belonging to a user, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns an error when the user id is malformed or the database is
    /// unavailable.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        validate::validate_user_id(user_id)?;
        self.inner.repo.list_for_user(user_id)
    }

    /// Close a conversation. Closed conversations refuse further turns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the conversation does not exist or
    /// belongs to someone else.
    pub fn close_conversation(&self, user_id: &str, conversation_id: &str) -> Result<()> {
        validate::validate_user_id(user_id)?;
        self.owned_conversation(user_id, conversation_id)?;
        self.inner
            .repo
            .set_status(conversation_id, ConversationStatus::Closed)
    }

    /// Liveness of the database and the language provider
    pub async fn health(&self) -> HealthReport {
        let database = self.inner.repo.ping().is_ok();

        let probe = self.inner.service.detect_language("ping");
        let provider = matches!(
            tokio::time::timeout(Duration::from_secs(5), probe).await,
            Ok(Ok(_))
        );

        HealthReport { database, provider }
    }

    fn resolve_conversation(&self, request: &TurnRequest, message: &str) -> Result<Conversation> {
        let Some(id) = &request.conversation_id else {
            return self
                .inner
                .repo
                .create(&request.user_id, &title_from(message), None);
        };

        let conversation = self.owned_conversation(&request.user_id, id)?;
        if conversation.status == ConversationStatus::Closed {
            return Err(Error::Validation("conversation is closed".to_string()));
        }

        Ok(conversation)
    }

    fn owned_conversation(&self, user_id: &str, conversation_id: &str) -> Result<Conversation> {
        let conversation = self
            .inner
            .repo
            .find(conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;

        // Foreign conversations look exactly like missing ones
        if conversation.user_id != user_id {
            return Err(Error::NotFound(format!("conversation {conversation_id}")));
        }

        Ok(conversation)
    }

    async fn run_turn(
        &self,
        conversation: Conversation,
        message: String,
        requested: Option<Language>,
    ) -> Result<TurnOutcome> {
        let id = conversation.id.clone();
        let lock = self.turn_lock(&id).await;
        let guard = lock.lock().await;

        // A queued turn may have pinned the language or closed the
        // conversation while we waited for the lock; work from a fresh row
        let outcome = match self.refresh_conversation(conversation) {
            Ok(conversation) => self.process_turn(&conversation, &message, requested).await,
            Err(e) => Err(e),
        };

        drop(guard);
        self.release_turn_lock(&id).await;

        outcome
    }

    fn refresh_conversation(&self, snapshot: Conversation) -> Result<Conversation> {
        let fresh = self.inner.repo.find(&snapshot.id)?.unwrap_or(snapshot);
        if fresh.status == ConversationStatus::Closed {
            return Err(Error::Validation("conversation is closed".to_string()));
        }
        Ok(fresh)
    }

    async fn process_turn(
        &self,
        conversation: &Conversation,
        message: &str,
        requested: Option<Language>,
    ) -> Result<TurnOutcome> {
        let started = Instant::now();
        let mut timings = StageTimings::default();

        let stage = Instant::now();
        let verdict = self.moderate_with_retry(message).await;
        timings.moderation_ms = elapsed_ms(stage);

        let language = self
            .resolve_turn_language(conversation, requested, message)
            .await;

        let Some(verdict) = verdict else {
            // No verdict means fail closed: record the attempt, answer canned
            self.append_audit_message(&conversation.id, message, language, true, None)?;
            timings.total_ms = elapsed_ms(started);
            return Ok(rejection(
                conversation,
                RejectionKind::Unverified,
                moderation::try_again_reply(language),
                language,
            ));
        };

        if !verdict.safe {
            tracing::warn!(
                conversation = conversation.id,
                categories = ?verdict.flagged_categories,
                "message failed moderation"
            );
            self.append_audit_message(&conversation.id, message, language, true, None)?;
            timings.total_ms = elapsed_ms(started);
            return Ok(rejection(
                conversation,
                RejectionKind::Unsafe,
                moderation::safety_reply(language),
                language,
            ));
        }

        let stage = Instant::now();
        let history = self
            .inner
            .repo
            .get_recent_messages(&conversation.id, self.inner.config.turn.recent_window)?;
        let hint = history_hint(&history);

        // The bypass walk needs the off-topic audit rows the generation
        // window filters out, so it reads relevance flags directly
        let flags = self
            .inner
            .repo
            .recent_user_relevance(&conversation.id, self.inner.filter.bypass_window())?;

        let relevant = if self.inner.filter.should_bypass(&flags, message) {
            None
        } else {
            match self.classify_with_retry(message, hint.as_deref()).await {
                Some(verdict) if verdict.automotive => Some(true),
                Some(_) => {
                    self.append_audit_message(
                        &conversation.id,
                        message,
                        language,
                        false,
                        Some(false),
                    )?;
                    timings.relevance_ms = elapsed_ms(stage);
                    timings.total_ms = elapsed_ms(started);
                    return Ok(rejection(
                        conversation,
                        RejectionKind::OffTopic,
                        relevance::redirect_reply(language),
                        language,
                    ));
                }
                None => {
                    self.append_audit_message(
                        &conversation.id,
                        message,
                        language,
                        false,
                        Some(false),
                    )?;
                    timings.relevance_ms = elapsed_ms(stage);
                    timings.total_ms = elapsed_ms(started);
                    return Ok(rejection(
                        conversation,
                        RejectionKind::Unverified,
                        moderation::try_again_reply(language),
                        language,
                    ));
                }
            }
        };
        timings.relevance_ms = elapsed_ms(stage);

        let stage = Instant::now();
        let active = self.inner.repo.get_active_context(&conversation.id)?;
        let context = self
            .inner
            .enhancer
            .enhance(&conversation.id, message, hint.as_deref(), active.as_ref())
            .await;
        timings.enrichment_ms = elapsed_ms(stage);

        self.inner.repo.append_message(
            &conversation.id,
            NewMessage {
                role: MessageRole::User,
                content: message,
                language: Some(language.code()),
                original_content: None,
                flagged: false,
                relevant,
            },
        )?;

        let stage = Instant::now();
        let request = generation_request(&history, &context, active.as_ref(), message, language);
        let reply = self.generate_with_retry(&request).await?;
        timings.generation_ms = elapsed_ms(stage);

        let stage = Instant::now();
        self.maybe_compress(conversation, &history, &context, message, &reply, active.as_ref())
            .await;
        timings.compression_ms = elapsed_ms(stage);

        let stage = Instant::now();
        let normalized = self.inner.normalizer.normalize(&reply, language).await;
        timings.normalization_ms = elapsed_ms(stage);

        let stored = self.inner.repo.append_message(
            &conversation.id,
            NewMessage {
                role: MessageRole::Assistant,
                content: &normalized.text,
                language: Some(normalized.language.code()),
                original_content: normalized.translated.then_some(reply.as_str()),
                flagged: false,
                relevant: None,
            },
        )?;

        timings.total_ms = elapsed_ms(started);
        tracing::info!(
            conversation = conversation.id,
            language = language.code(),
            translated = normalized.translated,
            total_ms = timings.total_ms,
            "turn delivered"
        );

        Ok(TurnOutcome::Reply(TurnReply {
            conversation_id: conversation.id.clone(),
            text: normalized.text,
            language: normalized.language,
            context,
            timings,
            created_at: stored.created_at,
        }))
    }

    /// Retried per the gating policy, then no verdict
    async fn moderate_with_retry(&self, message: &str) -> Option<ModerationVerdict> {
        let policy = &self.inner.config.turn.gating_retry;
        for attempt in 0..=policy.max_retries {
            match self.inner.gate.check(message).await {
                Ok(verdict) => return Some(verdict),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "moderation attempt failed");
                    if attempt < policy.max_retries {
                        tokio::time::sleep(retry::delay_for_attempt(policy, attempt)).await;
                    }
                }
            }
        }
        None
    }

    /// Retried per the gating policy, then no verdict
    async fn classify_with_retry(
        &self,
        message: &str,
        hint: Option<&str>,
    ) -> Option<crate::providers::RelevanceVerdict> {
        let policy = &self.inner.config.turn.gating_retry;
        for attempt in 0..=policy.max_retries {
            match self.inner.filter.classify(message, hint).await {
                Ok(verdict) => return Some(verdict),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "relevance attempt failed");
                    if attempt < policy.max_retries {
                        tokio::time::sleep(retry::delay_for_attempt(policy, attempt)).await;
                    }
                }
            }
        }
        None
    }

    async fn generate_with_retry(&self, request: &GenerationRequest) -> Result<String> {
        let policy = self.inner.config.generation.retry.clone();
        let mut attempt = 0;

        loop {
            let call = self.inner.service.generate_reply(request);
            let result = match tokio::time::timeout(self.inner.config.generation.timeout, call)
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout("generation".to_string())),
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    let delay = retry::delay_for_attempt(&policy, attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "generation attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(Error::GenerationUnavailable(e.to_string())),
            }
        }
    }

    /// Compress when due. Failure defers to a later turn, never the reply.
    async fn maybe_compress(
        &self,
        conversation: &Conversation,
        history: &[Message],
        context: &EnrichedContext,
        message: &str,
        reply: &str,
        active: Option<&CompressedContext>,
    ) {
        let turns = match self.inner.repo.turn_count(&conversation.id) {
            // The reply in flight counts as a completed turn
            Ok(count) => count + 1,
            Err(e) => {
                tracing::warn!(error = %e, "turn count unavailable, skipping compression check");
                return;
            }
        };
        let watermark = active.map_or(0, |c| usize::try_from(c.watermark).unwrap_or(0));
        let window_tokens = history
            .iter()
            .map(|m| HistoryCompressor::estimate_tokens(&m.content))
            .sum::<usize>()
            + HistoryCompressor::estimate_tokens(message)
            + HistoryCompressor::estimate_tokens(reply);

        if !self.inner.compressor.due(turns, watermark, window_tokens) {
            return;
        }

        if let Err(e) = self
            .inner
            .compressor
            .compress(&conversation.id, &self.inner.repo, context, turns)
            .await
        {
            tracing::warn!(
                conversation = conversation.id,
                error = %e,
                "compression failed, deferred to a later turn"
            );
        }
    }

    async fn resolve_turn_language(
        &self,
        conversation: &Conversation,
        requested: Option<Language>,
        message: &str,
    ) -> Language {
        let stored = conversation
            .language
            .as_deref()
            .and_then(Language::from_code);
        let language = self
            .inner
            .normalizer
            .resolve_language(requested, stored, message)
            .await;

        // Pin the conversation language on first resolution
        if stored.is_none() {
            if let Err(e) = self
                .inner
                .repo
                .set_language(&conversation.id, language.code())
            {
                tracing::warn!(error = %e, "failed to store conversation language");
            }
        }

        language
    }

    fn append_audit_message(
        &self,
        conversation_id: &str,
        content: &str,
        language: Language,
        flagged: bool,
        relevant: Option<bool>,
    ) -> Result<()> {
        self.inner.repo.append_message(
            conversation_id,
            NewMessage {
                role: MessageRole::User,
                content,
                language: Some(language.code()),
                original_content: None,
                flagged,
                relevant,
            },
        )?;
        Ok(())
    }

    async fn turn_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.turn_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_turn_lock(&self, conversation_id: &str) {
        let mut locks = self.inner.turn_locks.lock().await;
        if let Some(lock) = locks.get(conversation_id) {
            // Two references mean the map and our own clone; nobody is waiting
            if Arc::strong_count(lock) <= 2 {
                locks.remove(conversation_id);
            }
        }
    }
}

impl std::fmt::Debug for ChatGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatGateway")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn rejection(
    conversation: &Conversation,
    kind: RejectionKind,
    text: &str,
    language: Language,
) -> TurnOutcome {
    TurnOutcome::Rejected(TurnRejection {
        conversation_id: conversation.id.clone(),
        kind,
        text: text.to_string(),
        language,
    })
}

fn generation_request(
    history: &[Message],
    context: &EnrichedContext,
    active: Option<&CompressedContext>,
    message: &str,
    language: Language,
) -> GenerationRequest {
    let mut system = String::from(
        "You are an automotive diagnostic assistant. Help drivers understand \
         symptoms, diagnostic codes, and repairs in plain language, and recommend \
         a qualified mechanic for anything beyond safe self-service.",
    );

    let language_name = match language {
        Language::English => "English",
        Language::Georgian => "Georgian",
    };
    let _ = write!(system, " Respond in {language_name}.");

    if !context.is_empty() {
        let _ = write!(system, "\n\nKnown so far:\n{}", context.prompt_summary());
    }

    if let Some(summary) = active.and_then(|c| serde_json::from_str::<CompressedSummary>(&c.content).ok()) {
        let _ = write!(system, "\n\nEarlier in this conversation:\n{}", summary.summary);
    }

    if context.urgency >= SafetyUrgency::Urgent {
        system.push_str(
            "\n\nThe reported symptoms may be a safety risk. Say so plainly and \
             advise the driver not to drive until the vehicle has been checked.",
        );
    }

    let mut turns = Vec::with_capacity(history.len() + 1);
    for entry in history {
        let role = match entry.role {
            MessageRole::User => ChatRole::User,
            MessageRole::Assistant => ChatRole::Assistant,
        };
        turns.push(ChatTurn::new(role, entry.content.clone()));
    }
    turns.push(ChatTurn::new(ChatRole::User, message));

    GenerationRequest { system, turns }
}

fn history_hint(history: &[Message]) -> Option<String> {
    if history.is_empty() {
        return None;
    }

    Some(
        history
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn title_from(message: &str) -> String {
    let mut chars = message.chars();
    let title: String = chars.by_ref().take(MAX_TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{title}...")
    } else {
        title
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn short_titles_pass_through() {
        assert_eq!(title_from("brake noise"), "brake noise");
    }

    #[test]
    fn long_titles_truncate_with_ellipsis() {
        let message = "a".repeat(80);
        let title = title_from(&message);

        assert_eq!(title.chars().count(), MAX_TITLE_CHARS + 3);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn truncation_respects_multibyte_boundaries() {
        let message = "მანქანა ".repeat(12);
        let title = title_from(&message);

        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS + 3);
    }

    #[test]
    fn system_prompt_carries_context_and_safety_note() {
        let context = EnrichedContext {
            codes: vec!["P0301".into()],
            urgency: SafetyUrgency::Urgent,
            ..EnrichedContext::default()
        };

        let request =
            generation_request(&[], &context, None, "it still misfires", Language::English);

        assert!(request.system.contains("P0301"));
        assert!(request.system.contains("safety risk"));
        assert!(request.system.contains("Respond in English."));
        assert_eq!(request.turns.len(), 1);
    }

    #[test]
    fn history_hint_renders_roles_oldest_first() {
        let message = |role, content: &str| Message {
            id: "m".to_string(),
            conversation_id: "c1".to_string(),
            role,
            content: content.to_string(),
            language: None,
            original_content: None,
            flagged: false,
            relevant: None,
            created_at: Utc::now(),
        };

        assert!(history_hint(&[]).is_none());

        let hint = history_hint(&[
            message(MessageRole::User, "the brakes squeal"),
            message(MessageRole::Assistant, "how old are the pads?"),
        ])
        .unwrap();

        assert_eq!(hint, "user: the brakes squeal\nassistant: how old are the pads?");
    }
}
