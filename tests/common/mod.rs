//! Shared test utilities

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mechanic_gateway::providers::{
    ContextPayload, DetectedLanguage, GenerationRequest, ModerationScores, RelevanceVerdict,
};
use mechanic_gateway::{DbPool, Language, LanguageService, Result, db};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Install a test subscriber so `RUST_LOG` works under `cargo test`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Moderation scores that fail the gate
#[must_use]
pub fn flagged_scores() -> ModerationScores {
    ModerationScores {
        flagged: true,
        scores: std::iter::once(("violence".to_string(), 0.9)).collect(),
    }
}

/// A confident off-topic verdict
#[must_use]
pub fn off_topic_verdict() -> RelevanceVerdict {
    RelevanceVerdict {
        automotive: false,
        confidence: 0.95,
        reason: Some("not automotive".to_string()),
    }
}

/// The reply generation falls back to when nothing is scripted
pub const DEFAULT_REPLY: &str = "Based on the symptoms, start with a diagnostic scan.";

/// Language service with scriptable responses.
///
/// Each method pops its queue and falls back to a benign default when the
/// queue is empty, so tests only script the calls they care about.
#[derive(Default)]
pub struct ScriptedService {
    pub moderation: Mutex<VecDeque<Result<ModerationScores>>>,
    pub relevance: Mutex<VecDeque<Result<RelevanceVerdict>>>,
    pub extraction: Mutex<VecDeque<Result<ContextPayload>>>,
    pub generation: Mutex<VecDeque<Result<String>>>,
    pub detection: Mutex<VecDeque<Result<DetectedLanguage>>>,
    pub translation: Mutex<VecDeque<Result<String>>>,
    /// Artificial latency for extraction calls
    pub extract_delay: Option<Duration>,
    /// Artificial latency for moderation calls
    pub moderate_delay: Option<Duration>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedService {
    /// A service whose extraction calls take `delay` to complete
    #[must_use]
    pub fn slow_extraction(delay: Duration) -> Self {
        Self {
            extract_delay: Some(delay),
            ..Self::default()
        }
    }

    /// A service whose moderation calls take `delay` to complete
    #[must_use]
    pub fn slow_moderation(delay: Duration) -> Self {
        Self {
            moderate_delay: Some(delay),
            ..Self::default()
        }
    }

    /// How many times a method has been called
    #[must_use]
    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|m| **m == method)
            .count()
    }

    fn record(&self, method: &'static str) {
        self.calls.lock().expect("calls lock").push(method);
    }
}

#[async_trait]
impl LanguageService for ScriptedService {
    async fn moderate(&self, _text: &str) -> Result<ModerationScores> {
        self.record("moderate");
        if let Some(delay) = self.moderate_delay {
            tokio::time::sleep(delay).await;
        }
        self.moderation
            .lock()
            .expect("moderation lock")
            .pop_front()
            .unwrap_or_else(|| Ok(ModerationScores::default()))
    }

    async fn classify_relevance(
        &self,
        _text: &str,
        _history: Option<&str>,
    ) -> Result<RelevanceVerdict> {
        self.record("classify");
        self.relevance
            .lock()
            .expect("relevance lock")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(RelevanceVerdict {
                    automotive: true,
                    confidence: 0.9,
                    reason: None,
                })
            })
    }

    async fn extract_context(
        &self,
        _text: &str,
        _history: Option<&str>,
    ) -> Result<ContextPayload> {
        self.record("extract");
        if let Some(delay) = self.extract_delay {
            tokio::time::sleep(delay).await;
        }
        self.extraction
            .lock()
            .expect("extraction lock")
            .pop_front()
            .unwrap_or_else(|| Ok(ContextPayload::default()))
    }

    async fn generate_reply(&self, _request: &GenerationRequest) -> Result<String> {
        self.record("generate");
        self.generation
            .lock()
            .expect("generation lock")
            .pop_front()
            .unwrap_or_else(|| Ok(DEFAULT_REPLY.to_string()))
    }

    async fn detect_language(&self, _text: &str) -> Result<DetectedLanguage> {
        self.record("detect");
        self.detection
            .lock()
            .expect("detection lock")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(DetectedLanguage {
                    language: Language::English,
                    confidence: 0.95,
                })
            })
    }

    async fn translate(&self, text: &str, _source: Language, _target: Language) -> Result<String> {
        self.record("translate");
        self.translation
            .lock()
            .expect("translation lock")
            .pop_front()
            .unwrap_or_else(|| Ok(text.to_string()))
    }
}
