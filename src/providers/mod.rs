//! Language-provider abstraction and implementations
//!
//! Every stage that talks to a language model goes through the
//! [`LanguageService`] trait so the pipeline can be exercised with scripted
//! implementations and providers can be swapped without touching the
//! orchestration.

mod openai;
pub mod retry;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use openai::OpenAiService;
pub use retry::RetryPolicy;

/// Languages the assistant speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "ka")]
    Georgian,
}

impl Language {
    /// ISO 639-1 code
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::English => "en",
            Self::Georgian => "ka",
        }
    }

    /// Parse a language code or name as reported by providers
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_lowercase().as_str() {
            "en" | "eng" | "english" => Some(Self::English),
            "ka" | "kat" | "georgian" => Some(Self::Georgian),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Raw moderation output: provider verdict plus per-category scores
#[derive(Debug, Clone, Default)]
pub struct ModerationScores {
    /// Provider's own flagged verdict
    pub flagged: bool,
    /// Score per category, 0.0..=1.0
    pub scores: HashMap<String, f64>,
}

/// Topic classification output
#[derive(Debug, Clone, Deserialize)]
pub struct RelevanceVerdict {
    /// Whether the message is about vehicles or their maintenance
    pub automotive: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Structured extraction payload as returned by the provider.
///
/// Every field defaults so a partial answer still deserializes; validation
/// and normalization happen in the enhancer, not here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextPayload {
    #[serde(default)]
    pub vehicle: VehiclePayload,
    #[serde(default)]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub predicted_questions: Vec<String>,
}

/// Vehicle fields of a [`ContextPayload`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VehiclePayload {
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub mileage: Option<u32>,
}

/// Language detection output
#[derive(Debug, Clone, Copy)]
pub struct DetectedLanguage {
    pub language: Language,
    pub confidence: f64,
}

/// Role of one turn in a generation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of a generation request
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    #[must_use]
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A fully assembled generation request: system prompt plus history
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub system: String,
    pub turns: Vec<ChatTurn>,
}

/// Everything the pipeline needs from a language provider.
///
/// Implementations must be cheap to share (`Arc`) and safe to call
/// concurrently.
#[async_trait]
pub trait LanguageService: Send + Sync {
    /// Score a message for unsafe content.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Provider`] on transient failures and
    /// [`crate::Error::Malformed`] when the response is unusable.
    async fn moderate(&self, text: &str) -> Result<ModerationScores>;

    /// Decide whether a message is automotive, given optional recent history.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Provider`] on transient failures and
    /// [`crate::Error::Malformed`] when the response is unusable.
    async fn classify_relevance(
        &self,
        text: &str,
        history: Option<&str>,
    ) -> Result<RelevanceVerdict>;

    /// Extract structured diagnostic context from a message.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Provider`] on transient failures and
    /// [`crate::Error::Malformed`] when the response is unusable.
    async fn extract_context(&self, text: &str, history: Option<&str>) -> Result<ContextPayload>;

    /// Generate the assistant reply.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Provider`] on transient failures and
    /// [`crate::Error::Malformed`] when the response is unusable.
    async fn generate_reply(&self, request: &GenerationRequest) -> Result<String>;

    /// Detect the language of a text.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Provider`] on transient failures and
    /// [`crate::Error::Malformed`] when the response is unusable.
    async fn detect_language(&self, text: &str) -> Result<DetectedLanguage>;

    /// Translate text between the supported languages.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Provider`] on transient failures and
    /// [`crate::Error::Malformed`] when the response is unusable.
    async fn translate(&self, text: &str, source: Language, target: Language) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_codes_round_trip() {
        assert_eq!(Language::from_code("en"), Some(Language::English));
        assert_eq!(Language::from_code("ka"), Some(Language::Georgian));
        assert_eq!(Language::from_code("Georgian"), Some(Language::Georgian));
        assert_eq!(Language::from_code("fr"), None);
        assert_eq!(Language::English.code(), "en");
    }

    #[test]
    fn context_payload_tolerates_partial_json() {
        let payload: ContextPayload =
            serde_json::from_str(r#"{"codes": ["p0301"]}"#).expect("partial payload");
        assert_eq!(payload.codes, vec!["p0301"]);
        assert!(payload.vehicle.make.is_none());
        assert!(payload.symptoms.is_empty());
    }
}
