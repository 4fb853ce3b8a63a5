//! OpenAI-backed language service

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::retry::is_recoverable;
use super::{
    ChatRole, ContextPayload, DetectedLanguage, GenerationRequest, Language, LanguageService,
    ModerationScores, RelevanceVerdict,
};
use crate::{Error, Result};

const API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

const CLASSIFY_SYSTEM: &str = "Decide whether the user's message is about vehicles: technical \
problems, maintenance, diagnostics, repairs, parts, or driving symptoms. Insurance, car washes, \
and unrelated small talk are not automotive. Respond with JSON: \
{\"automotive\": true|false, \"confidence\": 0.0-1.0, \"reason\": \"short explanation\"}";

const EXTRACT_SYSTEM: &str = "You are an automotive diagnostic assistant. Extract structured \
information from the user's message. Respond with JSON: \
{\"vehicle\": {\"make\": string|null, \"model\": string|null, \"year\": number|null, \
\"mileage\": number|null}, \"symptoms\": [\"engine\"|\"brakes\"|\"steering\"|\"transmission\"|\
\"electrical\"|\"other\"], \"codes\": [\"OBD-II codes exactly as written\"], \
\"urgency\": \"none\"|\"advisory\"|\"urgent\"|\"immediate\", \
\"predicted_questions\": [up to 5 likely follow-up questions]}. \
Only include facts stated in the message.";

const DETECT_SYSTEM: &str = "Identify the language of the user's text. The expected languages \
are English (en) and Georgian (ka). Respond with JSON: \
{\"language\": \"ISO 639-1 code\", \"confidence\": 0.0-1.0}";

/// OpenAI language service
pub struct OpenAiService {
    client: Client,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
}

impl OpenAiService {
    /// Create a new OpenAI service
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the API key is empty
    pub fn new(api_key: String, model: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::Config("OpenAI API key is empty".into()));
        }

        Ok(Self {
            client: Client::new(),
            api_key: SecretString::new(api_key.into()),
            model: model.to_string(),
            max_tokens: 1024,
        })
    }

    /// Build the service from `MECHANIC_OPENAI_API_KEY` /
    /// `MECHANIC_OPENAI_MODEL`. Returns `Ok(None)` when no key is configured.
    ///
    /// # Errors
    ///
    /// Returns error if the configured key is unusable
    pub fn from_env() -> Result<Option<Self>> {
        let Some(api_key) = std::env::var("MECHANIC_OPENAI_API_KEY").ok() else {
            return Ok(None);
        };

        let model = std::env::var("MECHANIC_OPENAI_MODEL")
            .unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Some(Self::new(api_key, &model)?))
    }

    /// Single chat-completion round trip, returning the first choice's text
    async fn chat(&self, messages: Vec<ApiMessage>, options: ChatOptions) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: options.temperature,
            max_tokens: Some(self.max_tokens),
            response_format: options
                .json_mode
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(format!("{API_BASE}/chat/completions"))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("OpenAI request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if is_recoverable(status.as_u16(), &body) {
                return Err(Error::Provider(format!("OpenAI API error: {status} - {body}")));
            }
            return Err(Error::Malformed(format!("OpenAI API error: {status} - {body}")));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Malformed(format!("failed to parse OpenAI response: {e}")))?;

        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| Error::Malformed("OpenAI response had no content".into()))
    }
}

#[async_trait]
impl LanguageService for OpenAiService {
    async fn moderate(&self, text: &str) -> Result<ModerationScores> {
        let response = self
            .client
            .post(format!("{API_BASE}/moderations"))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&ModerationRequest { input: text })
            .send()
            .await
            .map_err(|e| Error::Provider(format!("OpenAI request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if is_recoverable(status.as_u16(), &body) {
                return Err(Error::Provider(format!("OpenAI API error: {status} - {body}")));
            }
            return Err(Error::Malformed(format!("OpenAI API error: {status} - {body}")));
        }

        let result: ModerationResponse = response
            .json()
            .await
            .map_err(|e| Error::Malformed(format!("failed to parse moderation response: {e}")))?;

        let first = result
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::Malformed("moderation response had no results".into()))?;

        Ok(ModerationScores {
            flagged: first.flagged,
            scores: first.category_scores,
        })
    }

    async fn classify_relevance(
        &self,
        text: &str,
        history: Option<&str>,
    ) -> Result<RelevanceVerdict> {
        let system = history.map_or_else(
            || CLASSIFY_SYSTEM.to_string(),
            |h| format!("{CLASSIFY_SYSTEM}\n\nRecent conversation:\n{h}"),
        );

        let content = self
            .chat(
                vec![
                    ApiMessage::system(system),
                    ApiMessage::user(text.to_string()),
                ],
                ChatOptions { json_mode: true, temperature: 0.0 },
            )
            .await?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Malformed(format!("unparseable relevance verdict: {e}")))
    }

    async fn extract_context(&self, text: &str, history: Option<&str>) -> Result<ContextPayload> {
        let system = history.map_or_else(
            || EXTRACT_SYSTEM.to_string(),
            |h| format!("{EXTRACT_SYSTEM}\n\nRecent conversation:\n{h}"),
        );

        let content = self
            .chat(
                vec![
                    ApiMessage::system(system),
                    ApiMessage::user(text.to_string()),
                ],
                ChatOptions { json_mode: true, temperature: 0.1 },
            )
            .await?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Malformed(format!("unparseable context payload: {e}")))
    }

    async fn generate_reply(&self, request: &GenerationRequest) -> Result<String> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        messages.push(ApiMessage::system(request.system.clone()));
        for turn in &request.turns {
            messages.push(ApiMessage {
                role: turn.role.as_str(),
                content: turn.content.clone(),
            });
        }

        self.chat(messages, ChatOptions { json_mode: false, temperature: 0.7 })
            .await
    }

    async fn detect_language(&self, text: &str) -> Result<DetectedLanguage> {
        let content = self
            .chat(
                vec![
                    ApiMessage::system(DETECT_SYSTEM.to_string()),
                    ApiMessage::user(text.to_string()),
                ],
                ChatOptions { json_mode: true, temperature: 0.0 },
            )
            .await?;

        let guess: LanguageGuess = serde_json::from_str(&content)
            .map_err(|e| Error::Malformed(format!("unparseable language guess: {e}")))?;

        // Anything outside the supported pair falls back to English with no
        // confidence, which downstream treats as "don't translate"
        Ok(Language::from_code(&guess.language).map_or(
            DetectedLanguage { language: Language::English, confidence: 0.0 },
            |language| DetectedLanguage { language, confidence: guess.confidence },
        ))
    }

    async fn translate(&self, text: &str, source: Language, target: Language) -> Result<String> {
        let system = format!(
            "Translate the user's text from {source} to {target}. Keep diagnostic trouble codes \
             (like P0301), numbers, units, and measurements exactly as written. Return only the \
             translation.",
            source = language_name(source),
            target = language_name(target),
        );

        self.chat(
            vec![ApiMessage::system(system), ApiMessage::user(text.to_string())],
            ChatOptions { json_mode: false, temperature: 0.2 },
        )
        .await
    }
}

const fn language_name(language: Language) -> &'static str {
    match language {
        Language::English => "English",
        Language::Georgian => "Georgian",
    }
}

#[derive(Clone, Copy)]
struct ChatOptions {
    json_mode: bool,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl ApiMessage {
    fn system(content: String) -> Self {
        Self { role: ChatRole::System.as_str(), content }
    }

    fn user(content: String) -> Self {
        Self { role: ChatRole::User.as_str(), content }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationOutcome>,
}

#[derive(Deserialize)]
struct ModerationOutcome {
    flagged: bool,
    category_scores: std::collections::HashMap<String, f64>,
}

#[derive(Deserialize)]
struct LanguageGuess {
    language: String,
    #[serde(default)]
    confidence: f64,
}
