//! Language resolution and reply normalization
//!
//! Conversations are conducted in English or Georgian. The conversation
//! language is resolved once per turn (explicit request, then the stored
//! preference, then detection) and every generated reply is normalized into
//! it before delivery. Normalization never fails a turn: when translation
//! is unavailable or mangles a diagnostic code, the original text ships.

use std::sync::Arc;
use std::time::Duration;

use crate::context::extract;
use crate::providers::{Language, LanguageService};

/// A reply ready for delivery
#[derive(Debug, Clone)]
pub struct NormalizedReply {
    /// Text to deliver
    pub text: String,
    /// Language of `text`
    pub language: Language,
    /// Whether `text` differs from what generation produced
    pub translated: bool,
}

/// Resolves conversation language and normalizes replies into it
pub struct LanguageNormalizer {
    service: Arc<dyn LanguageService>,
    timeout: Duration,
}

impl LanguageNormalizer {
    /// Create a normalizer backed by the given language service
    #[must_use]
    pub fn new(service: Arc<dyn LanguageService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    /// Resolve the language a turn should be conducted in.
    ///
    /// An explicit request wins, then the conversation's stored language.
    /// Georgian script settles detection without a provider call; anything
    /// else is detected, falling back to English when detection fails or
    /// reports no confidence.
    pub async fn resolve_language(
        &self,
        requested: Option<Language>,
        stored: Option<Language>,
        text: &str,
    ) -> Language {
        if let Some(language) = requested {
            return language;
        }
        if let Some(language) = stored {
            return language;
        }
        if has_georgian_script(text) {
            return Language::Georgian;
        }
        if !text.chars().any(char::is_alphabetic) {
            return Language::English;
        }

        match tokio::time::timeout(self.timeout, self.service.detect_language(text)).await {
            Ok(Ok(detected)) if detected.confidence > 0.0 => detected.language,
            Ok(Ok(_)) => Language::English,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "language detection failed, assuming English");
                Language::English
            }
            Err(_) => {
                tracing::warn!("language detection timed out, assuming English");
                Language::English
            }
        }
    }

    /// Bring a generated reply into the conversation language.
    ///
    /// A reply already in the target language passes through untouched. Any
    /// translation failure delivers the original text, as does a translation
    /// that drops or alters a diagnostic code or a measurement.
    pub async fn normalize(&self, text: &str, target: Language) -> NormalizedReply {
        let source = reply_language(text);
        if source == target {
            return untranslated(text, source);
        }

        let call = self.service.translate(text, source, target);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(translation)) => {
                if preserves_technical_tokens(text, &translation) {
                    NormalizedReply {
                        text: translation,
                        language: target,
                        translated: true,
                    }
                } else {
                    tracing::warn!("translation altered a technical token, delivering original");
                    untranslated(text, source)
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "translation failed, delivering original");
                untranslated(text, source)
            }
            Err(_) => {
                tracing::warn!("translation timed out, delivering original");
                untranslated(text, source)
            }
        }
    }
}

impl std::fmt::Debug for LanguageNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageNormalizer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn untranslated(text: &str, language: Language) -> NormalizedReply {
    NormalizedReply {
        text: text.to_string(),
        language,
        translated: false,
    }
}

/// Language of a generated reply. Replies come from the model in one of the
/// two supported languages, so script presence decides.
fn reply_language(text: &str) -> Language {
    if has_georgian_script(text) {
        Language::Georgian
    } else {
        Language::English
    }
}

fn has_georgian_script(text: &str) -> bool {
    text.chars()
        .any(|c| matches!(c, '\u{10A0}'..='\u{10FF}' | '\u{1C90}'..='\u{1CBF}'))
}

/// Every code and measurement in the source must survive translation
/// byte for byte. Case matters: `p0301` coming back for `P0301` is a
/// mangled code, not a preserved one.
fn preserves_technical_tokens(source: &str, translation: &str) -> bool {
    extract::raw_code_tokens(source)
        .into_iter()
        .chain(extract::numeric_tokens(source))
        .all(|token| translation.contains(token))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::providers::{
        ContextPayload, DetectedLanguage, GenerationRequest, ModerationScores, RelevanceVerdict,
    };
    use crate::{Error, Result};

    use super::*;

    struct StubTranslator {
        translation: Option<String>,
        detected: Option<DetectedLanguage>,
        translate_calls: AtomicUsize,
    }

    impl StubTranslator {
        fn translating(text: &str) -> Self {
            Self {
                translation: Some(text.to_string()),
                detected: None,
                translate_calls: AtomicUsize::new(0),
            }
        }

        const fn offline() -> Self {
            Self {
                translation: None,
                detected: None,
                translate_calls: AtomicUsize::new(0),
            }
        }

        const fn detecting(language: Language, confidence: f64) -> Self {
            Self {
                translation: None,
                detected: Some(DetectedLanguage {
                    language,
                    confidence,
                }),
                translate_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageService for StubTranslator {
        async fn moderate(&self, _text: &str) -> Result<ModerationScores> {
            Ok(ModerationScores::default())
        }

        async fn classify_relevance(
            &self,
            _text: &str,
            _history: Option<&str>,
        ) -> Result<RelevanceVerdict> {
            Ok(RelevanceVerdict {
                automotive: true,
                confidence: 1.0,
                reason: None,
            })
        }

        async fn extract_context(
            &self,
            _text: &str,
            _history: Option<&str>,
        ) -> Result<ContextPayload> {
            Ok(ContextPayload::default())
        }

        async fn generate_reply(&self, _request: &GenerationRequest) -> Result<String> {
            Ok(String::new())
        }

        async fn detect_language(&self, _text: &str) -> Result<DetectedLanguage> {
            self.detected
                .ok_or_else(|| Error::Provider("detector offline".into()))
        }

        async fn translate(
            &self,
            _text: &str,
            _source: Language,
            _target: Language,
        ) -> Result<String> {
            self.translate_calls.fetch_add(1, Ordering::SeqCst);
            self.translation
                .clone()
                .ok_or_else(|| Error::Provider("translator offline".into()))
        }
    }

    fn normalizer(stub: StubTranslator) -> (LanguageNormalizer, Arc<StubTranslator>) {
        let stub = Arc::new(stub);
        let normalizer = LanguageNormalizer::new(stub.clone(), Duration::from_secs(5));
        (normalizer, stub)
    }

    // -- resolve_language ----------------------------------------------------

    #[tokio::test]
    async fn explicit_request_wins() {
        let (normalizer, _) = normalizer(StubTranslator::detecting(Language::English, 1.0));

        let resolved = normalizer
            .resolve_language(Some(Language::Georgian), Some(Language::English), "hello")
            .await;

        assert_eq!(resolved, Language::Georgian);
    }

    #[tokio::test]
    async fn stored_language_beats_detection() {
        let (normalizer, _) = normalizer(StubTranslator::detecting(Language::English, 1.0));

        let resolved = normalizer
            .resolve_language(None, Some(Language::Georgian), "hello")
            .await;

        assert_eq!(resolved, Language::Georgian);
    }

    #[tokio::test]
    async fn georgian_script_settles_detection() {
        let (normalizer, _) = normalizer(StubTranslator::offline());

        let resolved = normalizer
            .resolve_language(None, None, "მანქანა არ ქოქავს")
            .await;

        assert_eq!(resolved, Language::Georgian);
    }

    #[tokio::test]
    async fn detection_failure_falls_back_to_english() {
        let (normalizer, _) = normalizer(StubTranslator::offline());

        let resolved = normalizer
            .resolve_language(None, None, "my car will not start")
            .await;

        assert_eq!(resolved, Language::English);
    }

    #[tokio::test]
    async fn zero_confidence_detection_falls_back_to_english() {
        let (normalizer, _) = normalizer(StubTranslator::detecting(Language::Georgian, 0.0));

        let resolved = normalizer
            .resolve_language(None, None, "gamarjoba")
            .await;

        assert_eq!(resolved, Language::English);
    }

    // -- normalize -----------------------------------------------------------

    #[tokio::test]
    async fn matching_language_passes_through_untouched() {
        let (normalizer, stub) = normalizer(StubTranslator::translating("unused"));

        let reply = normalizer
            .normalize("Start with the spark plugs.", Language::English)
            .await;

        assert_eq!(reply.text, "Start with the spark plugs.");
        assert!(!reply.translated);
        assert_eq!(stub.translate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mismatched_language_translates() {
        let (normalizer, stub) =
            normalizer(StubTranslator::translating("დაიწყეთ სანთლების შემოწმებით. P0301"));

        let reply = normalizer
            .normalize("Start with the spark plugs. P0301", Language::Georgian)
            .await;

        assert!(reply.translated);
        assert_eq!(reply.language, Language::Georgian);
        assert!(reply.text.contains("P0301"));
        assert_eq!(stub.translate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn translation_failure_delivers_the_original() {
        let (normalizer, _) = normalizer(StubTranslator::offline());

        let reply = normalizer
            .normalize("Check the coil on cylinder one.", Language::Georgian)
            .await;

        assert_eq!(reply.text, "Check the coil on cylinder one.");
        assert_eq!(reply.language, Language::English);
        assert!(!reply.translated);
    }

    #[tokio::test]
    async fn case_mangled_code_discards_the_translation() {
        let (normalizer, _) =
            normalizer(StubTranslator::translating("p0301 ნიშნავს გამოტოვებას პირველ ცილინდრზე."));

        let reply = normalizer
            .normalize("P0301 means a misfire on cylinder one.", Language::Georgian)
            .await;

        assert_eq!(reply.text, "P0301 means a misfire on cylinder one.");
        assert!(!reply.translated);
    }

    #[tokio::test]
    async fn dropped_measurement_discards_the_translation() {
        let (normalizer, _) =
            normalizer(StubTranslator::translating("შეცვალეთ ზეთი რეგულარულად."));

        let reply = normalizer
            .normalize("Change the oil every 5,000 miles.", Language::Georgian)
            .await;

        assert!(!reply.translated);
        assert!(reply.text.contains("5,000"));
    }

    #[tokio::test]
    async fn dropped_code_discards_the_translation() {
        let (normalizer, _) =
            normalizer(StubTranslator::translating("დაიწყეთ სანთლების შემოწმებით."));

        let reply = normalizer
            .normalize("P0301 means a misfire on cylinder one.", Language::Georgian)
            .await;

        assert_eq!(reply.text, "P0301 means a misfire on cylinder one.");
        assert_eq!(reply.language, Language::English);
        assert!(!reply.translated);
    }
}
