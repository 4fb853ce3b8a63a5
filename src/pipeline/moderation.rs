//! Moderation gate
//!
//! Every message clears moderation before any other stage sees it. Scores
//! come from the provider; thresholds are applied here so category
//! sensitivity stays a deployment decision rather than a provider default.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::providers::{Language, LanguageService, ModerationScores};
use crate::{Error, Result};

/// Configuration for the moderation gate
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// Score threshold applied when a category has no override
    pub default_threshold: f64,

    /// Per-category threshold overrides
    pub thresholds: HashMap<String, f64>,

    /// Time budget for one moderation call
    pub timeout: Duration,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.1,
            thresholds: HashMap::new(),
            timeout: Duration::from_secs(8),
        }
    }
}

/// Verdict for one message
#[derive(Debug, Clone)]
pub struct ModerationVerdict {
    /// Whether the message may proceed
    pub safe: bool,
    /// Categories whose scores crossed their thresholds, sorted
    pub flagged_categories: Vec<String>,
}

/// Applies moderation scores and thresholds to incoming messages
pub struct ModerationGate {
    service: Arc<dyn LanguageService>,
    config: ModerationConfig,
}

impl ModerationGate {
    /// Create a gate backed by the given language service
    #[must_use]
    pub fn new(config: ModerationConfig, service: Arc<dyn LanguageService>) -> Self {
        Self { service, config }
    }

    /// Moderate one message.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider cannot produce scores in time.
    /// Callers must treat that as "no verdict", never as "safe".
    pub async fn check(&self, text: &str) -> Result<ModerationVerdict> {
        let scores = tokio::time::timeout(self.config.timeout, self.service.moderate(text))
            .await
            .map_err(|_| Error::Timeout("moderation".to_string()))??;

        Ok(self.assess(&scores))
    }

    /// Apply thresholds to a set of provider scores
    #[must_use]
    pub fn assess(&self, scores: &ModerationScores) -> ModerationVerdict {
        let mut flagged: Vec<String> = scores
            .scores
            .iter()
            .filter(|(category, score)| {
                let threshold = self
                    .config
                    .thresholds
                    .get(*category)
                    .copied()
                    .unwrap_or(self.config.default_threshold);
                **score > threshold
            })
            .map(|(category, _)| category.clone())
            .collect();
        flagged.sort_unstable();

        // The provider's own verdict stands even when no score crosses a threshold
        if flagged.is_empty() && scores.flagged {
            flagged.push("flagged".to_string());
        }

        ModerationVerdict {
            safe: flagged.is_empty(),
            flagged_categories: flagged,
        }
    }
}

impl std::fmt::Debug for ModerationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Canned refusal for messages that fail moderation
#[must_use]
pub const fn safety_reply(language: Language) -> &'static str {
    match language {
        Language::English => {
            "I'm sorry, but I cannot respond to that content. Please ask questions \
             related to automotive issues or technical problems with your vehicle."
        }
        Language::Georgian => {
            "ვწუხვარ, ვერ შემიძლია ამ შინაარსზე პასუხის გაცემა. გთხოვთ, დასვათ საკითხი, \
             რომელიც დაკავშირებულია ავტომობილებთან ან ტექნიკურ პრობლემებთან."
        }
    }
}

/// Canned reply when a gating stage cannot produce a verdict
#[must_use]
pub const fn try_again_reply(language: Language) -> &'static str {
    match language {
        Language::English => {
            "I'm sorry, something went wrong while checking your message. \
             Please try again in a moment."
        }
        Language::Georgian => {
            "ვწუხვარ, თქვენი შეტყობინების შემოწმებისას შეცდომა მოხდა. \
             გთხოვთ, სცადოთ ხელახლა რამდენიმე წამში."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(config: ModerationConfig) -> ModerationGate {
        struct NoService;

        #[async_trait::async_trait]
        impl LanguageService for NoService {
            async fn moderate(&self, _text: &str) -> Result<ModerationScores> {
                Err(Error::Provider("unused".into()))
            }

            async fn classify_relevance(
                &self,
                _text: &str,
                _history: Option<&str>,
            ) -> Result<crate::providers::RelevanceVerdict> {
                Err(Error::Provider("unused".into()))
            }

            async fn extract_context(
                &self,
                _text: &str,
                _history: Option<&str>,
            ) -> Result<crate::providers::ContextPayload> {
                Err(Error::Provider("unused".into()))
            }

            async fn generate_reply(
                &self,
                _request: &crate::providers::GenerationRequest,
            ) -> Result<String> {
                Err(Error::Provider("unused".into()))
            }

            async fn detect_language(
                &self,
                _text: &str,
            ) -> Result<crate::providers::DetectedLanguage> {
                Err(Error::Provider("unused".into()))
            }

            async fn translate(
                &self,
                _text: &str,
                _source: Language,
                _target: Language,
            ) -> Result<String> {
                Err(Error::Provider("unused".into()))
            }
        }

        ModerationGate::new(config, Arc::new(NoService))
    }

    fn scores(pairs: &[(&str, f64)]) -> ModerationScores {
        ModerationScores {
            flagged: false,
            scores: pairs
                .iter()
                .map(|(category, score)| ((*category).to_string(), *score))
                .collect(),
        }
    }

    #[test]
    fn clean_scores_pass() {
        let verdict = gate(ModerationConfig::default()).assess(&scores(&[
            ("violence", 0.01),
            ("harassment", 0.05),
        ]));

        assert!(verdict.safe);
        assert!(verdict.flagged_categories.is_empty());
    }

    #[test]
    fn scores_over_the_default_threshold_flag() {
        let verdict = gate(ModerationConfig::default()).assess(&scores(&[
            ("violence", 0.4),
            ("harassment", 0.02),
        ]));

        assert!(!verdict.safe);
        assert_eq!(verdict.flagged_categories, vec!["violence"]);
    }

    #[test]
    fn flagged_categories_come_back_sorted() {
        let verdict = gate(ModerationConfig::default()).assess(&scores(&[
            ("violence", 0.9),
            ("harassment", 0.8),
        ]));

        assert_eq!(verdict.flagged_categories, vec!["harassment", "violence"]);
    }

    #[test]
    fn per_category_override_raises_tolerance() {
        let config = ModerationConfig {
            thresholds: std::iter::once(("violence".to_string(), 0.5)).collect(),
            ..ModerationConfig::default()
        };

        let verdict = gate(config).assess(&scores(&[("violence", 0.4)]));
        assert!(verdict.safe);
    }

    #[test]
    fn provider_flag_stands_without_score_evidence() {
        let mut low = scores(&[("violence", 0.01)]);
        low.flagged = true;

        let verdict = gate(ModerationConfig::default()).assess(&low);
        assert!(!verdict.safe);
        assert_eq!(verdict.flagged_categories, vec!["flagged"]);
    }

    #[test]
    fn canned_replies_match_their_language() {
        assert!(safety_reply(Language::English).starts_with("I'm sorry"));
        assert!(safety_reply(Language::Georgian).contains("ვწუხვარ"));
        assert!(try_again_reply(Language::English).contains("try again"));
        assert!(try_again_reply(Language::Georgian).contains("ხელახლა"));
    }
}
