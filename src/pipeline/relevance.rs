//! Relevance filter
//!
//! Off-topic messages are redirected before they reach generation. Recent
//! on-topic traffic earns a short bypass window so natural follow-ups like
//! "how much would that cost?" are not re-interrogated, unless the message
//! visibly changes the subject.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::context::extract;
use crate::providers::{Language, LanguageService, RelevanceVerdict};
use crate::{Error, Result};

static TOPIC_SHIFT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)weather|insurance|car wash|lottery|recipe|ამინდი|დაზღვევა|სამრეცხაო")
        .expect("valid regex")
});

/// Configuration for the relevance filter
#[derive(Debug, Clone)]
pub struct RelevanceConfig {
    /// How many consecutive turns may ride a prior on-topic verdict
    pub bypass_max_turns: usize,

    /// Time budget for one classification call
    pub timeout: Duration,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            bypass_max_turns: 3,
            timeout: Duration::from_secs(8),
        }
    }
}

/// Decides whether a message belongs in an automotive conversation
pub struct RelevanceFilter {
    service: Arc<dyn LanguageService>,
    config: RelevanceConfig,
}

impl RelevanceFilter {
    /// Create a filter backed by the given language service
    #[must_use]
    pub fn new(config: RelevanceConfig, service: Arc<dyn LanguageService>) -> Self {
        Self { service, config }
    }

    /// Classify one message, with recent history as a hint.
    ///
    /// Messages carrying a diagnostic code are accepted without a provider
    /// call.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider cannot produce a verdict in time.
    /// Callers must treat that as "no verdict", never as "on topic".
    pub async fn classify(&self, text: &str, history: Option<&str>) -> Result<RelevanceVerdict> {
        if !extract::diagnostic_codes(text).is_empty() {
            return Ok(RelevanceVerdict {
                automotive: true,
                confidence: 1.0,
                reason: Some("carries a diagnostic code".to_string()),
            });
        }

        tokio::time::timeout(
            self.config.timeout,
            self.service.classify_relevance(text, history),
        )
        .await
        .map_err(|_| Error::Timeout("relevance".to_string()))?
    }

    /// Whether a message may skip classification on the strength of recent
    /// on-topic traffic.
    ///
    /// `flags` are the relevance verdicts of recent user messages, newest
    /// first: `Some` for a classified message, `None` for one that rode the
    /// bypass. The window closes after the configured number of unclassified
    /// turns, on an explicit off-topic verdict, or as soon as the message
    /// visibly changes the subject.
    #[must_use]
    pub fn should_bypass(&self, flags: &[Option<bool>], message: &str) -> bool {
        if TOPIC_SHIFT_RE.is_match(message) {
            return false;
        }

        let mut ridden = 0usize;
        for flag in flags {
            match flag {
                Some(true) => return ridden < self.config.bypass_max_turns,
                Some(false) => return false,
                None => ridden += 1,
            }
        }

        false
    }

    /// How many relevance flags [`Self::should_bypass`] needs to see.
    ///
    /// One classified verdict plus the full budget of unclassified rides;
    /// anything older cannot change the outcome.
    #[must_use]
    pub const fn bypass_window(&self) -> usize {
        self.config.bypass_max_turns + 1
    }
}

impl std::fmt::Debug for RelevanceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelevanceFilter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Canned redirect for off-topic messages
#[must_use]
pub const fn redirect_reply(language: Language) -> &'static str {
    match language {
        Language::English => {
            "I'm an automotive assistant and I help only with car-related questions. \
             Please ask me about your vehicle's technical problems, maintenance, \
             diagnostics, or repairs. How can I help you with your car today?"
        }
        Language::Georgian => {
            "ავტომობილური ასისტენტი ვარ და ვეხმარები მხოლოდ მანქანებთან დაკავშირებულ \
             საკითხებში. გთხოვთ, დამისვათ კითხვა თქვენი ავტომობილის ტექნიკური \
             პრობლემების, დიაგნოსტიკის ან სამუშაოების შესახებ. როგორ შემიძლია \
             დაგეხმაროთ თქვენი მანქანის მდგომარეობის გაუმჯობესებაში?"
        }
    }
}
