//! Turn pipeline stages and their outcomes
//!
//! A turn flows moderation, relevance, enrichment, generation, compression,
//! normalization. The gating stages live here; enrichment and compression
//! live in [`crate::context`].

pub mod language;
pub mod moderation;
pub mod relevance;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::EnrichedContext;
use crate::providers::Language;

pub use language::{LanguageNormalizer, NormalizedReply};
pub use moderation::{ModerationConfig, ModerationGate, ModerationVerdict};
pub use relevance::{RelevanceConfig, RelevanceFilter};

/// Why a turn was rejected before generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Moderation flagged the message
    Unsafe,
    /// The message is not about vehicles
    OffTopic,
    /// A gating stage could not produce a verdict
    Unverified,
}

impl RejectionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsafe => "unsafe",
            Self::OffTopic => "off_topic",
            Self::Unverified => "unverified",
        }
    }
}

/// Wall-clock milliseconds spent in each stage of a turn
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    pub moderation_ms: u64,
    pub relevance_ms: u64,
    pub enrichment_ms: u64,
    pub generation_ms: u64,
    pub compression_ms: u64,
    pub normalization_ms: u64,
    pub total_ms: u64,
}

/// A delivered assistant reply
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub conversation_id: String,
    /// Reply text in `language`
    pub text: String,
    pub language: Language,
    /// Running context after this turn's enrichment
    pub context: EnrichedContext,
    pub timings: StageTimings,
    pub created_at: DateTime<Utc>,
}

/// A canned refusal or redirect delivered instead of a reply
#[derive(Debug, Clone, Serialize)]
pub struct TurnRejection {
    pub conversation_id: String,
    pub kind: RejectionKind,
    /// Canned text in `language`
    pub text: String,
    pub language: Language,
}

/// Outcome of one processed turn
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The assistant produced a reply
    Reply(TurnReply),
    /// The turn was rejected before generation
    Rejected(TurnRejection),
}

impl TurnOutcome {
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Reply(reply) => &reply.conversation_id,
            Self::Rejected(rejection) => &rejection.conversation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_serialize_tagged() {
        let outcome = TurnOutcome::Rejected(TurnRejection {
            conversation_id: "c1".into(),
            kind: RejectionKind::OffTopic,
            text: "redirect".into(),
            language: Language::English,
        });

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["kind"], "off_topic");
        assert_eq!(json["language"], "en");
    }
}
