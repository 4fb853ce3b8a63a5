//! Configuration for the conversation gateway

use std::time::Duration;

use crate::context::compression::CompressionConfig;
use crate::context::enhancer::EnrichmentConfig;
use crate::pipeline::moderation::ModerationConfig;
use crate::pipeline::relevance::RelevanceConfig;
use crate::providers::RetryPolicy;

/// Reply generation settings.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Retry schedule for transient provider failures
    pub retry: RetryPolicy,

    /// Time budget for a single generation attempt
    pub timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level gateway configuration.
///
/// Stage-specific settings live with the stage that consumes them; this struct
/// aggregates them for construction and applies environment overrides.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Moderation gate settings
    pub moderation: ModerationConfig,

    /// Relevance filter settings
    pub relevance: RelevanceConfig,

    /// Context enrichment settings
    pub enrichment: EnrichmentConfig,

    /// Reply generation settings
    pub generation: GenerationConfig,

    /// History compression settings
    pub compression: CompressionConfig,

    /// Turn-level settings
    pub turn: TurnConfig,
}

/// Settings for the per-turn pipeline itself.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Time budget for a translation or language-detection call
    pub translation_timeout: Duration,

    /// How many recent messages feed generation and classification
    pub recent_window: usize,

    /// Retry schedule for the moderation and relevance gates. Gating fails
    /// closed, so this stays much tighter than the generation schedule.
    pub gating_retry: RetryPolicy,

    /// Overall budget for one turn, end to end
    pub timeout: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            translation_timeout: Duration::from_secs(10),
            recent_window: 5,
            gating_retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(2),
            },
            timeout: Duration::from_secs(90),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `MECHANIC_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MECHANIC_MODERATION_THRESHOLD") {
            if let Ok(t) = val.parse() {
                config.moderation.default_threshold = t;
            }
        }

        if let Ok(val) = std::env::var("MECHANIC_BYPASS_TURNS") {
            if let Ok(n) = val.parse() {
                config.relevance.bypass_max_turns = n;
            }
        }

        if let Ok(val) = std::env::var("MECHANIC_CACHE_TTL_SECS") {
            if let Ok(secs) = val.parse() {
                config.enrichment.cache_ttl = Duration::from_secs(secs);
            }
        }

        if let Ok(val) = std::env::var("MECHANIC_CACHE_CAPACITY") {
            if let Ok(n) = val.parse() {
                config.enrichment.cache_capacity = n;
            }
        }

        if let Ok(val) = std::env::var("MECHANIC_GENERATION_RETRIES") {
            if let Ok(n) = val.parse() {
                config.generation.retry.max_retries = n;
            }
        }

        if let Ok(val) = std::env::var("MECHANIC_COMPRESSION_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.compression.threshold = n;
            }
        }

        if let Ok(val) = std::env::var("MECHANIC_TOKEN_BUDGET") {
            if let Ok(n) = val.parse() {
                config.compression.token_budget = n;
            }
        }

        if let Ok(val) = std::env::var("MECHANIC_RECENT_WINDOW") {
            if let Ok(n) = val.parse() {
                config.turn.recent_window = n;
            }
        }

        if let Ok(val) = std::env::var("MECHANIC_TURN_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                config.turn.timeout = Duration::from_secs(secs);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.turn.recent_window, 5);
        assert_eq!(config.compression.threshold, 10);
        assert!(config.turn.timeout > config.generation.timeout);
    }
}
