//! Mechanic Gateway - Conversation gateway for a bilingual automotive assistant
//!
//! This library provides the core functionality for the Mechanic gateway:
//! - Moderation and relevance gating of incoming messages
//! - Vehicle context enrichment with cached extraction
//! - Reply generation with retry and history compression
//! - English/Georgian language normalization
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Callers                          │
//! │       HTTP API  │  Bots  │  Support tooling         │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Mechanic Gateway                     │
//! │  Moderate │ Filter │ Enrich │ Generate │ Normalize  │
//! └──────┬─────────────────────────────────────┬────────┘
//!        │                                     │
//! ┌──────▼──────────┐                ┌─────────▼────────┐
//! │     SQLite      │                │    OpenAI API    │
//! │  conversations  │                │ chat/moderation  │
//! └─────────────────┘                └──────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod providers;
pub mod validate;

pub use config::{GatewayConfig, GenerationConfig, TurnConfig};
pub use context::{
    CompressedSummary, CompressionConfig, ContextEnhancer, EnrichedContext, EnrichmentConfig,
    HistoryCompressor, SafetyUrgency, SymptomCategory, VehicleInfo,
};
pub use db::{CompressedContext, Conversation, ConversationRepo, DbConn, DbPool, Message};
pub use error::{Error, Result};
pub use gateway::{ChatGateway, HealthReport, TurnRequest};
pub use pipeline::{
    LanguageNormalizer, RejectionKind, StageTimings, TurnOutcome, TurnRejection, TurnReply,
};
pub use providers::{Language, LanguageService, OpenAiService, RetryPolicy};
