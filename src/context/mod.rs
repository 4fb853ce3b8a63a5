//! Diagnostic context: extraction, caching, enrichment, and compression
//!
//! The enriched context is transient working state. It lives in the
//! enrichment cache while a conversation is active and survives restarts
//! only through the fields embedded in compressed history summaries.

pub mod cache;
pub mod compression;
pub mod enhancer;
pub mod extract;

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::providers::ContextPayload;

pub use cache::EnrichmentCache;
pub use compression::{CompressedSummary, CompressionConfig, CompressionOutcome, HistoryCompressor};
pub use enhancer::{ContextEnhancer, EnrichmentConfig};

/// Fixed symptom taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymptomCategory {
    Engine,
    Brakes,
    Steering,
    Transmission,
    Electrical,
    Other,
}

impl SymptomCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Brakes => "brakes",
            Self::Steering => "steering",
            Self::Transmission => "transmission",
            Self::Electrical => "electrical",
            Self::Other => "other",
        }
    }

    /// Parse a provider-supplied category label
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "engine" => Some(Self::Engine),
            "brakes" | "brake" => Some(Self::Brakes),
            "steering" => Some(Self::Steering),
            "transmission" => Some(Self::Transmission),
            "electrical" => Some(Self::Electrical),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Safety urgency, ordered from calm to drop-everything
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SafetyUrgency {
    #[default]
    None,
    Advisory,
    Urgent,
    Immediate,
}

impl SafetyUrgency {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Advisory => "advisory",
            Self::Urgent => "urgent",
            Self::Immediate => "immediate",
        }
    }

    /// Parse a provider-supplied urgency label, tolerating the common
    /// low/medium/high/critical vocabulary
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "none" => Some(Self::None),
            "advisory" | "low" | "medium" => Some(Self::Advisory),
            "urgent" | "high" => Some(Self::Urgent),
            "immediate" | "critical" => Some(Self::Immediate),
            _ => None,
        }
    }
}

/// What we know about the vehicle under discussion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<u16>,
    pub mileage: Option<u32>,
}

impl VehicleInfo {
    /// Fold newer facts in: present fields overwrite, absent fields keep
    /// what was already known
    pub fn merge(&mut self, newer: &Self) {
        if newer.make.is_some() {
            self.make.clone_from(&newer.make);
        }
        if newer.model.is_some() {
            self.model.clone_from(&newer.model);
        }
        if newer.year.is_some() {
            self.year = newer.year;
        }
        if newer.mileage.is_some() {
            self.mileage = newer.mileage;
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.make.is_none() && self.model.is_none() && self.year.is_none() && self.mileage.is_none()
    }
}

/// Structured diagnostic context for one conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedContext {
    pub vehicle: VehicleInfo,
    pub symptoms: BTreeSet<SymptomCategory>,
    /// OBD-II codes, uppercased, in order of first mention
    pub codes: Vec<String>,
    pub urgency: SafetyUrgency,
    /// Advisory only; never drives control flow
    pub predicted_questions: Vec<String>,
}

impl EnrichedContext {
    /// Normalize a provider payload into a context: unknown symptom labels
    /// are dropped, codes are validated and uppercased, questions capped at
    /// five.
    #[must_use]
    pub fn from_payload(payload: &ContextPayload) -> Self {
        let symptoms = payload
            .symptoms
            .iter()
            .filter_map(|label| SymptomCategory::from_label(label))
            .collect();

        let mut codes = Vec::new();
        for raw in &payload.codes {
            if let Some(code) = extract::normalize_code(raw) {
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }

        let urgency = payload
            .urgency
            .as_deref()
            .and_then(SafetyUrgency::from_label)
            .unwrap_or_default();

        let mut predicted_questions = payload.predicted_questions.clone();
        predicted_questions.truncate(5);

        Self {
            vehicle: VehicleInfo {
                make: payload.vehicle.make.clone(),
                model: payload.vehicle.model.clone(),
                year: payload.vehicle.year,
                mileage: payload.vehicle.mileage,
            },
            symptoms,
            codes,
            urgency,
            predicted_questions,
        }
    }

    /// Merge a fresh extraction over this one. New facts add, contradictions
    /// resolve in favor of the fresh extraction, and nothing already known
    /// is lost: symptom sets and code lists union, urgency keeps its maximum.
    #[must_use]
    pub fn merged_with(&self, fresh: &Self) -> Self {
        let mut merged = self.clone();

        merged.vehicle.merge(&fresh.vehicle);
        merged.symptoms.extend(fresh.symptoms.iter().copied());

        for code in &fresh.codes {
            if !merged.codes.contains(code) {
                merged.codes.push(code.clone());
            }
        }

        merged.urgency = merged.urgency.max(fresh.urgency);

        if !fresh.predicted_questions.is_empty() {
            merged
                .predicted_questions
                .clone_from(&fresh.predicted_questions);
        }

        merged
    }

    /// Compact plain-text rendering for system prompts. Empty contexts
    /// render as an empty string.
    #[must_use]
    pub fn prompt_summary(&self) -> String {
        let mut out = String::new();

        if !self.vehicle.is_empty() {
            let mut parts = Vec::new();
            if let Some(year) = self.vehicle.year {
                parts.push(year.to_string());
            }
            if let Some(make) = &self.vehicle.make {
                parts.push(make.clone());
            }
            if let Some(model) = &self.vehicle.model {
                parts.push(model.clone());
            }
            let mut line = format!("Vehicle: {}", parts.join(" "));
            if let Some(mileage) = self.vehicle.mileage {
                let _ = write!(line, " ({mileage} on the clock)");
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }

        if !self.symptoms.is_empty() {
            let labels: Vec<&str> = self.symptoms.iter().map(|s| s.as_str()).collect();
            let _ = writeln!(out, "Symptom areas: {}", labels.join(", "));
        }

        if !self.codes.is_empty() {
            let _ = writeln!(out, "Diagnostic codes: {}", self.codes.join(", "));
        }

        if self.urgency != SafetyUrgency::None {
            let _ = writeln!(out, "Safety urgency: {}", self.urgency.as_str());
        }

        out.trim_end().to_string()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vehicle.is_empty()
            && self.symptoms.is_empty()
            && self.codes.is_empty()
            && self.urgency == SafetyUrgency::None
            && self.predicted_questions.is_empty()
    }
}
