//! Deterministic diagnostic extraction
//!
//! Pattern-based fallback used whenever the provider's structured extraction
//! fails or returns garbage. Always produces a valid, possibly partial,
//! context. Also the source of truth for code validation, so a provider miss
//! can never drop a code the user actually typed.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{EnrichedContext, SafetyUrgency, SymptomCategory, VehicleInfo};

static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[pbcu][0-9]{4}\b").expect("valid regex"));

static CODE_EXACT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[pbcu][0-9]{4}$").expect("valid regex"));

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19[5-9][0-9]|20[0-3][0-9])\b").expect("valid regex"));

static MILEAGE_PLAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,3}(?:,\d{3})+|\d{1,7})\s*(?:miles|mi\b|km)").expect("valid regex")
});

static MILEAGE_K_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,4})k\s*(?:miles|mi\b|km)").expect("valid regex"));

static MILEAGE_THOUSAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,4})\s*thousand\s*(?:miles|km)").expect("valid regex")
});

static MAKE_MODEL_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "Toyota",
            r"(?i)\btoyota\s+(camry|corolla|prius|rav4|highlander|sienna)\b",
        ),
        (
            "Honda",
            r"(?i)\bhonda\s+(civic|accord|cr-?v|pilot|odyssey|fit)\b",
        ),
        ("BMW", r"(?i)\bbmw\s+(x[1-7]|[1-8]\s*series|\d{3}[ix]?)\b"),
        (
            "Mercedes",
            r"(?i)\bmercedes(?:-benz)?\s+([cesmlgab])[\s-]*class\b",
        ),
        ("Audi", r"(?i)\baudi\s+(a[3-8]|q[3-8]|tt)\b"),
        (
            "Ford",
            r"(?i)\bford\s+(f-?150|mustang|explorer|escape|focus|fiesta)\b",
        ),
        (
            "Chevrolet",
            r"(?i)\b(?:chevrolet|chevy)\s+(malibu|cruze|equinox|tahoe|silverado)\b",
        ),
        (
            "Nissan",
            r"(?i)\bnissan\s+(altima|sentra|rogue|pathfinder|frontier)\b",
        ),
        (
            "Hyundai",
            r"(?i)\bhyundai\s+(elantra|sonata|santa\s*fe|tucson|accent)\b",
        ),
        ("Kia", r"(?i)\bkia\s+(optima|forte|soul|sorento|sportage)\b"),
    ]
    .into_iter()
    .map(|(make, pattern)| (make, Regex::new(pattern).expect("valid regex")))
    .collect()
});

static MAKE_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(toyota|honda|bmw|mercedes|audi|ford|chevrolet|chevy|nissan|hyundai|kia|volkswagen|mazda|subaru|lexus)\b",
    )
    .expect("valid regex")
});

static SYMPTOM_PATTERNS: LazyLock<Vec<(SymptomCategory, Vec<Regex>)>> = LazyLock::new(|| {
    let compile = |patterns: &[&str]| {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("valid regex"))
            .collect::<Vec<_>>()
    };

    vec![
        (
            SymptomCategory::Engine,
            compile(&[
                r"(?i)engine.*(?:grinding|noise|vibrat|knock)",
                r"(?i)grinding.*noise",
                r"(?i)\bknock",
                r"(?i)misfir",
                r"(?i)rough.*idle",
                r"(?i)check\s+engine",
                r"(?i)overheat",
                r"(?i)\bstall",
            ]),
        ),
        (
            SymptomCategory::Brakes,
            compile(&[
                r"(?i)brake.*(?:spongy|grinding|squeal|soft|feel)",
                r"(?i)spongy.*pedal",
                r"(?i)pedal.*(?:floor|soft|spongy)",
                r"(?i)squeal.*brak",
            ]),
        ),
        (
            SymptomCategory::Steering,
            compile(&[
                r"(?i)steering.*(?:shake|vibrat|pull|loose)",
                r"(?i)wheel.*shak",
                r"(?i)hard.*turn",
                r"(?i)pull(?:s|ing)?.*(?:left|right)",
            ]),
        ),
        (
            SymptomCategory::Transmission,
            compile(&[
                r"(?i)transmission.*(?:slip|shift|grind)",
                r"(?i)slip.*gear",
                r"(?i)shift.*(?:hard|rough|delay)",
                r"(?i)clutch.*slip",
                r"(?i)gear.*slip",
            ]),
        ),
        (
            SymptomCategory::Electrical,
            compile(&[
                r"(?i)battery.*(?:dead|drain|die)",
                r"(?i)(?:won't|wont|will not|doesn't|does not)\s+(?:start|crank)",
                r"(?i)no\s+crank",
                r"(?i)alternator",
                r"(?i)blown\s+fuse",
                r"(?i)lights?\s+(?:dim|flicker)",
            ]),
        ),
        (
            SymptomCategory::Other,
            compile(&[
                r"(?i)fluid.*leak",
                r"(?i)leak.*fluid",
                r"(?i)\bsmoke",
                r"(?i)burning\s+smell",
                r"(?i)smell.*burning",
            ]),
        ),
    ]
});

static DANGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)overheat|knock|fire|smoke|burning").expect("valid regex")
});

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:[.,]\d+)*\b").expect("valid regex"));

/// All OBD-II codes in a text, uppercased, in order of first appearance
#[must_use]
pub fn diagnostic_codes(text: &str) -> Vec<String> {
    let mut codes = Vec::new();
    for m in CODE_RE.find_iter(text) {
        let code = m.as_str().to_uppercase();
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

/// Code tokens exactly as they appear in the text, duplicates and all.
/// Used for byte-level preservation checks across translation, where
/// the canonical uppercase form of [`diagnostic_codes`] is too lenient.
#[must_use]
pub fn raw_code_tokens(text: &str) -> Vec<&str> {
    CODE_RE.find_iter(text).map(|m| m.as_str()).collect()
}

/// Numeric measurements exactly as they appear in the text. Digits inside
/// a code token never match on their own, the leading letter blocks the
/// word boundary.
#[must_use]
pub fn numeric_tokens(text: &str) -> Vec<&str> {
    NUMBER_RE.find_iter(text).map(|m| m.as_str()).collect()
}

/// Validate and uppercase a single candidate code
#[must_use]
pub fn normalize_code(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    CODE_EXACT_RE
        .is_match(trimmed)
        .then(|| trimmed.to_uppercase())
}

/// Pattern-match vehicle identity out of free text
#[must_use]
pub fn vehicle(text: &str) -> VehicleInfo {
    let mut info = VehicleInfo::default();

    for (make, pattern) in MAKE_MODEL_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            info.make = Some((*make).to_string());
            info.model = caps.get(1).map(|m| {
                if *make == "Mercedes" {
                    format!("{}-Class", m.as_str().to_uppercase())
                } else {
                    model_case(m.as_str())
                }
            });
            break;
        }
    }

    // No known make/model pair; settle for a bare make mention
    if info.make.is_none() {
        if let Some(m) = MAKE_ONLY_RE.find(text) {
            info.make = Some(display_make(m.as_str()));
        }
    }

    if let Some(caps) = YEAR_RE.captures(text) {
        info.year = caps.get(1).and_then(|y| y.as_str().parse().ok());
    }

    info.mileage = mileage(text);

    info
}

/// Model designations of three characters or fewer read as abbreviations
/// (CRV, X5); anything longer gets word-by-word capitalization
fn model_case(model: &str) -> String {
    if model.len() <= 3 {
        return model.to_uppercase();
    }

    let mut out = String::with_capacity(model.len());
    let mut at_word_start = true;
    for c in model.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

fn display_make(raw: &str) -> String {
    match raw.to_lowercase().as_str() {
        "bmw" => "BMW".to_string(),
        "chevy" => "Chevrolet".to_string(),
        other => {
            let mut chars = other.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().collect::<String>() + chars.as_str()
            })
        }
    }
}

fn mileage(text: &str) -> Option<u32> {
    if let Some(caps) = MILEAGE_K_RE.captures(text) {
        let thousands: u32 = caps.get(1)?.as_str().parse().ok()?;
        return Some(thousands * 1000);
    }

    if let Some(caps) = MILEAGE_THOUSAND_RE.captures(text) {
        let thousands: u32 = caps.get(1)?.as_str().parse().ok()?;
        return Some(thousands * 1000);
    }

    if let Some(caps) = MILEAGE_PLAIN_RE.captures(text) {
        let digits: String = caps.get(1)?.as_str().chars().filter(char::is_ascii_digit).collect();
        return digits.parse().ok();
    }

    None
}

/// Match symptom keywords onto the fixed taxonomy
#[must_use]
pub fn symptoms(text: &str) -> BTreeSet<SymptomCategory> {
    let mut found = BTreeSet::new();
    for (category, patterns) in SYMPTOM_PATTERNS.iter() {
        if patterns.iter().any(|p| p.is_match(text)) {
            found.insert(*category);
        }
    }
    found
}

/// Rule-based safety escalation, layered over whatever the provider said.
/// Rules only ever raise urgency:
/// brake symptoms mean immediate, steering means urgent, danger keywords
/// mean urgent, and any code or symptom at all means at least advisory.
#[must_use]
pub fn escalate_urgency(
    base: SafetyUrgency,
    symptoms: &BTreeSet<SymptomCategory>,
    has_codes: bool,
    text: &str,
) -> SafetyUrgency {
    let mut level = base;

    if symptoms.contains(&SymptomCategory::Brakes) {
        level = level.max(SafetyUrgency::Immediate);
    }
    if symptoms.contains(&SymptomCategory::Steering) {
        level = level.max(SafetyUrgency::Urgent);
    }
    if DANGER_RE.is_match(text) {
        level = level.max(SafetyUrgency::Urgent);
    }
    if has_codes || !symptoms.is_empty() {
        level = level.max(SafetyUrgency::Advisory);
    }

    level
}

/// Likely next questions for the symptom areas in play
#[must_use]
pub fn predicted_questions(symptoms: &BTreeSet<SymptomCategory>) -> Vec<String> {
    let mut questions = Vec::new();

    if symptoms.contains(&SymptomCategory::Engine) {
        questions.extend([
            "What diagnostic codes should I check?".to_string(),
            "How much will engine repair cost?".to_string(),
            "Can I drive safely with this problem?".to_string(),
        ]);
    }
    if symptoms.contains(&SymptomCategory::Brakes) {
        questions.extend([
            "How urgent is brake repair?".to_string(),
            "What's the cost of brake service?".to_string(),
            "Can I drive with brake problems?".to_string(),
        ]);
    }

    questions.truncate(5);
    questions
}

/// Full fallback extraction over a single message
#[must_use]
pub fn context_from_text(text: &str) -> EnrichedContext {
    let vehicle = vehicle(text);
    let symptoms = symptoms(text);
    let codes = diagnostic_codes(text);
    let urgency = escalate_urgency(SafetyUrgency::None, &symptoms, !codes.is_empty(), text);
    let predicted_questions = predicted_questions(&symptoms);

    EnrichedContext {
        vehicle,
        symptoms,
        codes,
        urgency,
        predicted_questions,
    }
}
