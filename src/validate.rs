//! Input validation for incoming turns

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

/// Maximum accepted message length, in characters.
pub const MAX_MESSAGE_LEN: usize = 5000;

static USER_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));

/// Check that a user id is well formed.
///
/// # Errors
///
/// Returns [`Error::Validation`] for empty ids or ids containing characters
/// outside `[A-Za-z0-9_-]`.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if USER_ID_RE.is_match(user_id) {
        Ok(())
    } else {
        Err(Error::Validation("invalid user id".into()))
    }
}

/// Normalize an incoming message: unify line endings, strip control
/// characters, trim surrounding whitespace.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the result is empty, exceeds
/// [`MAX_MESSAGE_LEN`] characters, or is degenerately repetitive.
pub fn sanitize_message(message: &str) -> Result<String> {
    let cleaned: String = message
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let cleaned = cleaned.trim().to_string();

    if cleaned.is_empty() {
        return Err(Error::Validation("message is empty".into()));
    }
    if cleaned.chars().count() > MAX_MESSAGE_LEN {
        return Err(Error::Validation(format!(
            "message exceeds {MAX_MESSAGE_LEN} characters"
        )));
    }
    if is_repetitive(&cleaned) {
        return Err(Error::Validation("message is repetitive".into()));
    }

    Ok(cleaned)
}

/// A message of ten or more words where a single word makes up more than half
/// of them is treated as spam.
fn is_repetitive(message: &str) -> bool {
    let lowered = message.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    if words.len() < 10 {
        return false;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for word in &words {
        *counts.entry(word).or_insert(0) += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);

    max * 2 > words.len()
}
