//! Recipient address validation and normalization.
//!
//! Accepted forms:
//! - phone numbers: optional `+`, 7–15 digits; spaces, dashes and parentheses are stripped
//! - JIDs: `<local>@s.whatsapp.net`, `@g.us`, `@c.us`, `@broadcast`, `@lid`
//! - legacy group ids: `<digits>-<digits>`

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationError;

static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?[0-9]{7,15}$").unwrap());

static JID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Za-z._\-]+@(s\.whatsapp\.net|g\.us|c\.us|broadcast|lid)$").unwrap()
});

static LEGACY_GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{5,20}-[0-9]{5,20}$").unwrap());

/// Normalize a single recipient, or `None` if it is not a valid address.
pub fn normalize_recipient(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if JID.is_match(trimmed) || LEGACY_GROUP.is_match(trimmed) {
        return Some(trimmed.to_string());
    }

    let phone: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    PHONE.is_match(&phone).then_some(phone)
}

/// Validate and normalize a whole recipient list.
///
/// Fails on the first invalid entry so the caller can point at it.
pub fn validate_recipients(recipients: &[String]) -> Result<Vec<String>, ValidationError> {
    if recipients.is_empty() {
        return Err(ValidationError::EmptyRecipients);
    }

    recipients
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            normalize_recipient(raw).ok_or_else(|| ValidationError::InvalidRecipient {
                index,
                recipient: raw.clone(),
            })
        })
        .collect()
}
