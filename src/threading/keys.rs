//! Correlation key extraction (the reference extractor).
//!
//! Every incoming email carries a set of tokens usable to link it to an
//! existing conversation:
//!
//! 1. An optional Thread-Index token (Exchange-style conversation marker,
//!    base64-encoded, feature-flagged)
//! 2. The `<...>` tokens of its References header, in header order
//!
//! Key extraction is a pure function of the email plus the thread-index
//! flag; decode failures drop the single affected key and never abort
//! processing.

use regex::Regex;
use std::sync::OnceLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::models::IncomingEmail;

static REFERENCE_REGEX: OnceLock<Regex> = OnceLock::new();

/// Minimum decoded Thread-Index length: 6 bytes of flags/time prefix plus
/// the 16-byte conversation GUID we keep.
const THREAD_INDEX_MIN_LEN: usize = 22;

/// Matches one angle-bracket reference token, non-greedy so that adjacent
/// tokens split correctly.
fn reference_regex() -> &'static Regex {
    REFERENCE_REGEX.get_or_init(|| Regex::new(r"<.*?>").expect("invalid reference token regex"))
}

/// Extract raw `<...>` tokens from References-style header text.
///
/// Tokens are returned in header order with duplicates preserved; the
/// empty token `<>` is dropped.
pub fn reference_tokens(header_value: &str) -> Vec<String> {
    reference_regex()
        .find_iter(header_value)
        .map(|m| m.as_str().to_string())
        .filter(|token| token != "<>")
        .collect()
}

/// Decode a Thread-Index header value into a stable correlation token.
///
/// The raw value is base64; the decoded bytes start with a 6-byte
/// flags/timestamp prefix followed by a 16-byte conversation GUID. The
/// token is the GUID hex-encoded (32 lowercase hex chars). Any decode
/// failure yields None rather than an error.
pub fn decode_thread_index(raw: &str) -> Option<String> {
    let decoded = match BASE64.decode(raw.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::debug!("malformed thread-index `{}`: {}", raw.trim(), e);
            return None;
        }
    };

    if decoded.len() < THREAD_INDEX_MIN_LEN {
        log::debug!(
            "thread-index too short ({} bytes), ignoring",
            decoded.len()
        );
        return None;
    }

    let guid = &decoded[6..THREAD_INDEX_MIN_LEN];
    Some(guid.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Correlation keys of an email: decoded thread-index (if enabled and
/// decodable) followed by its reference tokens.
///
/// The message_id itself is deliberately absent: it is covered by the
/// duplicate check and only joins the key set when placeholders are
/// reserved for a new ticket.
pub fn correlation_keys(mail: &IncomingEmail, use_thread_index: bool) -> Vec<String> {
    let mut keys = Vec::with_capacity(mail.references.len() + 1);

    if use_thread_index {
        if let Some(raw) = &mail.thread_index {
            if let Some(token) = decode_thread_index(raw) {
                keys.push(token);
            }
        }
    }

    keys.extend(mail.references.iter().cloned());
    keys
}
