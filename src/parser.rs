//! Raw message parsing and normalization.
//!
//! Turns raw RFC 5322 bytes fetched from a mail source into an
//! [`IncomingEmail`] ready for threading. Uses the `mailparse` crate for
//! MIME parsing.
//!
//! # Key responsibilities
//!
//! - **Header extraction**: Message-ID, References, Thread-Index, Subject,
//!   From, Date
//! - **Token form**: Message-ID and reference tokens keep their raw `<...>`
//!   form — correlation rows are compared verbatim, so stripping brackets
//!   would break equality with previously stored keys
//! - **Body rendering**: prefer the first text/plain part; fall back to
//!   stripping an HTML part down to plain text for directive scanning
//! - **Leniency**: a missing or invalid Date degrades to `None`; only a
//!   missing Message-ID or sender address makes the message unprocessable
//!
//! Parse failures are reported to the caller, which moves the message to
//! the refused folder; they never abort a batch.

use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, ParsedMail, parse_mail};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::models::IncomingEmail;
use crate::threading::keys::reference_tokens;

static HTML_BREAK_REGEX: OnceLock<Regex> = OnceLock::new();
static HTML_TAG_REGEX: OnceLock<Regex> = OnceLock::new();

/// Errors that make a message unprocessable.
#[derive(Debug, Error)]
pub enum ParseEmailError {
    #[error("failed to parse MIME structure: {0}")]
    MimeParse(#[from] mailparse::MailParseError),
    #[error("missing Message-ID header")]
    MissingMessageId,
    #[error("missing sender address for message {message_id}")]
    MissingSender { message_id: String },
}

/// Strip NUL bytes and surrounding whitespace.
fn sanitize_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

/// Block-level elements that imply a line break when HTML is flattened.
fn html_break_regex() -> &'static Regex {
    HTML_BREAK_REGEX.get_or_init(|| {
        Regex::new(r"(?i)<(?:br|p|div)(?:\s[^>]*)?/?>").expect("invalid html break regex")
    })
}

fn html_tag_regex() -> &'static Regex {
    HTML_TAG_REGEX.get_or_init(|| Regex::new(r"<[^>]*>").expect("invalid html tag regex"))
}

/// Flatten HTML to bare text: block elements become newlines, remaining
/// tags are dropped, common entities are decoded.
pub fn html_to_text(html: &str) -> String {
    let text = html_break_regex().replace_all(html, "\n");
    let text = html_tag_regex().replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace('\u{a0}', " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    sanitize_text(&text)
}

/// Extract the plain-text body, walking multipart structure depth-first.
///
/// text/plain wins over text/html; an HTML-only message is stripped to
/// text so directive scanning still works.
fn extract_body_text(parsed: &ParsedMail) -> String {
    if parsed.subparts.is_empty() {
        let body = parsed.get_body().unwrap_or_default();
        return if parsed.ctype.mimetype.eq_ignore_ascii_case("text/html") {
            html_to_text(&body)
        } else {
            sanitize_text(&body)
        };
    }

    if let Some(plain) = find_part(parsed, "text/plain") {
        return sanitize_text(&plain.get_body().unwrap_or_default());
    }
    if let Some(html) = find_part(parsed, "text/html") {
        return html_to_text(&html.get_body().unwrap_or_default());
    }

    sanitize_text(&parsed.get_body().unwrap_or_default())
}

fn find_part<'a, 'b>(parsed: &'a ParsedMail<'b>, mimetype: &str) -> Option<&'a ParsedMail<'b>> {
    for part in &parsed.subparts {
        if part.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
            return Some(part);
        }
        if let Some(nested) = find_part(part, mimetype) {
            return Some(nested);
        }
    }
    None
}

/// Parse the Date header leniently: anything unparseable becomes None.
fn parse_date(raw: Option<String>, message_id: &str) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if raw.trim().is_empty() {
        return None;
    }
    match dateparser::parse(&raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            log::debug!("email {} has invalid date `{}`: {}", message_id, raw, e);
            None
        }
    }
}

/// Parse a raw message fetched from a mail source into an `IncomingEmail`.
///
/// `uid` is the mailbox UID used later for disposition; `source_id` scopes
/// the correlation namespace.
pub fn parse_incoming(
    raw: &[u8],
    uid: &str,
    source_id: i64,
) -> Result<IncomingEmail, ParseEmailError> {
    let parsed = parse_mail(raw)?;

    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|v| sanitize_text(&v))
        .filter(|v| !v.is_empty())
        .ok_or(ParseEmailError::MissingMessageId)?;

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| sanitize_text(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "(No Subject)".to_string());

    let (sender_name, sender_email) = match parsed
        .headers
        .get_first_value("From")
        .and_then(|v| mailparse::addrparse(&v).ok())
        .and_then(|addrs| {
            addrs.iter().next().and_then(|addr| match addr {
                mailparse::MailAddr::Single(info) => Some((
                    info.display_name.clone().unwrap_or_default(),
                    info.addr.to_lowercase(),
                )),
                _ => None,
            })
        }) {
        Some((name, email)) if !email.is_empty() => (sanitize_text(&name), email),
        _ => {
            log::warn!("email {} missing sender address", message_id);
            return Err(ParseEmailError::MissingSender { message_id });
        }
    };

    let references = parsed
        .headers
        .get_first_value("References")
        .map(|v| reference_tokens(&v))
        .unwrap_or_default();

    let thread_index = parsed
        .headers
        .get_first_value("Thread-Index")
        .map(|v| sanitize_text(&v))
        .filter(|v| !v.is_empty());

    let date = parse_date(parsed.headers.get_first_value("Date"), &message_id);

    let body_text = extract_body_text(&parsed);

    log::trace!("parsed {} ({})", message_id, subject);

    Ok(IncomingEmail {
        uid: uid.to_string(),
        message_id,
        references,
        thread_index,
        subject,
        sender_name,
        sender_email,
        body_text,
        date,
        source_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_mail(extra_headers: &str, body: &str) -> Vec<u8> {
        format!(
            "Message-ID: <m1@example.com>\r\nSubject: Printer broken\r\nFrom: Jane Doe <jane.doe@example.com>\r\nDate: Tue, 2 Jul 2013 10:00:00 +0200\r\n{}\r\n{}",
            extra_headers, body
        )
        .into_bytes()
    }

    #[test]
    fn test_parse_keeps_raw_message_id_token() {
        let mail = parse_incoming(&raw_mail("", "body"), "uid-1", 1).unwrap();
        assert_eq!(mail.message_id, "<m1@example.com>");
        assert_eq!(mail.uid, "uid-1");
        assert_eq!(mail.source_id, 1);
        assert_eq!(mail.sender_email, "jane.doe@example.com");
        assert!(mail.date.is_some());
    }

    #[test]
    fn test_parse_extracts_reference_tokens_in_order() {
        let mail = parse_incoming(
            &raw_mail("References: <a@x> <b@y>\r\n", "body"),
            "uid-1",
            1,
        )
        .unwrap();
        assert_eq!(mail.references, vec!["<a@x>", "<b@y>"]);
    }

    #[test]
    fn test_parse_extracts_thread_index() {
        let mail = parse_incoming(
            &raw_mail("Thread-Index: Ac5rWReeRb4gv3pCR8GDflsZrsqhoA==\r\n", "x"),
            "uid-1",
            1,
        )
        .unwrap();
        assert_eq!(
            mail.thread_index.as_deref(),
            Some("Ac5rWReeRb4gv3pCR8GDflsZrsqhoA==")
        );
    }

    #[test]
    fn test_parse_missing_message_id() {
        let raw = b"Subject: no id\r\nFrom: a@b.c\r\n\r\nbody";
        let err = parse_incoming(raw, "uid-1", 1).unwrap_err();
        assert!(matches!(err, ParseEmailError::MissingMessageId));
    }

    #[test]
    fn test_parse_missing_sender() {
        let raw = b"Message-ID: <m@x>\r\nSubject: s\r\n\r\nbody";
        let err = parse_incoming(raw, "uid-1", 1).unwrap_err();
        assert!(matches!(err, ParseEmailError::MissingSender { .. }));
    }

    #[test]
    fn test_parse_invalid_date_degrades_to_none() {
        let raw = b"Message-ID: <m@x>\r\nFrom: a@b.c\r\nDate: not-a-date\r\n\r\nbody";
        let mail = parse_incoming(raw, "uid-1", 1).unwrap();
        assert!(mail.date.is_none());
    }

    #[test]
    fn test_html_to_text() {
        let text = html_to_text("<p>##From: Doe, Jane</p><br><b>hello</b>&nbsp;&amp; bye");
        assert_eq!(text, "##From: Doe, Jane\nhello & bye");
    }

    #[test]
    fn test_html_only_body_is_stripped() {
        let raw = concat!(
            "Message-ID: <m@x>\r\n",
            "From: a@b.c\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<div>##CC: Support Team</div>\r\n"
        );
        let mail = parse_incoming(raw.as_bytes(), "uid-1", 1).unwrap();
        assert_eq!(mail.body_text, "##CC: Support Team");
    }

    #[test]
    fn test_multipart_prefers_text_plain() {
        let raw = concat!(
            "Message-ID: <m@x>\r\n",
            "From: a@b.c\r\n",
            "Content-Type: multipart/alternative; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain body\r\n",
            "--b\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>html body</p>\r\n",
            "--b--\r\n"
        );
        let mail = parse_incoming(raw.as_bytes(), "uid-1", 1).unwrap();
        assert_eq!(mail.body_text, "plain body");
    }
}
