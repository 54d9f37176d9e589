//! Core data types shared across the gateway.
//!
//! `IncomingEmail` and `ThreadingDecision` are transient: they live for one
//! processing invocation and are discarded afterwards. `CorrelationRecord`
//! mirrors a row of the persistent `correlation_records` table owned by the
//! correlation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single email pulled from a mail source, reduced to the fields the
/// threading engine needs.
#[derive(Debug, Clone)]
pub struct IncomingEmail {
    /// Mailbox UID, used to address the message for disposition.
    pub uid: String,

    /// Raw Message-ID token including angle brackets, e.g. `<abc@host>`.
    ///
    /// Correlation keys are compared verbatim against stored rows, so the
    /// raw form is preserved rather than stripped.
    pub message_id: String,

    /// Reference tokens from the References header, in header order,
    /// duplicates preserved. Raw `<...>` form.
    pub references: Vec<String>,

    /// Raw base64 value of the Thread-Index header, if present.
    /// Decoding is deferred to key extraction and feature-flagged.
    pub thread_index: Option<String>,

    /// Subject line, `(No Subject)` when the header is missing.
    pub subject: String,

    /// Display name from the From header, may be empty.
    pub sender_name: String,

    /// Sender address from the From header, lowercased.
    pub sender_email: String,

    /// Plain-text rendering of the body (HTML stripped), used for
    /// directive scanning and as followup/ticket content.
    pub body_text: String,

    /// Date header, None when missing or unparseable.
    pub date: Option<DateTime<Utc>>,

    /// Identifier of the mailbox/source this email arrived on. Scopes the
    /// correlation namespace so identical keys on independent sources do
    /// not collide.
    pub source_id: i64,
}

/// Terminal outcome of the threading engine for one incoming email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingDecision {
    /// This exact message already produced a ticket or followup; nothing
    /// was created and the message goes to the refused folder.
    Duplicate,

    /// A followup was appended to the open ticket the references resolved
    /// to.
    AppendFollowup { ticket_id: i64 },

    /// The references resolved to a closed ticket: a brand-new ticket was
    /// created, cross-linked to the closed one.
    ReopenLink {
        ticket_id: i64,
        closed_ticket_id: i64,
    },

    /// No bound correlation was found: a new ticket was created.
    NewTicket { ticket_id: i64 },
}

impl ThreadingDecision {
    /// The ticket the email ended up attached to, if any.
    pub fn ticket_id(&self) -> Option<i64> {
        match self {
            ThreadingDecision::Duplicate => None,
            ThreadingDecision::AppendFollowup { ticket_id }
            | ThreadingDecision::ReopenLink { ticket_id, .. }
            | ThreadingDecision::NewTicket { ticket_id } => Some(*ticket_id),
        }
    }
}

/// Host ticket status as far as the threading decision cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    Assigned,
    Planned,
    Waiting,
    Solved,
    Closed,
}

impl TicketStatus {
    /// Solved and Closed both refuse followups: a reply to either starts a
    /// new ticket linked to the old one.
    pub fn is_closed_like(&self) -> bool {
        matches!(self, TicketStatus::Solved | TicketStatus::Closed)
    }
}

/// One row of the `correlation_records` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CorrelationRecord {
    pub id: i64,
    /// Correlation key value (Message-ID, reference token, or decoded
    /// thread-index token).
    pub message_id: String,
    pub source_id: i64,
    /// 0 = placeholder reserved before the owning ticket exists.
    pub ticket_id: i64,
}

/// Mailbox folder a processed message is moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folder {
    Accepted,
    Refused,
}
