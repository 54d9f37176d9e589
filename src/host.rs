//! Collaborator seams toward the host ticketing application.
//!
//! The gateway never touches the host's data model directly: ticket
//! lookups, ticket/followup creation, watcher mutation and directory
//! lookups all go through these traits. Host calls are synchronous; the
//! host application owns its own persistence.

use crate::error::HostError;
use crate::models::TicketStatus;

/// Request to create a new ticket from an incoming email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTicketRequest {
    pub subject: String,
    pub body: String,
    /// Sender address, used by the host to resolve the default requester.
    pub sender_email: String,
    /// Requester override resolved from a `##From:` directive.
    pub requester_override: Option<i64>,
    /// Closed ticket this new one is cross-linked to (non-blocking link,
    /// not a merge).
    pub linked_ticket_id: Option<i64>,
    pub source_id: i64,
}

/// Request to append a followup to an existing ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFollowupRequest {
    pub ticket_id: i64,
    pub body: String,
    pub sender_email: String,
    /// Author override resolved from a `##From:` directive.
    pub author_override: Option<i64>,
}

/// Ticketing operations the gateway consumes.
pub trait TicketHost {
    /// Status of a ticket, None when the ticket no longer exists.
    fn ticket_status(&self, ticket_id: i64) -> Result<Option<TicketStatus>, HostError>;

    /// Create a ticket and return its id.
    fn create_ticket(&self, req: NewTicketRequest) -> Result<i64, HostError>;

    /// Append a followup to a ticket and return the followup id.
    fn add_followup(&self, req: NewFollowupRequest) -> Result<i64, HostError>;

    /// Add a user as observer on a ticket, no-op when already present.
    fn add_observer_user(&self, ticket_id: i64, user_id: i64) -> Result<(), HostError>;

    /// Add a group as observer on a ticket, no-op when already present.
    fn add_observer_group(&self, ticket_id: i64, group_id: i64) -> Result<(), HostError>;
}

/// Outcome of a directory lookup. Zero and multiple matches are
/// distinguished only for logging; both leave the directive unapplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Unique(i64),
    NotFound,
    Ambiguous,
}

impl Lookup {
    pub fn unique(self) -> Option<i64> {
        match self {
            Lookup::Unique(id) => Some(id),
            _ => None,
        }
    }
}

/// Directory lookups against the host's user/group registry.
///
/// Implementations must only consider active, non-deleted entries; the
/// (last, first) lookup additionally requires a default email address, as
/// the host resolves notification targets through it.
pub trait Directory {
    /// Exact email match.
    fn user_by_email(&self, email: &str) -> Result<Lookup, HostError>;

    /// Exact (last name, first name) match.
    fn user_by_name(&self, last: &str, first: &str) -> Result<Lookup, HostError>;

    /// Exact group name match.
    fn group_by_name(&self, name: &str) -> Result<Lookup, HostError>;
}
