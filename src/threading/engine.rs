//! Threading decision engine.
//!
//! Runs the per-email state machine that decides how an incoming message
//! joins the ticket conversation graph:
//!
//! 1. **Duplicate check** — a message id already bound to a ticket means
//!    this exact email was processed before: drop it, refused folder.
//! 2. **Correlation lookup** — resolve the email's correlation keys
//!    against the store. A hit on an open ticket appends a followup; a hit
//!    on a closed (or solved) ticket falls through to ticket creation with
//!    a cross-link to the closed ticket.
//! 3. **New ticket** — reserve placeholders for every key the email
//!    carries, create the ticket through the host, then bind all
//!    placeholders to the new id so future replies resolve directly.
//!
//! The duplicate check is the sole idempotency guard: every store write
//! upstream of it is insert-if-absent, so reprocessing a message after a
//! crash is safe at any point.
//!
//! When several references resolve to different tickets, the numerically
//! highest ticket id wins before status is considered — the historical
//! behavior, pinned by `closed_ticket_wins_tiebreak_over_open` below.

use crate::config::GatewayConfig;
use crate::directives::{parse_directives, resolve_requester_override, resolve_watchers};
use crate::error::GatewayError;
use crate::host::{Directory, NewFollowupRequest, NewTicketRequest, TicketHost};
use crate::models::{Folder, IncomingEmail, ThreadingDecision};
use crate::threading::keys::correlation_keys;
use crate::threading::store::CorrelationStore;

/// The engine owns the correlation store handle and the per-source
/// configuration; host collaborators are passed per call.
pub struct ThreadingEngine {
    store: CorrelationStore,
    config: GatewayConfig,
}

impl ThreadingEngine {
    pub fn new(store: CorrelationStore, config: GatewayConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &CorrelationStore {
        &self.store
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Host notification that a ticket was permanently destroyed: its
    /// correlation records are purged so its keys can start fresh
    /// conversations.
    pub async fn on_ticket_purged(&self, ticket_id: i64) -> Result<(), GatewayError> {
        let removed = self.store.purge(ticket_id).await?;
        if removed > 0 {
            log::info!(
                "purged {} correlation rows for destroyed ticket {}",
                removed,
                ticket_id
            );
        }
        Ok(())
    }

    /// Process one email end to end: decide, perform the decision's ticket
    /// action and store writes. Disposition is left to the caller so it
    /// always happens after every write has completed.
    pub async fn process<H, D>(
        &self,
        mail: &IncomingEmail,
        host: &H,
        directory: &D,
    ) -> Result<ThreadingDecision, GatewayError>
    where
        H: TicketHost,
        D: Directory,
    {
        // Step 1: exactly-once guard.
        if self
            .store
            .is_duplicate(&mail.message_id, mail.source_id)
            .await?
        {
            log::info!(
                "email {} on source {} already processed, dropping",
                mail.message_id,
                mail.source_id
            );
            return Ok(ThreadingDecision::Duplicate);
        }

        let keys = correlation_keys(mail, self.config.use_thread_index);

        // Directive resolution is best-effort: a directory failure logs
        // and degrades to "no directive" rather than blocking the ticket.
        let directives = parse_directives(&mail.body_text);
        let requester_override = resolve_requester_override(&directives, directory)
            .unwrap_or_else(|e| {
                log::warn!("directive resolution failed: {}", e);
                None
            });

        // Step 2: does any reference chain member own a ticket already?
        let mut linked_ticket_id = None;
        if let Some(ticket_id) = self.store.find_bound(&keys, mail.source_id).await? {
            match host.ticket_status(ticket_id)? {
                Some(status) if !status.is_closed_like() => {
                    return self
                        .append_followup(mail, host, ticket_id, requester_override)
                        .await;
                }
                Some(_) => {
                    // Closed conversation: a new ticket is still created,
                    // carrying a cross-reference to the closed one.
                    log::info!(
                        "email {} references closed ticket {}, linking new ticket",
                        mail.message_id,
                        ticket_id
                    );
                    linked_ticket_id = Some(ticket_id);
                }
                None => {
                    log::warn!(
                        "correlation rows point at missing ticket {}, ignoring",
                        ticket_id
                    );
                }
            }
        }

        // Step 3: new ticket.
        self.create_ticket(mail, host, directory, &directives, keys, {
            NewTicketRequest {
                subject: mail.subject.clone(),
                body: mail.body_text.clone(),
                sender_email: mail.sender_email.clone(),
                requester_override,
                linked_ticket_id,
                source_id: mail.source_id,
            }
        })
        .await
    }

    async fn append_followup<H: TicketHost>(
        &self,
        mail: &IncomingEmail,
        host: &H,
        ticket_id: i64,
        author_override: Option<i64>,
    ) -> Result<ThreadingDecision, GatewayError> {
        host.add_followup(NewFollowupRequest {
            ticket_id,
            body: mail.body_text.clone(),
            sender_email: mail.sender_email.clone(),
            author_override,
        })?;

        // Remember this message id in case another email references it.
        self.store.reserve(&mail.message_id, mail.source_id).await?;
        self.store
            .bind(&mail.message_id, mail.source_id, ticket_id)
            .await?;

        log::info!(
            "email {} appended as followup to ticket {}",
            mail.message_id,
            ticket_id
        );
        Ok(ThreadingDecision::AppendFollowup { ticket_id })
    }

    async fn create_ticket<H, D>(
        &self,
        mail: &IncomingEmail,
        host: &H,
        directory: &D,
        directives: &crate::directives::Directives,
        mut keys: Vec<String>,
        request: NewTicketRequest,
    ) -> Result<ThreadingDecision, GatewayError>
    where
        H: TicketHost,
        D: Directory,
    {
        let linked_ticket_id = request.linked_ticket_id;

        // Reserve every key this email carries, the message id included,
        // before the ticket exists. Insert-if-absent makes a replay or a
        // concurrent email referencing the same thread harmless.
        keys.push(mail.message_id.clone());
        for key in &keys {
            self.store.reserve(key, mail.source_id).await?;
        }

        let ticket_id = host.create_ticket(request)?;

        // Retroactively bind all placeholders so every token this email
        // carried resolves to the new ticket for future replies.
        self.store
            .rebind_all(&keys, mail.source_id, ticket_id)
            .await?;

        // Watchers are best-effort, after the ticket exists.
        match resolve_watchers(directives, directory) {
            Ok(watchers) => {
                for user_id in watchers.users {
                    if let Err(e) = host.add_observer_user(ticket_id, user_id) {
                        log::warn!("failed to add observer user {}: {}", user_id, e);
                    }
                }
                for group_id in watchers.groups {
                    if let Err(e) = host.add_observer_group(ticket_id, group_id) {
                        log::warn!("failed to add observer group {}: {}", group_id, e);
                    }
                }
            }
            Err(e) => log::warn!("watcher resolution failed: {}", e),
        }

        match linked_ticket_id {
            Some(closed_ticket_id) => {
                log::info!(
                    "email {} created ticket {} linked to closed ticket {}",
                    mail.message_id,
                    ticket_id,
                    closed_ticket_id
                );
                Ok(ThreadingDecision::ReopenLink {
                    ticket_id,
                    closed_ticket_id,
                })
            }
            None => {
                log::info!("email {} created ticket {}", mail.message_id, ticket_id);
                Ok(ThreadingDecision::NewTicket { ticket_id })
            }
        }
    }

    /// Folder a decision's disposition targets.
    pub fn disposition(decision: &ThreadingDecision) -> Folder {
        match decision {
            ThreadingDecision::Duplicate => Folder::Refused,
            _ => Folder::Accepted,
        }
    }
}
