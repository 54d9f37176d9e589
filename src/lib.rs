//! mailgate — conversation threading for an email-to-ticket gateway.
//!
//! Incoming emails fetched from a mailbox are correlated to existing
//! support tickets (or used to create new ones) through the identifier
//! tokens their headers carry. The crate owns the threading decision and
//! its persistent correlation state; the host ticketing application, the
//! directory and the mailbox protocol client are consumed through the
//! trait seams in [`host`] and [`mailbox`].

pub mod config;
pub mod directives;
pub mod error;
pub mod host;
pub mod mailbox;
pub mod models;
pub mod parser;
pub mod threading;

use env_logger::Env;
use std::sync::Once;

pub use config::GatewayConfig;
pub use error::{ConnectionError, GatewayError, HostError};
pub use mailbox::{BatchSummary, MailboxProcessor};
pub use models::{IncomingEmail, ThreadingDecision, TicketStatus};
pub use threading::{CorrelationStore, ThreadingEngine};

static LOGGER: Once = Once::new();

/// Initialize env_logger once; safe to call from every trigger path.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    //! In-memory collaborators for unit and integration tests: a migrated
    //! in-memory correlation store, ticket host / directory doubles, and a
    //! scriptable mail source.

    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::error::{ConnectionError, HostError};
    use crate::host::{Directory, Lookup, NewFollowupRequest, NewTicketRequest, TicketHost};
    use crate::mailbox::{MailSession, MailSource};
    use crate::models::{IncomingEmail, TicketStatus};
    use crate::threading::CorrelationStore;

    /// Fresh migrated store on a private in-memory SQLite database.
    pub async fn memory_store() -> CorrelationStore {
        CorrelationStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store")
    }

    /// Minimal incoming email for engine-level tests.
    pub fn incoming_email(message_id: &str, references: &[&str]) -> IncomingEmail {
        IncomingEmail {
            uid: format!("uid-{}", message_id),
            message_id: message_id.to_string(),
            references: references.iter().map(|r| r.to_string()).collect(),
            thread_index: None,
            subject: "Printer broken".into(),
            sender_name: "Requester".into(),
            sender_email: "requester@example.com".into(),
            body_text: "please help".into(),
            date: None,
            source_id: 1,
        }
    }

    #[derive(Debug, Clone)]
    struct TicketRecord {
        status: TicketStatus,
        requester_override: Option<i64>,
        linked_ticket_id: Option<i64>,
        observer_users: Vec<i64>,
        observer_groups: Vec<i64>,
    }

    #[derive(Default)]
    struct HostState {
        next_id: i64,
        tickets: HashMap<i64, TicketRecord>,
        followups: Vec<NewFollowupRequest>,
    }

    /// In-memory `TicketHost`, ticket ids counting up from 100.
    #[derive(Clone)]
    pub struct MemoryTicketHost {
        state: Arc<Mutex<HostState>>,
    }

    impl MemoryTicketHost {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(HostState {
                    next_id: 100,
                    ..HostState::default()
                })),
            }
        }

        pub fn set_status(&self, ticket_id: i64, status: TicketStatus) {
            if let Some(ticket) = self.state.lock().tickets.get_mut(&ticket_id) {
                ticket.status = status;
            }
        }

        pub fn ticket_count(&self) -> usize {
            self.state.lock().tickets.len()
        }

        pub fn followups_for(&self, ticket_id: i64) -> Vec<NewFollowupRequest> {
            self.state
                .lock()
                .followups
                .iter()
                .filter(|f| f.ticket_id == ticket_id)
                .cloned()
                .collect()
        }

        pub fn all_followups(&self) -> Vec<NewFollowupRequest> {
            self.state.lock().followups.clone()
        }

        pub fn requester_override(&self, ticket_id: i64) -> Option<i64> {
            self.state
                .lock()
                .tickets
                .get(&ticket_id)
                .and_then(|t| t.requester_override)
        }

        pub fn linked_ticket(&self, ticket_id: i64) -> Option<i64> {
            self.state
                .lock()
                .tickets
                .get(&ticket_id)
                .and_then(|t| t.linked_ticket_id)
        }

        pub fn observer_users(&self, ticket_id: i64) -> Vec<i64> {
            self.state
                .lock()
                .tickets
                .get(&ticket_id)
                .map(|t| t.observer_users.clone())
                .unwrap_or_default()
        }

        pub fn observer_groups(&self, ticket_id: i64) -> Vec<i64> {
            self.state
                .lock()
                .tickets
                .get(&ticket_id)
                .map(|t| t.observer_groups.clone())
                .unwrap_or_default()
        }
    }

    impl TicketHost for MemoryTicketHost {
        fn ticket_status(&self, ticket_id: i64) -> Result<Option<TicketStatus>, HostError> {
            Ok(self.state.lock().tickets.get(&ticket_id).map(|t| t.status))
        }

        fn create_ticket(&self, req: NewTicketRequest) -> Result<i64, HostError> {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.tickets.insert(
                id,
                TicketRecord {
                    status: TicketStatus::New,
                    requester_override: req.requester_override,
                    linked_ticket_id: req.linked_ticket_id,
                    observer_users: Vec::new(),
                    observer_groups: Vec::new(),
                },
            );
            Ok(id)
        }

        fn add_followup(&self, req: NewFollowupRequest) -> Result<i64, HostError> {
            let mut state = self.state.lock();
            if !state.tickets.contains_key(&req.ticket_id) {
                return Err(HostError(format!("no such ticket {}", req.ticket_id)));
            }
            state.followups.push(req);
            Ok(state.followups.len() as i64)
        }

        fn add_observer_user(&self, ticket_id: i64, user_id: i64) -> Result<(), HostError> {
            let mut state = self.state.lock();
            let ticket = state
                .tickets
                .get_mut(&ticket_id)
                .ok_or_else(|| HostError(format!("no such ticket {}", ticket_id)))?;
            if !ticket.observer_users.contains(&user_id) {
                ticket.observer_users.push(user_id);
            }
            Ok(())
        }

        fn add_observer_group(&self, ticket_id: i64, group_id: i64) -> Result<(), HostError> {
            let mut state = self.state.lock();
            let ticket = state
                .tickets
                .get_mut(&ticket_id)
                .ok_or_else(|| HostError(format!("no such ticket {}", ticket_id)))?;
            if !ticket.observer_groups.contains(&group_id) {
                ticket.observer_groups.push(group_id);
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone)]
    struct DirectoryUser {
        id: i64,
        last: String,
        first: String,
        email: String,
    }

    #[derive(Default)]
    struct DirectoryState {
        next_id: i64,
        users: Vec<DirectoryUser>,
        groups: Vec<(i64, String)>,
    }

    /// In-memory `Directory`; every user counts as active, non-deleted and
    /// carrying a default email.
    #[derive(Clone)]
    pub struct MemoryDirectory {
        state: Arc<Mutex<DirectoryState>>,
    }

    impl MemoryDirectory {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(DirectoryState {
                    next_id: 1,
                    ..DirectoryState::default()
                })),
            }
        }

        pub fn add_user(&self, last: &str, first: &str, email: &str) -> i64 {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.users.push(DirectoryUser {
                id,
                last: last.to_string(),
                first: first.to_string(),
                email: email.to_lowercase(),
            });
            id
        }

        pub fn add_group(&self, name: &str) -> i64 {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.groups.push((id, name.to_string()));
            id
        }
    }

    fn to_lookup(ids: Vec<i64>) -> Lookup {
        match ids.as_slice() {
            [] => Lookup::NotFound,
            [id] => Lookup::Unique(*id),
            _ => Lookup::Ambiguous,
        }
    }

    impl Directory for MemoryDirectory {
        fn user_by_email(&self, email: &str) -> Result<Lookup, HostError> {
            let ids = self
                .state
                .lock()
                .users
                .iter()
                .filter(|u| u.email == email.to_lowercase())
                .map(|u| u.id)
                .collect();
            Ok(to_lookup(ids))
        }

        fn user_by_name(&self, last: &str, first: &str) -> Result<Lookup, HostError> {
            let ids = self
                .state
                .lock()
                .users
                .iter()
                .filter(|u| u.last == last && u.first == first)
                .map(|u| u.id)
                .collect();
            Ok(to_lookup(ids))
        }

        fn group_by_name(&self, name: &str) -> Result<Lookup, HostError> {
            let ids = self
                .state
                .lock()
                .groups
                .iter()
                .filter(|(_, n)| n == name)
                .map(|(id, _)| *id)
                .collect();
            Ok(to_lookup(ids))
        }
    }

    #[derive(Default)]
    struct MailboxState {
        /// uid → raw message, in insertion order.
        messages: Vec<(String, Vec<u8>)>,
        /// uid → folder name (None = deleted).
        disposed: HashMap<String, Option<String>>,
        fail_connect: bool,
        closed_sessions: u32,
    }

    /// Scriptable in-memory `MailSource`.
    #[derive(Clone)]
    pub struct MemoryMailSource {
        state: Arc<Mutex<MailboxState>>,
    }

    impl MemoryMailSource {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(MailboxState::default())),
            }
        }

        pub fn deliver(&self, uid: &str, raw: &[u8]) {
            self.state
                .lock()
                .messages
                .push((uid.to_string(), raw.to_vec()));
        }

        pub fn fail_connections(&self, fail: bool) {
            self.state.lock().fail_connect = fail;
        }

        /// Folder the message was disposed to: `None` = still in the
        /// inbox, `Some(None)` = deleted, `Some(Some(folder))` = moved.
        pub fn disposition_of(&self, uid: &str) -> Option<Option<String>> {
            self.state.lock().disposed.get(uid).cloned()
        }

        pub fn sessions_closed(&self) -> u32 {
            self.state.lock().closed_sessions
        }
    }

    pub struct MemorySession {
        state: Arc<Mutex<MailboxState>>,
    }

    impl MailSource for MemoryMailSource {
        type Session = MemorySession;

        fn connect(&self) -> Result<MemorySession, ConnectionError> {
            if self.state.lock().fail_connect {
                return Err(ConnectionError("connection refused".into()));
            }
            Ok(MemorySession {
                state: Arc::clone(&self.state),
            })
        }
    }

    impl MailSession for MemorySession {
        fn unprocessed(&mut self) -> Result<Vec<String>, ConnectionError> {
            let state = self.state.lock();
            Ok(state
                .messages
                .iter()
                .filter(|(uid, _)| !state.disposed.contains_key(uid))
                .map(|(uid, _)| uid.clone())
                .collect())
        }

        fn fetch(&mut self, uid: &str) -> Result<Vec<u8>, ConnectionError> {
            self.state
                .lock()
                .messages
                .iter()
                .find(|(u, _)| u == uid)
                .map(|(_, raw)| raw.clone())
                .ok_or_else(|| ConnectionError(format!("no such message {}", uid)))
        }

        fn dispose(&mut self, uid: &str, folder: Option<&str>) -> Result<(), ConnectionError> {
            self.state
                .lock()
                .disposed
                .insert(uid.to_string(), folder.map(|f| f.to_string()));
            Ok(())
        }

        fn close(&mut self) -> Result<(), ConnectionError> {
            self.state.lock().closed_sessions += 1;
            Ok(())
        }
    }
}
