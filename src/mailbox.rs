//! Mail source boundary and the batch runner.
//!
//! The gateway talks to the mailbox through two blocking traits: a
//! [`MailSource`] that opens sessions and a [`MailSession`] that fetches
//! and disposes messages. Two trigger paths share this code: an
//! interactive run passes its already-open session in, a scheduled run
//! lets the runner open and close its own. Both reach the same engine and
//! store, so correctness does not depend on the trigger path.
//!
//! Disposition ordering: a message is moved/deleted only after every
//! correlation-store write for it has completed. A crash in between
//! re-delivers the message on the next run, where the duplicate check
//! drops it.

use crate::error::{ConnectionError, GatewayError};
use crate::host::{Directory, TicketHost};
use crate::models::{Folder, ThreadingDecision};
use crate::parser::parse_incoming;
use crate::threading::ThreadingEngine;

/// A configured mail source the gateway can open sessions against.
pub trait MailSource {
    type Session: MailSession;

    /// Open a session. Unreachable source or bad credentials fail here and
    /// abort the batch before any state is touched.
    fn connect(&self) -> Result<Self::Session, ConnectionError>;
}

/// An open mailbox session. All calls are blocking network I/O.
pub trait MailSession {
    /// UIDs of the messages awaiting processing, in mailbox order.
    fn unprocessed(&mut self) -> Result<Vec<String>, ConnectionError>;

    /// Fetch one raw RFC 5322 message by UID.
    fn fetch(&mut self, uid: &str) -> Result<Vec<u8>, ConnectionError>;

    /// Move a processed message to `folder`, or delete it when no folder
    /// is configured (POP sources have only INBOX).
    fn dispose(&mut self, uid: &str, folder: Option<&str>) -> Result<(), ConnectionError>;

    /// Release the session. Owned sessions are closed on every exit path.
    fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Counters for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub created: u32,
    pub followups: u32,
    pub reopened: u32,
    pub duplicates: u32,
    pub refused: u32,
}

/// Runs batches of incoming mail through the threading engine.
pub struct MailboxProcessor<'a> {
    engine: &'a ThreadingEngine,
}

impl<'a> MailboxProcessor<'a> {
    pub fn new(engine: &'a ThreadingEngine) -> Self {
        Self { engine }
    }

    /// Process every unprocessed message of `source`.
    ///
    /// `session` is the interactive path's already-open session; when None
    /// (scheduled path) the runner opens its own and closes it before
    /// returning, on success and on abort alike. A `ConnectionError`
    /// aborts the whole batch with no partial correlation writes for the
    /// failed message.
    pub async fn run_batch<S, H, D>(
        &self,
        source: &S,
        session: Option<&mut S::Session>,
        host: &H,
        directory: &D,
    ) -> Result<BatchSummary, GatewayError>
    where
        S: MailSource,
        H: TicketHost,
        D: Directory,
    {
        match session {
            Some(session) => self.drain_session::<S, _, _>(session, host, directory).await,
            None => {
                let mut owned = source.connect()?;
                let result = self.drain_session::<S, _, _>(&mut owned, host, directory).await;
                if let Err(e) = owned.close() {
                    log::warn!("failed to close mailbox session: {}", e);
                }
                result
            }
        }
    }

    /// Scheduled-path wrapper: errors are logged, never surfaced. The
    /// interactive path calls `run_batch` directly so the operator sees
    /// connection failures.
    pub async fn poll<S, H, D>(&self, source: &S, host: &H, directory: &D) -> BatchSummary
    where
        S: MailSource,
        H: TicketHost,
        D: Directory,
    {
        match self.run_batch(source, None, host, directory).await {
            Ok(summary) => {
                log::info!(
                    "poll complete: {} created, {} followups, {} reopened, {} duplicates, {} refused",
                    summary.created,
                    summary.followups,
                    summary.reopened,
                    summary.duplicates,
                    summary.refused
                );
                summary
            }
            Err(e) => {
                log::error!("scheduled poll failed: {}", e);
                BatchSummary::default()
            }
        }
    }

    async fn drain_session<S, H, D>(
        &self,
        session: &mut S::Session,
        host: &H,
        directory: &D,
    ) -> Result<BatchSummary, GatewayError>
    where
        S: MailSource,
        H: TicketHost,
        D: Directory,
    {
        let config = self.engine.config();
        let mut summary = BatchSummary::default();

        for uid in session.unprocessed()? {
            let raw = session.fetch(&uid)?;

            let mail = match parse_incoming(&raw, &uid, config.source_id) {
                Ok(mail) => mail,
                Err(e) => {
                    // Unprocessable mail is refused, never retried forever.
                    log::warn!("refusing unparseable message {}: {}", uid, e);
                    session.dispose(&uid, config.folder_name(Folder::Refused))?;
                    summary.refused += 1;
                    continue;
                }
            };

            let decision = self.engine.process(&mail, host, directory).await?;

            match decision {
                ThreadingDecision::Duplicate => summary.duplicates += 1,
                ThreadingDecision::AppendFollowup { .. } => summary.followups += 1,
                ThreadingDecision::ReopenLink { .. } => summary.reopened += 1,
                ThreadingDecision::NewTicket { .. } => summary.created += 1,
            }

            // All store writes for this message are complete; now, and
            // only now, move it out of the inbox.
            let folder = ThreadingEngine::disposition(&decision);
            session.dispose(&uid, config.folder_name(folder))?;
        }

        Ok(summary)
    }
}
