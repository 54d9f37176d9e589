//! Error taxonomy for the gateway.
//!
//! Recoverable conditions (duplicate key on reserve, ambiguous directive,
//! malformed reference) never reach these types: they are handled and
//! logged where they occur. What surfaces here is fatal for the current
//! email batch.

use thiserror::Error;

/// Mail source unreachable or the session died mid-run. Fatal for the
/// current batch; nothing is written and the run is retried on the next
/// scheduled invocation.
#[derive(Debug, Error)]
#[error("mail source connection failed: {0}")]
pub struct ConnectionError(pub String);

/// The host ticketing application rejected a call (ticket lookup, ticket
/// or followup creation, watcher mutation).
#[derive(Debug, Error)]
#[error("ticket host error: {0}")]
pub struct HostError(pub String);

/// Top-level error surface of the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("correlation store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("correlation store migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Host(#[from] HostError),
}
