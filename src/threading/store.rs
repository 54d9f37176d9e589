//! Persistent correlation store.
//!
//! Maps `(correlation key, source_id)` pairs to the ticket owning the
//! conversation. A row with `ticket_id = 0` is a placeholder reserved
//! before the owning ticket exists; placeholders are bound exactly once
//! when the real ticket id becomes known, and purged when the owning
//! ticket is permanently destroyed.
//!
//! All inserts are insert-if-absent: two invocations racing on the same
//! key resolve through the unique index, never through table locks, and a
//! lost race is an expected no-op.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;

use crate::error::GatewayError;
use crate::models::CorrelationRecord;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Handle on the correlation records table.
#[derive(Debug, Clone)]
pub struct CorrelationStore {
    pool: SqlitePool,
}

impl CorrelationStore {
    /// Open the store at the given sqlx URL and apply pending migrations.
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        log::debug!("correlation store ready at {}", url);
        Ok(Self { pool })
    }

    /// Wrap an existing pool; migrations are still applied.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, GatewayError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a placeholder row for `(key, source_id)` if absent.
    ///
    /// Idempotent: an existing row — placeholder or bound — is left
    /// untouched, so replays and concurrent reservations of the same key
    /// are harmless.
    pub async fn reserve(&self, key: &str, source_id: i64) -> Result<(), GatewayError> {
        sqlx::query(
            r#"INSERT INTO correlation_records (message_id, source_id, ticket_id)
               VALUES (?, ?, 0)
               ON CONFLICT (message_id, source_id) DO NOTHING"#,
        )
        .bind(key)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recently bound ticket among the given keys for a source.
    ///
    /// When several keys resolve to different tickets the numerically
    /// highest ticket id wins, favoring the newest branch of a forwarded
    /// thread.
    pub async fn find_bound(
        &self,
        keys: &[String],
        source_id: i64,
    ) -> Result<Option<i64>, GatewayError> {
        if keys.is_empty() {
            return Ok(None);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT ticket_id FROM correlation_records WHERE ticket_id <> 0 AND source_id = ",
        );
        builder.push_bind(source_id);
        builder.push(" AND message_id IN (");
        let mut separated = builder.separated(", ");
        for key in keys {
            separated.push_bind(key);
        }
        separated.push_unseparated(") ORDER BY ticket_id DESC LIMIT 1");

        let row: Option<(i64,)> = builder.build_query_as().fetch_optional(&self.pool).await?;
        Ok(row.map(|(ticket_id,)| ticket_id))
    }

    /// True if this exact key already produced a ticket or followup.
    pub async fn is_duplicate(&self, message_id: &str, source_id: i64) -> Result<bool, GatewayError> {
        let exists: (bool,) = sqlx::query_as(
            r#"SELECT EXISTS(
                   SELECT 1 FROM correlation_records
                   WHERE message_id = ? AND source_id = ? AND ticket_id <> 0
               )"#,
        )
        .bind(message_id)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists.0)
    }

    /// Bind a key to a ticket, creating the row when absent.
    ///
    /// A row already bound to a real ticket is never overwritten: the
    /// 0 → id transition happens at most once.
    pub async fn bind(
        &self,
        key: &str,
        source_id: i64,
        ticket_id: i64,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"INSERT INTO correlation_records (message_id, source_id, ticket_id)
               VALUES (?, ?, ?)
               ON CONFLICT (message_id, source_id) DO UPDATE SET ticket_id = excluded.ticket_id
               WHERE correlation_records.ticket_id = 0"#,
        )
        .bind(key)
        .bind(source_id)
        .bind(ticket_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bind every still-unbound placeholder among `keys` to `ticket_id`.
    ///
    /// Called once the new ticket's id is known, so every reference token
    /// the email carried resolves directly for future replies.
    pub async fn rebind_all(
        &self,
        keys: &[String],
        source_id: i64,
        ticket_id: i64,
    ) -> Result<u64, GatewayError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE correlation_records SET ticket_id = ");
        builder.push_bind(ticket_id);
        builder.push(" WHERE ticket_id = 0 AND source_id = ");
        builder.push_bind(source_id);
        builder.push(" AND message_id IN (");
        let mut separated = builder.separated(", ");
        for key in keys {
            separated.push_bind(key);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        log::debug!(
            "bound {} correlation rows to ticket {}",
            result.rows_affected(),
            ticket_id
        );
        Ok(result.rows_affected())
    }

    /// Delete every record bound to a ticket. Invoked from the host's
    /// ticket-purge notification when a ticket is permanently destroyed.
    pub async fn purge(&self, ticket_id: i64) -> Result<u64, GatewayError> {
        if ticket_id == 0 {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM correlation_records WHERE ticket_id = ?")
            .bind(ticket_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// All records bound to a ticket, ordered by insertion.
    pub async fn records_for_ticket(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<CorrelationRecord>, GatewayError> {
        let records = sqlx::query_as::<_, CorrelationRecord>(
            r#"SELECT id, message_id, source_id, ticket_id
               FROM correlation_records
               WHERE ticket_id = ?
               ORDER BY id"#,
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
