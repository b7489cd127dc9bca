//! `PostgreSQL`-backed outbox.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE outbox (
//!     id                  UUID PRIMARY KEY,
//!     sequence            BIGINT GENERATED ALWAYS AS IDENTITY,
//!     message_type        TEXT NOT NULL,
//!     content             TEXT NOT NULL,
//!     error               TEXT,
//!     occurred_on_utc     TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
//!     processed_date_utc  TIMESTAMPTZ,
//!     claimed_by          TEXT,
//!     claimed_until       TIMESTAMPTZ
//! );
//!
//! CREATE TABLE outbox_consumer (
//!     outbox_message_id   UUID NOT NULL REFERENCES outbox (id) ON DELETE CASCADE,
//!     name                TEXT NOT NULL,
//!     processed_on_utc    TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (outbox_message_id, name)
//! );
//! ```
//!
//! Size limits are enforced by [`MessageLimits`] before insert, not by the
//! column types.
//!
//! # Claims
//!
//! [`claim_pending`](MessageStore::claim_pending) is a single
//! `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)` statement. It commits on
//! its own, so row locks are gone by the time consumers run; the
//! `claimed_by`/`claimed_until` lease is what keeps other dispatchers away, and
//! ledger rows written during dispatch commit independently of the claim.
//! [`renew_claim`](MessageStore::renew_claim) only extends a lease that is still
//! held and unexpired, so a dispatcher can detect that it lost a message.

use chrono::{DateTime, Utc};
use composable_outbox_core::store::Result;
use composable_outbox_core::{
    ClaimRequest, ConsumerLedger, ConsumerName, MessageId, MessageLimits, MessageStore,
    NewOutboxMessage, OutboxError, OutboxMessage, OutboxWriter,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use std::time::Duration;

const MESSAGE_COLUMNS: &str =
    "id, sequence, message_type, content, occurred_on_utc, processed_date_utc, error";

/// `PostgreSQL` implementation of the Message Store, Consumer Ledger and Outbox Writer.
///
/// # Example
///
/// ```ignore
/// use composable_outbox_postgres::PostgresOutbox;
///
/// let outbox = PostgresOutbox::connect("postgres://localhost/app").await?;
/// outbox.migrate().await?;
///
/// let mut tx = outbox.begin().await?;
/// sqlx::query("INSERT INTO articles (id, title) VALUES ($1, $2)")
///     .bind(article_id)
///     .bind(&title)
///     .execute(&mut *tx)
///     .await?;
/// outbox
///     .append(&mut tx, NewOutboxMessage::json("ArticlePublished", &event)?)
///     .await?;
/// tx.commit().await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresOutbox {
    pool: PgPool,
    limits: MessageLimits,
}

impl PostgresOutbox {
    /// Create an outbox using an existing connection pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            limits: MessageLimits::default(),
        }
    }

    /// Connect to `database_url` with a dedicated pool.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| OutboxError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self::from_pool(pool))
    }

    /// Replace the size limits enforced on append.
    #[must_use]
    pub const fn with_limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Create the `outbox` and `outbox_consumer` tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Begin a domain transaction to append messages through.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if no connection is available.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(database_error)
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, id: MessageId) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM outbox WHERE id = $1)")
            .bind(id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(database_error)?;
        Ok(exists)
    }

    async fn ensure_exists(&self, id: MessageId) -> Result<()> {
        if self.exists(id).await? {
            Ok(())
        } else {
            Err(OutboxError::MessageNotFound(id))
        }
    }
}

fn database_error(e: sqlx::Error) -> OutboxError {
    OutboxError::Database(e.to_string())
}

fn row_to_message(row: &PgRow) -> Result<OutboxMessage> {
    Ok(OutboxMessage {
        id: MessageId::from_uuid(row.try_get("id").map_err(database_error)?),
        message_type: row.try_get("message_type").map_err(database_error)?,
        content: row.try_get("content").map_err(database_error)?,
        occurred_on_utc: row.try_get("occurred_on_utc").map_err(database_error)?,
        processed_date_utc: row.try_get("processed_date_utc").map_err(database_error)?,
        error: row.try_get("error").map_err(database_error)?,
    })
}

fn rows_to_messages(rows: &[PgRow]) -> Result<Vec<OutboxMessage>> {
    rows.iter().map(row_to_message).collect()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl OutboxWriter for PostgresOutbox {
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn append(
        &self,
        tx: &mut sqlx::Transaction<'static, Postgres>,
        message: NewOutboxMessage,
    ) -> Result<MessageId> {
        self.limits.validate_message(&message)?;

        let id = MessageId::new();
        sqlx::query("INSERT INTO outbox (id, message_type, content) VALUES ($1, $2, $3)")
            .bind(id.as_uuid())
            .bind(&message.message_type)
            .bind(&message.content)
            .execute(&mut **tx)
            .await
            .map_err(database_error)?;

        tracing::debug!(message_id = %id, message_type = %message.message_type, "Outbox message appended");
        metrics::counter!("outbox_messages_appended_total", "message_type" => message.message_type)
            .increment(1);

        Ok(id)
    }
}

impl MessageStore for PostgresOutbox {
    async fn fetch_pending(&self, limit: usize, grace: Duration) -> Result<Vec<OutboxMessage>> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM outbox
             WHERE processed_date_utc IS NULL
               AND occurred_on_utc <= now() - make_interval(secs => $1)
             ORDER BY occurred_on_utc, sequence
             LIMIT $2"
        );

        let rows = sqlx::query(&query)
            .bind(grace.as_secs_f64())
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(database_error)?;

        rows_to_messages(&rows)
    }

    async fn claim_pending(&self, request: &ClaimRequest) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r"
            UPDATE outbox o
            SET claimed_by = $1,
                claimed_until = now() + make_interval(secs => $2)
            FROM (
                SELECT id
                FROM outbox
                WHERE processed_date_utc IS NULL
                  AND occurred_on_utc <= now() - make_interval(secs => $3)
                  AND (claimed_until IS NULL OR claimed_until < now())
                ORDER BY occurred_on_utc, sequence
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            ) picked
            WHERE o.id = picked.id
            RETURNING o.id, o.sequence, o.message_type, o.content,
                      o.occurred_on_utc, o.processed_date_utc, o.error
            ",
        )
        .bind(&request.claimant)
        .bind(request.lease.as_secs_f64())
        .bind(request.grace.as_secs_f64())
        .bind(sql_limit(request.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        // RETURNING does not preserve the subquery's order
        let mut claimed = rows
            .iter()
            .map(|row| {
                let sequence: i64 = row.try_get("sequence").map_err(database_error)?;
                Ok((sequence, row_to_message(row)?))
            })
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by_key(|(sequence, message)| (message.occurred_on_utc, *sequence));

        if !claimed.is_empty() {
            tracing::debug!(claimant = %request.claimant, count = claimed.len(), "Claimed outbox messages");
        }

        Ok(claimed.into_iter().map(|(_, message)| message).collect())
    }

    async fn release_claim(&self, id: MessageId, claimant: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE outbox
            SET claimed_by = NULL, claimed_until = NULL
            WHERE id = $1 AND claimed_by = $2
            ",
        )
        .bind(id.as_uuid())
        .bind(claimant)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(())
    }

    async fn renew_claim(&self, id: MessageId, claimant: &str, lease: Duration) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET claimed_until = now() + make_interval(secs => $3)
            WHERE id = $1
              AND claimed_by = $2
              AND claimed_until >= now()
              AND processed_date_utc IS NULL
            ",
        )
        .bind(id.as_uuid())
        .bind(claimant)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET processed_date_utc = now(), claimed_by = NULL, claimed_until = NULL
            WHERE id = $1 AND processed_date_utc IS NULL
            ",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_exists(id).await?;
        Ok(false)
    }

    async fn record_error(&self, id: MessageId, error: &str) -> Result<()> {
        let result = sqlx::query("UPDATE outbox SET error = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM outbox WHERE id = $1");

        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn count_pending(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE processed_date_utc IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(database_error)?;

        u64::try_from(count).map_err(|e| OutboxError::Database(e.to_string()))
    }

    async fn pending_older_than(&self, age: Duration, limit: usize) -> Result<Vec<OutboxMessage>> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM outbox
             WHERE processed_date_utc IS NULL
               AND occurred_on_utc < now() - make_interval(secs => $1)
             ORDER BY occurred_on_utc, sequence
             LIMIT $2"
        );

        let rows = sqlx::query(&query)
            .bind(age.as_secs_f64())
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(database_error)?;

        rows_to_messages(&rows)
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM outbox WHERE processed_date_utc < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, %cutoff, "Purged processed outbox messages");
        }
        Ok(purged)
    }
}

impl ConsumerLedger for PostgresOutbox {
    async fn has_succeeded(&self, id: MessageId, consumer: &ConsumerName) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM outbox_consumer WHERE outbox_message_id = $1 AND name = $2)",
        )
        .bind(id.as_uuid())
        .bind(consumer.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(exists)
    }

    async fn record_outcome(&self, id: MessageId, consumer: &ConsumerName, succeeded: bool) -> Result<bool> {
        if !succeeded {
            self.ensure_exists(id).await?;
            return Ok(false);
        }

        let result = sqlx::query(
            r"
            INSERT INTO outbox_consumer (outbox_message_id, name)
            VALUES ($1, $2)
            ON CONFLICT (outbox_message_id, name) DO NOTHING
            ",
        )
        .bind(id.as_uuid())
        .bind(consumer.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => OutboxError::MessageNotFound(id),
            _ => database_error(e),
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn succeeded_consumers(&self, id: MessageId) -> Result<Vec<ConsumerName>> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM outbox_consumer WHERE outbox_message_id = $1 ORDER BY name",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        names.into_iter().map(|(name,)| ConsumerName::new(name)).collect()
    }

    async fn all_consumers_succeeded(&self, id: MessageId, required: &[ConsumerName]) -> Result<bool> {
        let mut names: Vec<&str> = required.iter().map(ConsumerName::as_str).collect();
        names.sort_unstable();
        names.dedup();
        if names.is_empty() {
            return Ok(true);
        }

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM outbox_consumer WHERE outbox_message_id = $1 AND name = ANY($2)",
        )
        .bind(id.as_uuid())
        .bind(&names[..])
        .fetch_one(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(usize::try_from(count).is_ok_and(|count| count == names.len()))
    }
}
