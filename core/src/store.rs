//! Storage abstractions: Message Store, Consumer Ledger and Outbox Writer.
//!
//! # Design
//!
//! The three traits are deliberately separate even though every implementation
//! backs them with the same database:
//!
//! - [`OutboxWriter`] is used by domain code, inside the domain transaction
//! - [`MessageStore`] and [`ConsumerLedger`] are used by the dispatcher
//!
//! # Implementations
//!
//! - `PostgresOutbox` (in `composable-outbox-postgres`): Production implementation
//! - `InMemoryOutbox` (in `composable-outbox-testing`): Fast, deterministic testing
//!
//! # Claims
//!
//! Several dispatchers may poll the same store. [`MessageStore::claim_pending`] must
//! hand each pending message to at most one claimant at a time; the claim is a
//! lease that expires, so a crashed dispatcher's messages become claimable again.

use crate::consumer::ConsumerName;
use crate::message::{MessageId, NewOutboxMessage, OutboxMessage};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during outbox storage operations.
///
/// Storage failures are fatal to the current operation and are never retried
/// by the store itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// Database connection, query or constraint failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Payload serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A value exceeds its configured [`MessageLimits`](crate::message::MessageLimits).
    #[error("{field} is {len} characters long, limit is {max}")]
    LimitExceeded {
        /// Field that was too long
        field: &'static str,
        /// Actual length in characters
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// The message (or consumer name) is malformed.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// No message with this id exists.
    #[error("Outbox message not found: {0}")]
    MessageNotFound(MessageId),
}

/// Result type for outbox storage operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Parameters of a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Identity of the claiming dispatcher
    pub claimant: String,
    /// Maximum number of messages to claim
    pub limit: usize,
    /// Only messages older than this are eligible
    pub grace: Duration,
    /// How long the claim is held before other dispatchers may take over
    pub lease: Duration,
}

/// Appends messages inside a transaction owned by the caller.
///
/// The appended message becomes visible if and only if the caller's transaction
/// commits. Nothing is delivered synchronously. If `append` fails the caller must
/// roll back, so no domain state is committed without its event.
///
/// # Example
///
/// ```ignore
/// let mut tx = pool.begin().await?;
/// sqlx::query("INSERT INTO articles ...").execute(&mut *tx).await?;
/// outbox.append(&mut tx, NewOutboxMessage::json("ArticlePublished", &event)?).await?;
/// tx.commit().await?;
/// ```
pub trait OutboxWriter: Send + Sync {
    /// The transaction type domain code writes through.
    type Transaction: Send;

    /// Append `message` within `tx`, returning its new id.
    ///
    /// # Errors
    ///
    /// - `LimitExceeded` / `InvalidMessage`: the message failed validation
    /// - `Database`: the insert failed
    fn append(
        &self,
        tx: &mut Self::Transaction,
        message: NewOutboxMessage,
    ) -> impl Future<Output = Result<MessageId>> + Send;
}

/// Query and update surface over outbox messages.
pub trait MessageStore: Send + Sync {
    /// Pending messages older than `grace`, oldest first, at most `limit`.
    ///
    /// A plain read: nothing is claimed.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    fn fetch_pending(
        &self,
        limit: usize,
        grace: Duration,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>>> + Send;

    /// Atomically claim up to `request.limit` pending, unclaimed (or lease-expired)
    /// messages older than `request.grace`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the claim fails.
    fn claim_pending(
        &self,
        request: &ClaimRequest,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>>> + Send;

    /// Drop `claimant`'s claim on `id`. A no-op if the claim is held by someone else.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the update fails.
    fn release_claim(
        &self,
        id: MessageId,
        claimant: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Extend `claimant`'s claim on `id` to `lease` from now.
    ///
    /// Returns `false`, changing nothing, unless `claimant` still holds an unexpired
    /// claim on a pending message. A dispatcher must renew before each consumer
    /// invocation and give up the message when renewal fails.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the update fails.
    fn renew_claim(
        &self,
        id: MessageId,
        claimant: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Set `processed_date_utc` to now. Idempotent: returns `false` if it was already set.
    ///
    /// # Errors
    ///
    /// - `MessageNotFound`: no such message
    /// - `Database`: the update failed
    fn mark_processed(&self, id: MessageId) -> impl Future<Output = Result<bool>> + Send;

    /// Overwrite the message's `error`. Does not touch `processed_date_utc`.
    ///
    /// # Errors
    ///
    /// - `MessageNotFound`: no such message
    /// - `Database`: the update failed
    fn record_error(
        &self,
        id: MessageId,
        error: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Load one message.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    fn get(&self, id: MessageId) -> impl Future<Output = Result<Option<OutboxMessage>>> + Send;

    /// Number of pending messages.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    fn count_pending(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Pending messages that occurred more than `age` ago, oldest first.
    /// Intended for alerting on stuck messages.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    fn pending_older_than(
        &self,
        age: Duration,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>>> + Send;

    /// Delete processed messages (and, by cascade, their ledger rows) processed
    /// before `cutoff`. Returns the number of messages deleted.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the delete fails.
    fn purge_processed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64>> + Send;
}

/// Per-`(message, consumer)` success ledger.
///
/// At most one row exists per pair. Failures write nothing, which leaves the pair
/// eligible for another attempt on the next poll.
pub trait ConsumerLedger: Send + Sync {
    /// Whether `consumer` has a success row for `id`.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    fn has_succeeded(
        &self,
        id: MessageId,
        consumer: &ConsumerName,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Record the outcome of one delivery attempt.
    ///
    /// A success inserts the ledger row once and returns `true`; recording the same
    /// success again is a no-op returning `false`. A failure writes nothing and
    /// returns `false`.
    ///
    /// # Errors
    ///
    /// - `MessageNotFound`: no such message
    /// - `Database`: the insert failed
    fn record_outcome(
        &self,
        id: MessageId,
        consumer: &ConsumerName,
        succeeded: bool,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Every consumer with a success row for `id`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    fn succeeded_consumers(
        &self,
        id: MessageId,
    ) -> impl Future<Output = Result<Vec<ConsumerName>>> + Send;

    /// True iff every name in `required` has a success row for `id`
    /// (vacuously true for an empty set).
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    fn all_consumers_succeeded(
        &self,
        id: MessageId,
        required: &[ConsumerName],
    ) -> impl Future<Output = Result<bool>> + Send {
        async move {
            if required.is_empty() {
                return Ok(true);
            }
            let succeeded = self.succeeded_consumers(id).await?;
            Ok(required.iter().all(|name| succeeded.contains(name)))
        }
    }
}
