//! In-memory outbox storage.
//!
//! [`InMemoryOutbox`] implements the Message Store, the Consumer Ledger and the
//! Outbox Writer over a single mutex, which makes every claim atomic and lets
//! tests run several dispatchers against one store.

use chrono::{DateTime, Utc};
use composable_outbox_core::environment::{Clock, SystemClock};
use composable_outbox_core::store::Result;
use composable_outbox_core::{
    ClaimRequest, ConsumerLedger, ConsumerName, MessageId, MessageLimits, MessageStore,
    NewOutboxMessage, OutboxError, OutboxMessage, OutboxWriter,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Row {
    message: OutboxMessage,
    sequence: u64,
    claimed_by: Option<String>,
    claimed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    rows: HashMap<MessageId, Row>,
    ledger: HashMap<MessageId, BTreeSet<ConsumerName>>,
    next_sequence: u64,
}

impl State {
    fn pending_sorted(&self, occurred_before: DateTime<Utc>) -> Vec<&Row> {
        let mut rows: Vec<&Row> = self
            .rows
            .values()
            .filter(|row| row.message.is_pending() && row.message.occurred_on_utc <= occurred_before)
            .collect();
        rows.sort_by_key(|row| (row.message.occurred_on_utc, row.sequence));
        rows
    }
}

/// A unit of work against an [`InMemoryOutbox`].
///
/// Appended messages are staged until [`InMemoryOutbox::commit`]; dropping the
/// transaction (or calling [`InMemoryOutbox::rollback`]) discards them.
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    staged: Vec<OutboxMessage>,
}

impl InMemoryTransaction {
    /// Number of messages staged so far.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

/// In-memory outbox for fast, deterministic testing.
///
/// Clones share storage, so a "restarted" dispatcher can be given a clone of the
/// store the previous one used.
///
/// # Example
///
/// ```
/// use composable_outbox_testing::InMemoryOutbox;
/// use composable_outbox_core::{MessageStore, NewOutboxMessage, OutboxWriter};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let outbox = InMemoryOutbox::new();
///
/// let mut tx = outbox.begin();
/// outbox.append(&mut tx, NewOutboxMessage::new("ArticlePublished", "{}")).await?;
/// outbox.commit(tx);
///
/// assert_eq!(outbox.count_pending().await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    limits: MessageLimits,
}

impl std::fmt::Debug for InMemoryOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutbox")
            .field("messages", &self.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutbox {
    /// Create an empty outbox using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create an empty outbox stamping times from `clock`.
    #[must_use]
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock: Arc::new(clock),
            limits: MessageLimits::default(),
        }
    }

    /// Replace the size limits enforced by [`OutboxWriter::append`].
    #[must_use]
    pub const fn with_limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Begin a transaction.
    #[must_use]
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction::default()
    }

    /// Make every message staged in `tx` visible, in append order.
    pub fn commit(&self, tx: InMemoryTransaction) {
        let mut state = self.state.lock().unwrap();
        for message in tx.staged {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.rows.insert(
                message.id,
                Row {
                    message,
                    sequence,
                    claimed_by: None,
                    claimed_until: None,
                },
            );
        }
    }

    /// Discard every message staged in `tx`.
    pub fn rollback(&self, tx: InMemoryTransaction) {
        drop(tx);
    }

    /// Number of committed messages (pending or processed).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    /// Whether no message has been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ledger rows across all messages.
    #[must_use]
    pub fn ledger_len(&self) -> usize {
        self.state.lock().unwrap().ledger.values().map(BTreeSet::len).sum()
    }

    /// Current claimant of `id`, if any (expired leases included).
    #[must_use]
    pub fn claimed_by(&self, id: MessageId) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .rows
            .get(&id)
            .and_then(|row| row.claimed_by.clone())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn minus(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
}

fn plus(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| now.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl OutboxWriter for InMemoryOutbox {
    type Transaction = InMemoryTransaction;

    async fn append(&self, tx: &mut InMemoryTransaction, message: NewOutboxMessage) -> Result<MessageId> {
        self.limits.validate_message(&message)?;

        let id = MessageId::new();
        tx.staged.push(OutboxMessage {
            id,
            message_type: message.message_type,
            content: message.content,
            occurred_on_utc: self.now(),
            processed_date_utc: None,
            error: None,
        });
        Ok(id)
    }
}

impl MessageStore for InMemoryOutbox {
    async fn fetch_pending(&self, limit: usize, grace: Duration) -> Result<Vec<OutboxMessage>> {
        let Some(cutoff) = minus(self.now(), grace) else {
            return Ok(Vec::new());
        };
        let state = self.state.lock().unwrap();
        Ok(state
            .pending_sorted(cutoff)
            .into_iter()
            .take(limit)
            .map(|row| row.message.clone())
            .collect())
    }

    async fn claim_pending(&self, request: &ClaimRequest) -> Result<Vec<OutboxMessage>> {
        let now = self.now();
        let Some(cutoff) = minus(now, request.grace) else {
            return Ok(Vec::new());
        };
        let claimed_until = plus(now, request.lease);

        let mut state = self.state.lock().unwrap();
        let ids: Vec<MessageId> = state
            .pending_sorted(cutoff)
            .into_iter()
            .filter(|row| row.claimed_until.is_none_or(|until| until < now))
            .take(request.limit)
            .map(|row| row.message.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = state.rows.get_mut(&id) {
                row.claimed_by = Some(request.claimant.clone());
                row.claimed_until = Some(claimed_until);
                claimed.push(row.message.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_claim(&self, id: MessageId, claimant: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.rows.get_mut(&id) {
            if row.claimed_by.as_deref() == Some(claimant) {
                row.claimed_by = None;
                row.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn renew_claim(&self, id: MessageId, claimant: &str, lease: Duration) -> Result<bool> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(false);
        };

        let held = row.message.is_pending()
            && row.claimed_by.as_deref() == Some(claimant)
            && row.claimed_until.is_some_and(|until| until >= now);
        if held {
            row.claimed_until = Some(plus(now, lease));
        }
        Ok(held)
    }

    async fn mark_processed(&self, id: MessageId) -> Result<bool> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        let row = state.rows.get_mut(&id).ok_or(OutboxError::MessageNotFound(id))?;
        if row.message.processed_date_utc.is_some() {
            return Ok(false);
        }
        row.message.processed_date_utc = Some(now);
        row.claimed_by = None;
        row.claimed_until = None;
        Ok(true)
    }

    async fn record_error(&self, id: MessageId, error: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let row = state.rows.get_mut(&id).ok_or(OutboxError::MessageNotFound(id))?;
        row.message.error = Some(error.to_string());
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .rows
            .get(&id)
            .map(|row| row.message.clone()))
    }

    async fn count_pending(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.rows.values().filter(|row| row.message.is_pending()).count() as u64)
    }

    async fn pending_older_than(&self, age: Duration, limit: usize) -> Result<Vec<OutboxMessage>> {
        let Some(cutoff) = minus(self.now(), age) else {
            return Ok(Vec::new());
        };
        let state = self.state.lock().unwrap();
        Ok(state
            .pending_sorted(cutoff)
            .into_iter()
            .filter(|row| row.message.occurred_on_utc < cutoff)
            .take(limit)
            .map(|row| row.message.clone())
            .collect())
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let expired: Vec<MessageId> = state
            .rows
            .values()
            .filter(|row| row.message.processed_date_utc.is_some_and(|at| at < cutoff))
            .map(|row| row.message.id)
            .collect();

        for id in &expired {
            state.rows.remove(id);
            state.ledger.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

impl ConsumerLedger for InMemoryOutbox {
    async fn has_succeeded(&self, id: MessageId, consumer: &ConsumerName) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.ledger.get(&id).is_some_and(|names| names.contains(consumer)))
    }

    async fn record_outcome(&self, id: MessageId, consumer: &ConsumerName, succeeded: bool) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if !state.rows.contains_key(&id) {
            return Err(OutboxError::MessageNotFound(id));
        }
        if !succeeded {
            return Ok(false);
        }
        Ok(state.ledger.entry(id).or_default().insert(consumer.clone()))
    }

    async fn succeeded_consumers(&self, id: MessageId) -> Result<Vec<ConsumerName>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ledger
            .get(&id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }
}
