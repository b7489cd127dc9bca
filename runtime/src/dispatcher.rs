//! The outbox Dispatcher.
//!
//! # Overview
//!
//! Each poll cycle:
//! 1. Claims up to `batch_size` pending messages, oldest first
//! 2. Resolves each message's required consumers from the [`ConsumerRegistry`]
//! 3. Invokes every consumer without a success row in the [`ConsumerLedger`]
//! 4. Records successes in the ledger and the latest failure on the message
//! 5. Marks the message processed once every required consumer has succeeded
//! 6. Releases the claim on messages that are still pending
//!
//! # Per-Message State
//!
//! ```text
//! Pending ──(some consumers succeed)──▶ PartiallyDelivered ──(all succeed)──▶ Delivered
//!    │                                        ▲      │
//!    └────────────────────────────────────────┘      └── retried every poll
//! ```
//!
//! There is no terminal failure state. A consumer that keeps failing keeps its
//! message pending, with `error` describing the most recent failure.
//!
//! # Concurrency
//!
//! Messages within a batch are dispatched concurrently, up to `max_concurrency`.
//! Consumers of a single message run one after another, so ledger writes for a
//! `(message, consumer)` pair never race within a dispatcher. Across dispatchers,
//! the claim lease keeps a message with a single owner. The lease is renewed
//! before every consumer invocation, so a message that waited in the batch past
//! its original lease is either still ours or skipped, never delivered twice.

use crate::config::DispatcherConfig;
use crate::metrics::OutboxMetrics;
use crate::retry::retry_with_backoff;
use composable_outbox_core::{
    ClaimRequest, ConsumerLedger, ConsumerName, ConsumerRegistry, HandlerError, MessageStore,
    OutboxError, OutboxMessage,
};
use futures::{FutureExt, StreamExt, stream};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Summary of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages claimed
    pub claimed: usize,
    /// Successful consumer invocations
    pub delivered: usize,
    /// Failed consumer invocations
    pub failed: usize,
    /// Messages that became processed
    pub processed: usize,
    /// Messages abandoned mid-dispatch because of a storage error
    pub errored: usize,
    /// Messages skipped because their claim expired before delivery
    pub lost: usize,
}

impl DispatchReport {
    /// Add another report's counts to this one.
    pub const fn merge(&mut self, other: Self) {
        self.claimed += other.claimed;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.processed += other.processed;
        self.errored += other.errored;
        self.lost += other.lost;
    }

    /// Whether the cycle touched anything at all.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

/// Outcome of dispatching one claimed message.
#[derive(Debug, Default)]
struct MessageOutcome {
    delivered: usize,
    failed: usize,
    processed: bool,
    claim_lost: bool,
}

/// Polls the outbox and fans messages out to their consumers.
///
/// # Type Parameters
///
/// - `S`: Storage backing both the Message Store and the Consumer Ledger
///
/// # Example
///
/// ```ignore
/// let registry = ConsumerRegistry::builder()
///     .register("ArticlePublished", "search-indexer", indexer)?
///     .build();
///
/// let (mut dispatcher, shutdown) = Dispatcher::new(
///     Arc::new(PostgresOutbox::from_pool(pool)),
///     Arc::new(registry),
///     DispatcherConfig::from_env()?,
/// );
///
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.send(true).ok();
/// });
///
/// dispatcher.run().await;
/// ```
pub struct Dispatcher<S>
where
    S: MessageStore + ConsumerLedger,
{
    store: Arc<S>,
    registry: Arc<ConsumerRegistry>,
    config: DispatcherConfig,
    /// Shutdown signal
    shutdown: watch::Receiver<bool>,
}

impl<S> Dispatcher<S>
where
    S: MessageStore + ConsumerLedger,
{
    /// Create a dispatcher.
    ///
    /// Returns the dispatcher and a shutdown sender. Send `true` to stop
    /// [`run`](Self::run) after the current cycle; dropping the sender has the
    /// same effect.
    pub fn new(
        store: Arc<S>,
        registry: Arc<ConsumerRegistry>,
        config: DispatcherConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Self {
            store,
            registry,
            config,
            shutdown: shutdown_rx,
        };

        (dispatcher, shutdown_tx)
    }

    /// The dispatcher's configuration.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run poll cycles until a shutdown signal is received.
    ///
    /// Sleeps `poll_interval` between cycles, or polls again immediately when a
    /// full batch was delivered without failures. A cycle that fails with a
    /// storage error delays the next one with exponential backoff from
    /// `config.storage_retry`, reset by the next successful cycle.
    ///
    /// Shutdown is observed between cycles; an in-flight cycle runs to completion.
    pub async fn run(&mut self) {
        tracing::info!(
            dispatcher = %self.config.dispatcher_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            consumers = ?self.registry,
            "Starting outbox dispatcher"
        );

        let mut consecutive_errors = 0usize;
        let mut totals = DispatchReport::default();

        while !*self.shutdown.borrow() {
            let delay = match self.poll_once().await {
                Ok(report) => {
                    consecutive_errors = 0;
                    totals.merge(report);
                    if report.claimed >= self.config.batch_size
                        && report.failed == 0
                        && report.errored == 0
                        && report.lost == 0
                    {
                        Duration::ZERO
                    } else {
                        self.config.poll_interval
                    }
                }
                Err(e) => {
                    OutboxMetrics::record_poll_error();
                    let backoff = self
                        .config
                        .storage_retry
                        .delay_for_attempt(consecutive_errors)
                        .max(self.config.poll_interval);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    tracing::warn!(
                        dispatcher = %self.config.dispatcher_id,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis(),
                        "Poll cycle failed, backing off"
                    );
                    backoff
                }
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                () = tokio::time::sleep(delay) => {}

                // Handle shutdown
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!(dispatcher = %self.config.dispatcher_id, "Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!(
            dispatcher = %self.config.dispatcher_id,
            claimed = totals.claimed,
            delivered = totals.delivered,
            failed = totals.failed,
            processed = totals.processed,
            errored = totals.errored,
            lost = totals.lost,
            "Outbox dispatcher stopped"
        );
    }

    /// Run a single poll cycle.
    ///
    /// Storage errors while dispatching an individual message are logged and
    /// counted in [`DispatchReport::errored`]; the message keeps its progress and
    /// is picked up again once its claim is released or its lease expires.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the claim itself fails.
    pub async fn poll_once(&self) -> Result<DispatchReport, OutboxError> {
        let started = Instant::now();

        let request = ClaimRequest {
            claimant: self.config.dispatcher_id.clone(),
            limit: self.config.batch_size,
            grace: self.config.grace,
            lease: self.config.lease,
        };
        let messages = self.store.claim_pending(&request).await?;

        let mut report = DispatchReport {
            claimed: messages.len(),
            ..DispatchReport::default()
        };
        if messages.is_empty() {
            OutboxMetrics::record_poll(started.elapsed());
            return Ok(report);
        }

        OutboxMetrics::record_claimed(messages.len());
        tracing::debug!(
            dispatcher = %self.config.dispatcher_id,
            claimed = messages.len(),
            "Claimed outbox messages"
        );

        let outcomes: Vec<Result<MessageOutcome, OutboxError>> = stream::iter(messages)
            .map(|message| self.dispatch_message(message))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(outcome) => {
                    report.delivered += outcome.delivered;
                    report.failed += outcome.failed;
                    if outcome.processed {
                        report.processed += 1;
                    }
                    if outcome.claim_lost {
                        report.lost += 1;
                    }
                }
                Err(_) => report.errored += 1,
            }
        }

        OutboxMetrics::record_poll(started.elapsed());
        tracing::debug!(
            dispatcher = %self.config.dispatcher_id,
            claimed = report.claimed,
            delivered = report.delivered,
            failed = report.failed,
            processed = report.processed,
            errored = report.errored,
            lost = report.lost,
            "Poll cycle complete"
        );
        Ok(report)
    }

    /// Deliver one claimed message, then give up the claim if it is still pending.
    async fn dispatch_message(&self, message: OutboxMessage) -> Result<MessageOutcome, OutboxError> {
        let id = message.id;
        let result = self.deliver(&message).await;

        if let Err(e) = &result {
            tracing::error!(
                message_id = %id,
                message_type = %message.message_type,
                error = %e,
                "Storage error while dispatching message"
            );
        }

        let processed = matches!(&result, Ok(outcome) if outcome.processed);
        if !processed {
            if let Err(e) = self.store.release_claim(id, &self.config.dispatcher_id).await {
                // The lease expires on its own
                tracing::warn!(message_id = %id, error = %e, "Failed to release claim");
            }
        }

        result
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<MessageOutcome, OutboxError> {
        let id = message.id;
        let required = self.registry.consumers_for(&message.message_type);
        let mut outcome = MessageOutcome::default();

        if required.is_empty() {
            tracing::debug!(
                message_id = %id,
                message_type = %message.message_type,
                "No consumers registered, completing message"
            );
        } else {
            let succeeded = self.store.succeeded_consumers(id).await?;

            for name in required.iter().filter(|name| !succeeded.contains(name)) {
                let Some(handler) = self.registry.handler(&message.message_type, name) else {
                    continue;
                };

                if !self
                    .store
                    .renew_claim(id, &self.config.dispatcher_id, self.config.lease)
                    .await?
                {
                    tracing::warn!(
                        message_id = %id,
                        message_type = %message.message_type,
                        consumer = %name,
                        "Claim expired before delivery, skipping message"
                    );
                    outcome.claim_lost = true;
                    return Ok(outcome);
                }

                let started = Instant::now();
                let result = self
                    .invoke(handler.handle(&message.message_type, &message.content))
                    .await;
                let elapsed = started.elapsed();

                match result {
                    Ok(()) => {
                        OutboxMetrics::record_delivery(name.as_str(), elapsed);
                        self.record_success(message, name).await?;
                        outcome.delivered += 1;
                        tracing::info!(
                            message_id = %id,
                            message_type = %message.message_type,
                            consumer = %name,
                            duration_ms = elapsed.as_millis(),
                            "Consumer succeeded"
                        );
                    }
                    Err(e) => {
                        OutboxMetrics::record_failure(name.as_str(), elapsed);
                        outcome.failed += 1;
                        tracing::warn!(
                            message_id = %id,
                            message_type = %message.message_type,
                            consumer = %name,
                            error = %e,
                            "Consumer failed"
                        );
                        self.store.record_error(id, &format!("{name}: {e}")).await?;
                    }
                }
            }

            if outcome.failed > 0 {
                return Ok(outcome);
            }
        }

        if self.store.all_consumers_succeeded(id, &required).await?
            && self.store.mark_processed(id).await?
        {
            OutboxMetrics::record_processed();
            outcome.processed = true;
            tracing::info!(
                message_id = %id,
                message_type = %message.message_type,
                "Outbox message processed"
            );
        }

        Ok(outcome)
    }

    /// Write the ledger row for a successful delivery, retrying transient storage
    /// errors. Losing this write means the consumer is invoked again later.
    async fn record_success(&self, message: &OutboxMessage, name: &ConsumerName) -> Result<(), OutboxError> {
        let recorded = retry_with_backoff(&self.config.storage_retry, || {
            self.store.record_outcome(message.id, name, true)
        })
        .await?;

        if !recorded {
            tracing::debug!(message_id = %message.id, consumer = %name, "Ledger row already present");
        }
        Ok(())
    }

    /// Await a handler future, containing panics and enforcing `handler_timeout`.
    async fn invoke<F>(&self, handling: F) -> Result<(), HandlerError>
    where
        F: Future<Output = Result<(), HandlerError>>,
    {
        let guarded = AssertUnwindSafe(handling).catch_unwind();

        let caught = match self.config.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| HandlerError::TimedOut(limit))?,
            None => guarded.await,
        };

        caught.unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
