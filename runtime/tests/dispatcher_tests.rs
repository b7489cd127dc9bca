//! Behavioural tests for the Dispatcher against the in-memory outbox.
//!
//! Covers delivery guarantees (ledger idempotency, partial progress across
//! restarts, ordering, failure isolation, exclusive claims, lease expiry) and the
//! poll loop (shutdown, storage-error backoff).
//!
//! Set `RUST_LOG=composable_outbox_runtime=debug` to see dispatcher logs.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use composable_outbox_core::{
    ClaimRequest, ConsumerHandler, ConsumerLedger, ConsumerName, ConsumerRegistry, DateTime,
    HandlerFuture, MessageId, MessageStore, NewOutboxMessage, OutboxError, OutboxMessage,
    OutboxWriter, Result, Utc,
};
use composable_outbox_runtime::{Dispatcher, DispatcherConfig, RetryPolicy};
use composable_outbox_testing::{InMemoryOutbox, ManualClock, ScriptedHandler, test_clock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Test Fixtures
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn config(id: &str) -> DispatcherConfig {
    DispatcherConfig::default()
        .with_dispatcher_id(id)
        .with_poll_interval(Duration::from_millis(10))
        .with_storage_retry(
            RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(20))
                .build(),
        )
}

async fn publish(outbox: &InMemoryOutbox, message_type: &str, content: &str) -> MessageId {
    let mut tx = outbox.begin();
    let id = outbox
        .append(&mut tx, NewOutboxMessage::new(message_type, content))
        .await
        .expect("append should succeed");
    outbox.commit(tx);
    id
}

fn registry(consumers: &[(&str, &str, &ScriptedHandler)]) -> Arc<ConsumerRegistry> {
    let mut builder = ConsumerRegistry::builder();
    for (message_type, name, handler) in consumers {
        builder = builder
            .register(*message_type, *name, (*handler).clone())
            .expect("registration should succeed");
    }
    Arc::new(builder.build())
}

fn name(value: &str) -> ConsumerName {
    ConsumerName::new(value).unwrap()
}

/// Advances the store's clock by `work` on every invocation, standing in for a
/// slow consumer. The invocation numbered `park_on` then waits for `resume`.
#[derive(Clone)]
struct SlowHandler {
    clock: ManualClock,
    work: Duration,
    park_on: usize,
    invocations: Arc<AtomicUsize>,
    parked: Arc<Notify>,
    resume: Arc<Notify>,
}

impl SlowHandler {
    fn new(clock: &ManualClock, work: Duration) -> Self {
        Self {
            clock: clock.clone(),
            work,
            park_on: 0,
            invocations: Arc::new(AtomicUsize::new(0)),
            parked: Arc::new(Notify::new()),
            resume: Arc::new(Notify::new()),
        }
    }

    fn parking_on(mut self, invocation: usize) -> Self {
        self.park_on = invocation;
        self
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl ConsumerHandler for SlowHandler {
    fn handle<'a>(&'a self, _message_type: &'a str, _content: &'a str) -> HandlerFuture<'a> {
        Box::pin(async move {
            let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            self.clock.advance(self.work);
            if invocation == self.park_on {
                self.parked.notify_one();
                self.resume.notified().await;
            }
            Ok(())
        })
    }
}

/// One message per batch slot, one at a time, 100ms lease.
fn tight(id: &str) -> DispatcherConfig {
    config(id)
        .with_batch_size(2)
        .with_max_concurrency(1)
        .with_lease(Duration::from_millis(100))
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn message_without_consumers_is_processed_on_next_poll() {
    let outbox = InMemoryOutbox::new();
    let id = publish(&outbox, "Unobserved", "{}").await;

    let (dispatcher, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        Arc::new(ConsumerRegistry::default()),
        config("d1"),
    );
    let report = dispatcher.poll_once().await.unwrap();

    assert_eq!(report.claimed, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.delivered, 0);
    assert!(outbox.get(id).await.unwrap().unwrap().processed_date_utc.is_some());
    assert_eq!(outbox.ledger_len(), 0);
}

#[tokio::test]
async fn every_consumer_receives_type_and_content() {
    let outbox = InMemoryOutbox::new();
    let indexer = ScriptedHandler::succeeding();
    let notifier = ScriptedHandler::succeeding();
    let id = publish(&outbox, "ArticlePublished", r#"{"article_id":7}"#).await;

    let (dispatcher, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        registry(&[
            ("ArticlePublished", "search-indexer", &indexer),
            ("ArticlePublished", "notify-subscribers", &notifier),
        ]),
        config("d1"),
    );
    let report = dispatcher.poll_once().await.unwrap();

    assert_eq!(report.delivered, 2);
    assert_eq!(report.processed, 1);
    let expected = vec![("ArticlePublished".to_string(), r#"{"article_id":7}"#.to_string())];
    assert_eq!(indexer.calls(), expected);
    assert_eq!(notifier.calls(), expected);

    let message = outbox.get(id).await.unwrap().unwrap();
    assert!(!message.is_pending());
    assert_eq!(message.error, None);
    assert_eq!(
        outbox.succeeded_consumers(id).await.unwrap(),
        vec![name("notify-subscribers"), name("search-indexer")]
    );
}

#[tokio::test]
async fn recorded_success_is_never_reinvoked() {
    let outbox = InMemoryOutbox::new();
    let stable = ScriptedHandler::succeeding();
    let flaky = ScriptedHandler::failing_times(2);
    let id = publish(&outbox, "OrderPlaced", "{}").await;

    let (dispatcher, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        registry(&[("OrderPlaced", "stable", &stable), ("OrderPlaced", "flaky", &flaky)]),
        config("d1"),
    );

    for _ in 0..5 {
        dispatcher.poll_once().await.unwrap();
    }

    assert_eq!(stable.invocations(), 1);
    assert_eq!(flaky.invocations(), 3);
    assert!(!outbox.get(id).await.unwrap().unwrap().is_pending());
    // Once processed the message is no longer claimed at all
    assert!(dispatcher.poll_once().await.unwrap().is_idle());
}

#[tokio::test]
async fn restarted_dispatcher_only_invokes_missing_consumers() {
    let outbox = InMemoryOutbox::new();
    let id = publish(&outbox, "ArticlePublished", "{}").await;

    let a = ScriptedHandler::succeeding();
    let b = ScriptedHandler::failing("search cluster unavailable");
    {
        let (dispatcher, _shutdown) = Dispatcher::new(
            Arc::new(outbox.clone()),
            registry(&[("ArticlePublished", "a", &a), ("ArticlePublished", "b", &b)]),
            config("before-restart"),
        );
        dispatcher.poll_once().await.unwrap();
    }
    assert_eq!(a.invocations(), 1);
    assert!(outbox.get(id).await.unwrap().unwrap().is_pending());

    // Fresh process: new handlers, new dispatcher, same storage
    let a_after = ScriptedHandler::succeeding();
    let b_after = ScriptedHandler::succeeding();
    let (dispatcher, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        registry(&[("ArticlePublished", "a", &a_after), ("ArticlePublished", "b", &b_after)]),
        config("after-restart"),
    );
    let report = dispatcher.poll_once().await.unwrap();

    assert_eq!(a_after.invocations(), 0);
    assert_eq!(b_after.invocations(), 1);
    assert_eq!(report.processed, 1);
    assert!(!outbox.get(id).await.unwrap().unwrap().is_pending());
}

#[tokio::test]
async fn oldest_message_is_dispatched_first() {
    let clock = test_clock();
    let outbox = InMemoryOutbox::with_clock(clock.clone());
    let handler = ScriptedHandler::succeeding();

    let mut first = outbox.begin();
    outbox
        .append(&mut first, NewOutboxMessage::new("Tick", "m1"))
        .await
        .unwrap();
    clock.advance(Duration::from_secs(1));
    let mut second = outbox.begin();
    outbox
        .append(&mut second, NewOutboxMessage::new("Tick", "m2"))
        .await
        .unwrap();

    // Commit order does not matter, occurrence time does
    outbox.commit(second);
    outbox.commit(first);

    let (dispatcher, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        registry(&[("Tick", "recorder", &handler)]),
        config("d1").with_batch_size(1),
    );

    dispatcher.poll_once().await.unwrap();
    assert_eq!(handler.calls(), vec![("Tick".to_string(), "m1".to_string())]);

    dispatcher.poll_once().await.unwrap();
    assert_eq!(handler.calls()[1].1, "m2");
}

#[tokio::test]
async fn failing_consumer_does_not_block_the_others() {
    let outbox = InMemoryOutbox::new();
    let a = ScriptedHandler::failing("smtp timeout");
    let b = ScriptedHandler::succeeding();
    let id = publish(&outbox, "UserRegistered", "{}").await;

    let (dispatcher, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        registry(&[("UserRegistered", "a", &a), ("UserRegistered", "b", &b)]),
        config("d1"),
    );

    let first = dispatcher.poll_once().await.unwrap();
    assert_eq!(first.delivered, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.processed, 0);
    assert!(outbox.has_succeeded(id, &name("b")).await.unwrap());

    a.set_script(composable_outbox_testing::Script::Fail("smtp refused".to_string()));
    for _ in 0..3 {
        dispatcher.poll_once().await.unwrap();
    }

    let message = outbox.get(id).await.unwrap().unwrap();
    assert!(message.is_pending());
    assert_eq!(message.error.as_deref(), Some("a: smtp refused"));
    assert_eq!(a.invocations(), 4);
    assert_eq!(b.invocations(), 1);
    assert!(!outbox.has_succeeded(id, &name("a")).await.unwrap());
}

#[tokio::test]
async fn panicking_consumer_is_recorded_as_failure() {
    let outbox = InMemoryOutbox::new();
    let panicky = ScriptedHandler::panicking();
    let steady = ScriptedHandler::succeeding();
    let id = publish(&outbox, "InvoiceIssued", "{}").await;

    let (dispatcher, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        registry(&[("InvoiceIssued", "panicky", &panicky), ("InvoiceIssued", "steady", &steady)]),
        config("d1"),
    );
    let report = dispatcher.poll_once().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.delivered, 1);
    let error = outbox.get(id).await.unwrap().unwrap().error.unwrap();
    assert!(error.starts_with("panicky: handler panicked"), "{error}");
    assert_eq!(outbox.claimed_by(id), None);
}

#[tokio::test]
async fn slow_consumer_times_out() {
    let outbox = InMemoryOutbox::new();
    let slow = ScriptedHandler::delayed(Duration::from_secs(30));
    let id = publish(&outbox, "ReportRequested", "{}").await;

    let (dispatcher, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        registry(&[("ReportRequested", "renderer", &slow)]),
        config("d1").with_handler_timeout(Duration::from_millis(20)),
    );
    let report = dispatcher.poll_once().await.unwrap();

    assert_eq!(report.failed, 1);
    let message = outbox.get(id).await.unwrap().unwrap();
    assert!(message.is_pending());
    assert!(message.error.unwrap().starts_with("renderer: handler timed out"));
}

#[tokio::test]
async fn grace_period_defers_fresh_messages() {
    let clock = test_clock();
    let outbox = InMemoryOutbox::with_clock(clock.clone());
    let handler = ScriptedHandler::succeeding();
    publish(&outbox, "Tick", "{}").await;

    let (dispatcher, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        registry(&[("Tick", "recorder", &handler)]),
        config("d1").with_grace(Duration::from_secs(2)),
    );

    assert!(dispatcher.poll_once().await.unwrap().is_idle());
    clock.advance(Duration::from_secs(2));
    assert_eq!(dispatcher.poll_once().await.unwrap().processed, 1);
    assert_eq!(handler.invocations(), 1);
}

// ============================================================================
// Concurrent Dispatchers
// ============================================================================

#[tokio::test]
async fn interleaved_dispatchers_never_share_a_message() {
    let outbox = InMemoryOutbox::new();
    let c = ScriptedHandler::delayed(Duration::from_millis(20));
    let id = publish(&outbox, "PaymentCaptured", "{}").await;
    let consumers = registry(&[("PaymentCaptured", "c", &c)]);

    let (first, _s1) = Dispatcher::new(Arc::new(outbox.clone()), Arc::clone(&consumers), config("d1"));
    let (second, _s2) = Dispatcher::new(Arc::new(outbox.clone()), Arc::clone(&consumers), config("d2"));

    let (a, b) = tokio::join!(first.poll_once(), second.poll_once());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.claimed + b.claimed, 1);
    assert_eq!(c.invocations(), 1);
    assert!(!outbox.get(id).await.unwrap().unwrap().is_pending());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_dispatchers_deliver_each_message_exactly_once() {
    init_tracing();
    let outbox = InMemoryOutbox::new();
    let c = ScriptedHandler::delayed(Duration::from_millis(2));
    for n in 0..40 {
        publish(&outbox, "PaymentCaptured", &format!(r#"{{"n":{n}}}"#)).await;
    }
    let consumers = registry(&[("PaymentCaptured", "c", &c)]);

    let mut tasks = Vec::new();
    for replica in 0..4 {
        let (dispatcher, _shutdown) = Dispatcher::new(
            Arc::new(outbox.clone()),
            Arc::clone(&consumers),
            config(&format!("replica-{replica}")).with_batch_size(5),
        );
        tasks.push(tokio::spawn(async move {
            let mut processed = 0;
            for _ in 0..20 {
                processed += dispatcher.poll_once().await.unwrap().processed;
            }
            processed
        }));
    }

    let mut processed = 0;
    for task in tasks {
        processed += task.await.unwrap();
    }

    assert_eq!(processed, 40);
    assert_eq!(c.invocations(), 40);
    assert_eq!(outbox.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn queued_message_is_not_redelivered_after_claim_time_lease() {
    init_tracing();
    let clock = test_clock();
    let outbox = InMemoryOutbox::with_clock(clock.clone());
    let first = publish(&outbox, "Invoice", "1").await;
    let second = publish(&outbox, "Invoice", "2").await;

    // 80ms per delivery: the second message starts after the 100ms lease
    // stamped at claim time, and is still in flight at +160ms
    let c = SlowHandler::new(&clock, Duration::from_millis(80)).parking_on(2);
    let consumers = Arc::new(
        ConsumerRegistry::builder()
            .register("Invoice", "c", c.clone())
            .unwrap()
            .build(),
    );
    tight("d1").validate().unwrap();

    let (d1, _s1) = Dispatcher::new(Arc::new(outbox.clone()), Arc::clone(&consumers), tight("d1"));
    let (d2, _s2) = Dispatcher::new(Arc::new(outbox.clone()), consumers, tight("d2"));

    let running = tokio::spawn(async move { d1.poll_once().await });
    c.parked.notified().await;
    let second_report = d2.poll_once().await.unwrap();
    c.resume.notify_one();
    let first_report = running.await.unwrap().unwrap();

    assert!(second_report.is_idle());
    assert_eq!(first_report.processed, 2);
    assert_eq!(first_report.lost, 0);
    assert_eq!(c.invocations(), 2);
    assert!(!outbox.get(first).await.unwrap().unwrap().is_pending());
    assert!(!outbox.get(second).await.unwrap().unwrap().is_pending());
}

#[tokio::test]
async fn message_taken_over_while_queued_is_skipped() {
    init_tracing();
    let clock = test_clock();
    let outbox = InMemoryOutbox::with_clock(clock.clone());
    let invoice = publish(&outbox, "Invoice", "1").await;
    let receipt = publish(&outbox, "Receipt", "1").await;

    // The invoice's consumers renew at +0 and +80ms; the receipt waits behind
    // them on its claim-time lease
    let render = SlowHandler::new(&clock, Duration::from_millis(80));
    let send = SlowHandler::new(&clock, Duration::ZERO).parking_on(1);
    let archive = ScriptedHandler::failing("archive unavailable");
    let consumers = Arc::new(
        ConsumerRegistry::builder()
            .register("Invoice", "render", render.clone())
            .unwrap()
            .register("Invoice", "send", send.clone())
            .unwrap()
            .register("Receipt", "archive", archive.clone())
            .unwrap()
            .build(),
    );

    let (d1, _s1) = Dispatcher::new(Arc::new(outbox.clone()), Arc::clone(&consumers), tight("d1"));
    let (d2, _s2) = Dispatcher::new(Arc::new(outbox.clone()), consumers, tight("d2"));

    let running = tokio::spawn(async move { d1.poll_once().await });
    send.parked.notified().await;
    clock.advance(Duration::from_millis(40));

    // Only the receipt's lease has run out
    let second_report = d2.poll_once().await.unwrap();
    assert_eq!(second_report.claimed, 1);
    assert_eq!(second_report.failed, 1);

    send.resume.notify_one();
    let first_report = running.await.unwrap().unwrap();

    assert_eq!(first_report.claimed, 2);
    assert_eq!(first_report.processed, 1);
    assert_eq!(first_report.lost, 1);
    assert_eq!(archive.invocations(), 1);
    assert!(!outbox.get(invoice).await.unwrap().unwrap().is_pending());

    let receipt = outbox.get(receipt).await.unwrap().unwrap();
    assert!(receipt.is_pending());
    assert_eq!(receipt.error.as_deref(), Some("archive: archive unavailable"));
    assert_eq!(outbox.claimed_by(receipt.id), None);
}

#[tokio::test]
async fn expired_claim_of_crashed_dispatcher_resumes_missing_consumers() {
    let clock = test_clock();
    let outbox = InMemoryOutbox::with_clock(clock.clone());
    let id = publish(&outbox, "ArticlePublished", "{}").await;

    // A dispatcher claimed the message, got one consumer through, then died
    let lease = Duration::from_secs(60);
    let crashed = ClaimRequest {
        claimant: "crashed".to_string(),
        limit: 10,
        grace: Duration::ZERO,
        lease,
    };
    assert_eq!(outbox.claim_pending(&crashed).await.unwrap().len(), 1);
    outbox.record_outcome(id, &name("a"), true).await.unwrap();

    let a = ScriptedHandler::succeeding();
    let b = ScriptedHandler::succeeding();
    let (survivor, _shutdown) = Dispatcher::new(
        Arc::new(outbox.clone()),
        registry(&[("ArticlePublished", "a", &a), ("ArticlePublished", "b", &b)]),
        config("survivor"),
    );

    assert!(survivor.poll_once().await.unwrap().is_idle());
    assert_eq!(b.invocations(), 0);

    clock.advance(lease + Duration::from_secs(1));
    let report = survivor.poll_once().await.unwrap();

    assert_eq!(report.claimed, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(a.invocations(), 0);
    assert_eq!(b.invocations(), 1);
    assert!(!outbox.get(id).await.unwrap().unwrap().is_pending());
    assert_eq!(outbox.claimed_by(id), None);
}

// ============================================================================
// Poll Loop
// ============================================================================

#[tokio::test]
async fn run_drains_outbox_until_shutdown() {
    let outbox = InMemoryOutbox::new();
    let handler = ScriptedHandler::succeeding();
    let consumers = registry(&[("Tick", "recorder", &handler)]);

    let (mut dispatcher, shutdown) = Dispatcher::new(Arc::new(outbox.clone()), consumers, config("loop"));
    let running = tokio::spawn(async move { dispatcher.run().await });

    for _ in 0..3 {
        publish(&outbox, "Tick", "{}").await;
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while outbox.count_pending().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("outbox should drain");

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("dispatcher should stop")
        .unwrap();

    assert_eq!(handler.invocations(), 3);
}

#[tokio::test]
async fn dropping_shutdown_sender_stops_run() {
    let (mut dispatcher, shutdown) = Dispatcher::new(
        Arc::new(InMemoryOutbox::new()),
        Arc::new(ConsumerRegistry::default()),
        config("orphan"),
    );
    let running = tokio::spawn(async move { dispatcher.run().await });

    drop(shutdown);

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("dispatcher should stop")
        .unwrap();
}

/// Delegates to an [`InMemoryOutbox`], failing the first `claim_failures` claims
/// and the first `ledger_failures` ledger writes.
#[derive(Clone)]
struct FlakyStore {
    inner: InMemoryOutbox,
    claim_failures: Arc<AtomicUsize>,
    ledger_failures: Arc<AtomicUsize>,
}

impl FlakyStore {
    fn new(inner: InMemoryOutbox, claim_failures: usize, ledger_failures: usize) -> Self {
        Self {
            inner,
            claim_failures: Arc::new(AtomicUsize::new(claim_failures)),
            ledger_failures: Arc::new(AtomicUsize::new(ledger_failures)),
        }
    }

    fn trip(counter: &AtomicUsize) -> Result<()> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            Err(OutboxError::Database("connection reset by peer".to_string()))
        } else {
            Ok(())
        }
    }
}

impl MessageStore for FlakyStore {
    async fn fetch_pending(&self, limit: usize, grace: Duration) -> Result<Vec<OutboxMessage>> {
        self.inner.fetch_pending(limit, grace).await
    }

    async fn claim_pending(&self, request: &ClaimRequest) -> Result<Vec<OutboxMessage>> {
        Self::trip(&self.claim_failures)?;
        self.inner.claim_pending(request).await
    }

    async fn release_claim(&self, id: MessageId, claimant: &str) -> Result<()> {
        self.inner.release_claim(id, claimant).await
    }

    async fn renew_claim(&self, id: MessageId, claimant: &str, lease: Duration) -> Result<bool> {
        self.inner.renew_claim(id, claimant, lease).await
    }

    async fn mark_processed(&self, id: MessageId) -> Result<bool> {
        self.inner.mark_processed(id).await
    }

    async fn record_error(&self, id: MessageId, error: &str) -> Result<()> {
        self.inner.record_error(id, error).await
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        self.inner.get(id).await
    }

    async fn count_pending(&self) -> Result<u64> {
        self.inner.count_pending().await
    }

    async fn pending_older_than(&self, age: Duration, limit: usize) -> Result<Vec<OutboxMessage>> {
        self.inner.pending_older_than(age, limit).await
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_processed_before(cutoff).await
    }
}

impl ConsumerLedger for FlakyStore {
    async fn has_succeeded(&self, id: MessageId, consumer: &ConsumerName) -> Result<bool> {
        self.inner.has_succeeded(id, consumer).await
    }

    async fn record_outcome(&self, id: MessageId, consumer: &ConsumerName, succeeded: bool) -> Result<bool> {
        Self::trip(&self.ledger_failures)?;
        self.inner.record_outcome(id, consumer, succeeded).await
    }

    async fn succeeded_consumers(&self, id: MessageId) -> Result<Vec<ConsumerName>> {
        self.inner.succeeded_consumers(id).await
    }
}

#[tokio::test]
async fn failed_claim_surfaces_from_poll_once() {
    let store = FlakyStore::new(InMemoryOutbox::new(), 1, 0);
    let (dispatcher, _shutdown) =
        Dispatcher::new(Arc::new(store), Arc::new(ConsumerRegistry::default()), config("d1"));

    assert!(matches!(dispatcher.poll_once().await, Err(OutboxError::Database(_))));
    assert!(dispatcher.poll_once().await.is_ok());
}

#[tokio::test]
async fn run_backs_off_and_recovers_from_storage_errors() {
    let outbox = InMemoryOutbox::new();
    let handler = ScriptedHandler::succeeding();
    publish(&outbox, "Tick", "{}").await;

    let store = FlakyStore::new(outbox.clone(), 3, 0);
    let (mut dispatcher, shutdown) =
        Dispatcher::new(Arc::new(store), registry(&[("Tick", "recorder", &handler)]), config("d1"));
    let running = tokio::spawn(async move { dispatcher.run().await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while outbox.count_pending().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispatcher should recover");

    shutdown.send(true).unwrap();
    running.await.unwrap();
    assert_eq!(handler.invocations(), 1);
}

#[tokio::test]
async fn transient_ledger_failure_is_retried_without_reinvoking() {
    let outbox = InMemoryOutbox::new();
    let handler = ScriptedHandler::succeeding();
    let id = publish(&outbox, "Tick", "{}").await;

    let store = FlakyStore::new(outbox.clone(), 0, 2);
    let (dispatcher, _shutdown) =
        Dispatcher::new(Arc::new(store), registry(&[("Tick", "recorder", &handler)]), config("d1"));
    let report = dispatcher.poll_once().await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(handler.invocations(), 1);
    assert!(outbox.has_succeeded(id, &name("recorder")).await.unwrap());
}

#[tokio::test]
async fn exhausted_ledger_retries_leave_message_claimable() {
    let outbox = InMemoryOutbox::new();
    let handler = ScriptedHandler::succeeding();
    let id = publish(&outbox, "Tick", "{}").await;

    // storage_retry allows two retries: three attempts fail in a row
    let store = FlakyStore::new(outbox.clone(), 0, 3);
    let (dispatcher, _shutdown) =
        Dispatcher::new(Arc::new(store), registry(&[("Tick", "recorder", &handler)]), config("d1"));

    let report = dispatcher.poll_once().await.unwrap();
    assert_eq!(report.errored, 1);
    assert_eq!(outbox.claimed_by(id), None);

    // At-least-once: the unrecorded success is delivered again
    let report = dispatcher.poll_once().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(handler.invocations(), 2);
}
