//! # Composable Outbox Core
//!
//! Core traits and types for the transactional outbox.
//!
//! The outbox solves the dual-write problem: a domain transaction records both its
//! state change and the events that change implies, in one local commit. A background
//! dispatcher later delivers each event to every registered consumer, at-least-once,
//! with a per-`(message, consumer)` ledger that makes redelivery idempotent.
//!
//! ## Core Concepts
//!
//! - **Message Store**: durable table of [`OutboxMessage`]s
//! - **Consumer Ledger**: one success row per `(message, consumer)` pair
//! - **Outbox Writer**: appends a message inside the caller's transaction
//! - **Consumer Registry**: message type → named consumer handlers
//!
//! ## Data Flow
//!
//! ```text
//! domain tx ──append──▶ outbox row ──commit──▶ dispatcher polls pending
//!                                                   │
//!                         ledger row ◀── success ◀──┤ invoke missing consumers
//!                                                   │
//!                          processed ◀── all consumers succeeded
//! ```
//!
//! ## Implementations
//!
//! - `PostgresOutbox` (in `composable-outbox-postgres`): production storage
//! - `InMemoryOutbox` (in `composable-outbox-testing`): fast, deterministic tests
//!
//! The dispatcher lives in `composable-outbox-runtime`.

pub mod consumer;
pub mod message;
pub mod registry;
pub mod store;

pub use chrono::{DateTime, Utc};

pub use consumer::{ConsumerHandler, ConsumerName, HandlerError, HandlerFuture, handler_fn};
pub use message::{DeliveryState, MessageId, MessageLimits, NewOutboxMessage, OutboxMessage};
pub use registry::{ConsumerRegistry, ConsumerRegistryBuilder, RegistryError};
pub use store::{ClaimRequest, ConsumerLedger, MessageStore, OutboxError, OutboxWriter, Result};

/// Environment module - Dependency injection traits
///
/// Storage implementations that stamp times themselves (the in-memory store) take a
/// [`Clock`](environment::Clock) so tests can control ordering and lease expiry.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
