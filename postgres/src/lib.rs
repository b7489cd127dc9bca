//! `PostgreSQL` storage for the Composable Outbox.
//!
//! This crate provides [`PostgresOutbox`], which implements the `OutboxWriter`,
//! `MessageStore` and `ConsumerLedger` traits from `composable-outbox-core` using
//! sqlx. It supports:
//!
//! - Appending messages inside the caller's `sqlx::Transaction`
//! - Concurrency-safe claims (`FOR UPDATE SKIP LOCKED` plus a lease column)
//! - An idempotent per-consumer ledger with cascade delete
//! - Embedded migrations
//!
//! # Example
//!
//! ```ignore
//! use composable_outbox_postgres::PostgresOutbox;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let outbox = PostgresOutbox::connect("postgres://localhost/mydb").await?;
//!     outbox.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod outbox;

pub use outbox::PostgresOutbox;
