//! # Composable Outbox Runtime
//!
//! The dispatcher that drains the outbox.
//!
//! ## Core Components
//!
//! - **[`Dispatcher`]**: polls pending messages, fans them out to every registered
//!   consumer, records successes in the ledger and marks messages processed
//! - **[`DispatcherConfig`]**: batch size, poll interval, claim lease, concurrency
//! - **[`retry`]**: exponential backoff for storage failures
//! - **[`metrics`]**: Prometheus counters and histograms
//!
//! ## Example
//!
//! ```ignore
//! use composable_outbox_runtime::{Dispatcher, DispatcherConfig};
//!
//! let (mut dispatcher, shutdown) = Dispatcher::new(
//!     Arc::new(outbox),
//!     Arc::new(registry),
//!     DispatcherConfig::from_env()?,
//! );
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown.send(true).ok();
//! });
//!
//! dispatcher.run().await;
//! ```

/// Dispatcher configuration
pub mod config;

/// Poll loop, fan-out and ledger bookkeeping
pub mod dispatcher;

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

pub use config::{ConfigError, DispatcherConfig};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use retry::RetryPolicy;
