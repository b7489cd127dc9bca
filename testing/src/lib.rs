//! # Composable Outbox Testing
//!
//! Testing utilities for the Composable Outbox.
//!
//! This crate provides:
//! - [`InMemoryOutbox`]: a complete in-memory Message Store, Consumer Ledger and
//!   Outbox Writer with commit/rollback transactions
//! - [`ManualClock`]: deterministic, advanceable time
//! - [`ScriptedHandler`]: consumer handlers that succeed, fail, panic or stall on
//!   command and count their invocations
//!
//! ## Example
//!
//! ```ignore
//! use composable_outbox_testing::{InMemoryOutbox, ScriptedHandler};
//!
//! #[tokio::test]
//! async fn delivers_once() {
//!     let outbox = InMemoryOutbox::new();
//!     let mut tx = outbox.begin();
//!     outbox.append(&mut tx, NewOutboxMessage::new("Ping", "{}")).await?;
//!     outbox.commit(tx);
//!
//!     let mailer = ScriptedHandler::succeeding();
//!     // register `mailer`, run a dispatcher, then:
//!     assert_eq!(mailer.invocations(), 1);
//! }
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

pub mod handlers;
pub mod in_memory;

use chrono::{DateTime, Utc};
use composable_outbox_core::environment::Clock;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Manually advanced clock for deterministic tests.
    ///
    /// Clones share the same time, so a test can hold one handle and advance the
    /// clock seen by the store.
    ///
    /// # Example
    ///
    /// ```
    /// use composable_outbox_testing::mocks::ManualClock;
    /// use composable_outbox_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::new(chrono::Utc::now());
    /// let before = clock.now();
    /// clock.advance(Duration::from_secs(5));
    /// assert_eq!(clock.now() - before, chrono::Duration::seconds(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock frozen at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).unwrap();
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a manual clock for tests starting at 2025-01-01 00:00:00 UTC.
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> ManualClock {
        ManualClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use handlers::{ScriptedHandler, Script};
pub use in_memory::{InMemoryOutbox, InMemoryTransaction};
pub use mocks::{ManualClock, test_clock};
