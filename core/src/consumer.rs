//! Consumer handlers.
//!
//! A consumer is a named, independent handler that must see every outbox message of
//! the types it is registered for. Consumers are identified by stable string keys
//! so the ledger can record their progress across restarts.

use crate::store::OutboxError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Stable identifier of a consumer (e.g. `search-indexer`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerName(String);

impl ConsumerName {
    /// Create a consumer name.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::InvalidMessage`] if the name is blank.
    pub fn new(name: impl Into<String>) -> Result<Self, OutboxError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(OutboxError::InvalidMessage(
                "consumer name must not be empty".to_string(),
            ));
        }
        Ok(Self(name))
    }

    /// Borrow the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ConsumerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a consumer did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler returned a failure.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked; the panic is contained by the dispatcher.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler did not finish within the dispatcher's handler timeout.
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::Failed`].
    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

/// Future returned by [`ConsumerHandler::handle`].
pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), HandlerError>>;

/// A consumer's delivery callback.
///
/// Receives the message type and its serialized content. Returning `Ok(())` records
/// a success in the ledger and the handler is never invoked for that message again;
/// an error leaves the pair eligible for the next poll.
///
/// Handlers should enforce their own deadlines; the dispatcher only distinguishes
/// success from failure.
///
/// # Dyn Compatibility
///
/// Returns a boxed future so handlers can be stored as `Arc<dyn ConsumerHandler>`
/// in the [`ConsumerRegistry`](crate::registry::ConsumerRegistry).
pub trait ConsumerHandler: Send + Sync {
    /// Deliver one message.
    fn handle<'a>(&'a self, message_type: &'a str, content: &'a str) -> HandlerFuture<'a>;
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(&'a self, message_type: &'a str, content: &'a str) -> HandlerFuture<'a> {
        Box::pin((self.f)(message_type.to_owned(), content.to_owned()))
    }
}

/// Wrap an async closure as a [`ConsumerHandler`].
///
/// # Example
///
/// ```
/// use composable_outbox_core::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|message_type, content| async move {
///     if content.is_empty() {
///         return Err(HandlerError::failed(format!("{message_type} has no content")));
///     }
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}
