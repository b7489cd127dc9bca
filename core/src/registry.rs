//! Consumer Registry: which named consumers each message type must reach.
//!
//! The registry is static for the lifetime of a dispatcher. Whether a message is
//! done is derived from the ledger against this registry, never stored as a flag
//! that could drift from the ledger rows.

use crate::consumer::{ConsumerHandler, ConsumerName};
use crate::message::MessageLimits;
use crate::store::OutboxError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building a [`ConsumerRegistry`].
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The same consumer name was registered twice for one message type.
    #[error("Consumer {name} is already registered for message type {message_type}")]
    DuplicateConsumer {
        /// Message type being registered
        message_type: String,
        /// Conflicting consumer name
        name: ConsumerName,
    },

    /// The consumer name or message type failed validation.
    #[error(transparent)]
    Invalid(#[from] OutboxError),
}

type Handlers = BTreeMap<ConsumerName, Arc<dyn ConsumerHandler>>;

/// Mapping from message type to its named consumer handlers.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    by_type: HashMap<String, Handlers>,
}

impl ConsumerRegistry {
    /// Start building a registry with default [`MessageLimits`].
    #[must_use]
    pub fn builder() -> ConsumerRegistryBuilder {
        ConsumerRegistryBuilder::default()
    }

    /// Names of the consumers required for `message_type`, in sorted order.
    ///
    /// Empty when nothing is registered; such messages are complete as soon as
    /// the dispatcher sees them.
    #[must_use]
    pub fn consumers_for(&self, message_type: &str) -> Vec<ConsumerName> {
        self.by_type
            .get(message_type)
            .map(|handlers| handlers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Look up the handler registered as `name` for `message_type`.
    #[must_use]
    pub fn handler(&self, message_type: &str, name: &ConsumerName) -> Option<Arc<dyn ConsumerHandler>> {
        self.by_type
            .get(message_type)
            .and_then(|handlers| handlers.get(name))
            .cloned()
    }

    /// Message types with at least one consumer.
    #[must_use]
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Whether no consumer is registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary: BTreeMap<&str, Vec<&str>> = self
            .by_type
            .iter()
            .map(|(message_type, handlers)| {
                (
                    message_type.as_str(),
                    handlers.keys().map(ConsumerName::as_str).collect(),
                )
            })
            .collect();
        f.debug_struct("ConsumerRegistry").field("consumers", &summary).finish()
    }
}

/// Builder for [`ConsumerRegistry`].
#[derive(Default)]
pub struct ConsumerRegistryBuilder {
    limits: MessageLimits,
    by_type: HashMap<String, Handlers>,
}

impl ConsumerRegistryBuilder {
    /// Validate names against `limits` instead of the defaults.
    #[must_use]
    pub const fn with_limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Register `handler` as consumer `name` of `message_type`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateConsumer`] if `name` is already registered for this type
    /// - [`RegistryError::Invalid`] if the name is blank or exceeds the configured limit
    pub fn register(
        mut self,
        message_type: impl Into<String>,
        name: impl Into<String>,
        handler: impl ConsumerHandler + 'static,
    ) -> Result<Self, RegistryError> {
        self.insert(message_type.into(), name.into(), Arc::new(handler))?;
        Ok(self)
    }

    /// Register an already shared handler (useful when one handler serves several types).
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn register_shared(
        mut self,
        message_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Self, RegistryError> {
        self.insert(message_type.into(), name.into(), handler)?;
        Ok(self)
    }

    fn insert(
        &mut self,
        message_type: String,
        name: String,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), RegistryError> {
        if message_type.trim().is_empty() {
            return Err(OutboxError::InvalidMessage("message type must not be empty".to_string()).into());
        }
        let name = ConsumerName::new(name)?;
        self.limits.validate_consumer_name(&name)?;

        let handlers = self.by_type.entry(message_type.clone()).or_default();
        if handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateConsumer { message_type, name });
        }
        handlers.insert(name, handler);
        Ok(())
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> ConsumerRegistry {
        ConsumerRegistry { by_type: self.by_type }
    }
}
