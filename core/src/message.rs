//! Outbox message data model.
//!
//! An [`OutboxMessage`] is created once, inside the originating domain transaction,
//! and afterwards only `processed_date_utc` and `error` ever change.

use crate::consumer::ConsumerName;
use crate::store::OutboxError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of an outbox message, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (e.g. one read back from storage).
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A persisted outbox message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Immutable identifier
    pub id: MessageId,

    /// Discriminator for the payload kind (e.g. `ArticlePublished`)
    pub message_type: String,

    /// Serialized payload, opaque to the store
    pub content: String,

    /// Creation time; determines delivery order
    pub occurred_on_utc: DateTime<Utc>,

    /// Set exactly once, when every registered consumer has succeeded
    pub processed_date_utc: Option<DateTime<Utc>>,

    /// Most recent failure detail for the message as a whole
    pub error: Option<String>,
}

impl OutboxMessage {
    /// A message is pending until it has been marked processed.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.processed_date_utc.is_none()
    }
}

/// A message about to be appended by an [`OutboxWriter`](crate::store::OutboxWriter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxMessage {
    /// Payload kind
    pub message_type: String,
    /// Serialized payload
    pub content: String,
}

impl NewOutboxMessage {
    /// Create a message from an already-serialized payload.
    #[must_use]
    pub fn new(message_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            content: content.into(),
        }
    }

    /// Create a message whose content is `payload` serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Serialization`] if the payload cannot be serialized.
    pub fn json<T: Serialize>(message_type: impl Into<String>, payload: &T) -> Result<Self, OutboxError> {
        let content = serde_json::to_string(payload)
            .map_err(|e| OutboxError::Serialization(e.to_string()))?;
        Ok(Self::new(message_type, content))
    }
}

/// Configurable size limits for stored strings.
///
/// Lengths are counted in characters. Oversized values are rejected at write
/// time rather than truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLimits {
    /// Maximum length of `message_type`
    pub max_type_len: usize,
    /// Maximum length of `content`
    pub max_content_len: usize,
    /// Maximum length of a consumer name
    pub max_consumer_name_len: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_type_len: 400,
            max_content_len: 2000,
            max_consumer_name_len: 400,
        }
    }
}

impl MessageLimits {
    /// Check a message against these limits.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::InvalidMessage`] if the type is empty
    /// - [`OutboxError::LimitExceeded`] if the type or content is too long
    pub fn validate_message(&self, message: &NewOutboxMessage) -> Result<(), OutboxError> {
        if message.message_type.trim().is_empty() {
            return Err(OutboxError::InvalidMessage(
                "message type must not be empty".to_string(),
            ));
        }
        check_len("message_type", &message.message_type, self.max_type_len)?;
        check_len("content", &message.content, self.max_content_len)
    }

    /// Check a consumer name against these limits.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::LimitExceeded`] if the name is too long.
    pub fn validate_consumer_name(&self, name: &ConsumerName) -> Result<(), OutboxError> {
        check_len("consumer_name", name.as_str(), self.max_consumer_name_len)
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), OutboxError> {
    let len = value.chars().count();
    if len > max {
        return Err(OutboxError::LimitExceeded { field, len, max });
    }
    Ok(())
}

/// Delivery progress of a single message.
///
/// There is no failure state: a message that keeps failing stays `Pending` or
/// `PartiallyDelivered` and is retried on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// No required consumer has succeeded yet
    Pending,
    /// Some, but not all, required consumers have succeeded
    PartiallyDelivered,
    /// Every required consumer has succeeded (vacuously true for none)
    Delivered,
}

impl DeliveryState {
    /// Derive the state from the required consumer set and the ledger's success rows.
    #[must_use]
    pub fn from_progress(required: &[ConsumerName], succeeded: &[ConsumerName]) -> Self {
        let done = required.iter().filter(|name| succeeded.contains(name)).count();
        if done == required.len() {
            Self::Delivered
        } else if done == 0 {
            Self::Pending
        } else {
            Self::PartiallyDelivered
        }
    }
}
