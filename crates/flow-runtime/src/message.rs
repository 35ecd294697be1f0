//! Message types and core domain identifiers.

use crate::error::{AckFailure, ValidationError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name
///
/// Allowed characters are ASCII alphanumerics plus `-`, `_`, `.` and `/`.
/// Names may not start or end with a separator or contain `//`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 200 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-200 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, '-', '_', '.' and '/' allowed".to_string(),
            });
        }

        let is_separator = |c: char| c == '/' || c == '.';
        if name.starts_with(is_separator) || name.ends_with(is_separator) || name.contains("//")
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "no leading/trailing separators or empty path levels".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

/// Unique identifier for messages assigned by the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Identifier of one receiver binding; a rebind always produces a new one
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingId(String);

impl BindingId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BindingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Queue Endpoints
// ============================================================================

/// Lifetime of the queue a receiver binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Provisioned on the broker ahead of time; survives consumer disconnects
    Durable,
    /// Created on demand by the first bind
    Temporary,
}

/// Queue a receiver binds to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueEndpoint {
    pub name: QueueName,
    pub durability: Durability,
}

impl QueueEndpoint {
    pub fn durable(name: QueueName) -> Self {
        Self {
            name,
            durability: Durability::Durable,
        }
    }

    pub fn temporary(name: QueueName) -> Self {
        Self {
            name,
            durability: Durability::Temporary,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durability == Durability::Durable
    }
}

impl std::fmt::Display for QueueEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.durability {
            Durability::Durable => write!(f, "{}", self.name),
            Durability::Temporary => write!(f, "{} (temporary)", self.name),
        }
    }
}

// ============================================================================
// Inbound Messages
// ============================================================================

/// Transport capability that settles a delivered message
///
/// Implementations report the broker's verdict; an `Err` means the message is
/// still unsettled and will be redelivered after the receiver rebinds.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn acknowledge(&self, message_id: &MessageId) -> Result<(), AckFailure>;
}

/// A message delivered by a receiver and awaiting acknowledgment
#[derive(Clone)]
pub struct InboundMessage {
    message_id: MessageId,
    body: Bytes,
    attributes: HashMap<String, String>,
    delivery_count: u32,
    redelivered: bool,
    received_at: Timestamp,
    acknowledger: Arc<dyn Acknowledger>,
}

impl InboundMessage {
    /// Create a first-delivery message
    pub fn new(message_id: MessageId, body: Bytes, acknowledger: Arc<dyn Acknowledger>) -> Self {
        Self {
            message_id,
            body,
            attributes: HashMap::new(),
            delivery_count: 1,
            redelivered: false,
            received_at: Timestamp::now(),
            acknowledger,
        }
    }

    /// Mark as a redelivery with the broker's delivery count
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self.redelivered = delivery_count > 1;
        self
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn received_at(&self) -> &Timestamp {
        &self.received_at
    }

    /// Ask the transport to settle this message
    pub async fn acknowledge(&self) -> Result<(), AckFailure> {
        self.acknowledger.acknowledge(&self.message_id).await
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("message_id", &self.message_id)
            .field("body_len", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .field("redelivered", &self.redelivered)
            .field("received_at", &self.received_at)
            .finish()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
