//! Error types for connection, binding, acknowledgment and delivery.

use crate::message::{BindingId, MessageId};
use std::time::Duration;
use thiserror::Error;

/// Umbrella error for operations in the flow runtime
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Bind failed: {0}")]
    Bind(#[from] BindError),

    #[error("Acknowledgment failed: {0}")]
    Ack(#[from] AckFailure),

    #[error("Delivery callback failed: {0}")]
    Callback(#[from] CallbackError),

    #[error("Receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },
}

impl FlowError {
    /// Check if error is transient and the operation may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(e) => e.is_transient(),
            Self::Bind(e) => e.is_transient(),
            Self::Ack(_) => true,
            Self::Callback(_) => true,
            Self::Receiver(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
            Self::QueueNotFound { .. } => false,
        }
    }
}

/// Failure to establish the transport session at startup
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Broker at {host} is unreachable: {message}")]
    Unreachable { host: String, message: String },

    #[error("Authentication failed for user '{username}'")]
    AuthenticationFailed { username: String },

    #[error("Invalid connection properties: {message}")]
    InvalidProperties { message: String },
}

impl ConnectError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Failure to establish or re-establish a receiver on a queue
#[derive(Debug, Error)]
pub enum BindError {
    #[error("Connection is unavailable: {message}")]
    ConnectionUnavailable { message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Invalid queue name: {0}")]
    InvalidQueueName(#[from] ValidationError),

    #[error("Queue '{queue_name}' already has an active binding ({binding_id})")]
    ExclusiveBindingActive {
        queue_name: String,
        binding_id: BindingId,
    },

    #[error("Receiver bound but could not be started: {0}")]
    StartFailed(#[from] ReceiverError),
}

impl BindError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionUnavailable { .. } => true,
            Self::QueueNotFound { .. } => false,
            Self::InvalidQueueName(_) => false,
            Self::ExclusiveBindingActive { .. } => true,
            Self::StartFailed(_) => true,
        }
    }
}

/// Per-message acknowledgment failure reported by the transport
#[derive(Debug, Error)]
pub enum AckFailure {
    #[error("Acknowledgment of {message_id} rejected: {reason}")]
    Rejected {
        message_id: MessageId,
        reason: String,
    },

    #[error("Acknowledgment of {message_id} timed out after {timeout:?}")]
    Timeout {
        message_id: MessageId,
        timeout: Duration,
    },

    #[error("Transport unavailable while acknowledging {message_id}")]
    TransportUnavailable { message_id: MessageId },
}

impl AckFailure {
    /// Message the failed acknowledgment was about
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Rejected { message_id, .. } => message_id,
            Self::Timeout { message_id, .. } => message_id,
            Self::TransportUnavailable { message_id } => message_id,
        }
    }
}

/// Failure to hand a delivered message over to the pending buffer
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Intake for binding {binding_id} is closed; dropped {message_id}")]
    IntakeClosed {
        binding_id: BindingId,
        message_id: MessageId,
    },
}

/// Errors raised by a receiver handle
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Receiver {binding_id} is closed and cannot be reused")]
    Closed { binding_id: BindingId },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
