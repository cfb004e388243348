//! Error types for the broker/environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Could not open a broker session
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The session was closed (locally or by the broker)
    #[error("Session closed")]
    SessionClosed,

    /// Passive declare or consume against a queue that does not exist
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Queue redeclared with arguments that differ from the existing queue
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Ack/nack of a delivery tag this session does not hold
    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    /// Publish rejected (broker unreachable, flow control, etc.)
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Creates a publish error.
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::PublishFailed(msg.into())
    }

    /// Creates a queue-not-found error.
    pub fn not_found(queue: impl std::fmt::Display) -> Self {
        Self::QueueNotFound(queue.to_string())
    }

    /// True for faults worth retrying after a short pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EnvError::ConnectionError(_) | EnvError::PublishFailed(_) | EnvError::Timeout(_)
        )
    }
}
