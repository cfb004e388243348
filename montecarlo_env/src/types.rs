//! Common types for the broker abstraction.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Identifier a worker stamps on every result it publishes.
///
/// Free-form on the wire (operators usually pass `1`, `2`, ...); when none is
/// given a short random id is minted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Creates a new random WorkerId.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..8].to_string())
    }

    /// Creates a deterministic WorkerId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes).simple().to_string()[..8].to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-assigned handle for one delivery, scoped to the session that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// Handle for a registered consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag {
    /// Session-local consumer number
    pub id: u64,

    /// Queue the consumer is attached to
    pub queue: String,
}

/// A message handed to a session, awaiting ack/nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Handle to acknowledge or reject this delivery
    pub tag: DeliveryTag,

    /// Queue the message came from
    pub queue: String,

    /// Raw message body (UTF-8 JSON in this system)
    pub payload: Vec<u8>,

    /// True if the message was requeued at least once before
    pub redelivered: bool,
}

impl Delivery {
    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Arguments for declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,

    /// Queue-wide message lifetime (`x-message-ttl`)
    pub message_ttl: Option<Duration>,
}

impl QueueOptions {
    /// A plain durable queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            message_ttl: None,
        }
    }

    /// A durable queue whose messages expire after `ttl`.
    pub fn durable_with_ttl(ttl: Duration) -> Self {
        Self {
            durable: true,
            message_ttl: Some(ttl),
        }
    }
}

/// Per-message publish properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    /// Delivery mode 2
    pub persistent: bool,

    /// Per-message lifetime, counted from first enqueue
    pub expiration: Option<Duration>,
}

impl PublishOptions {
    /// Persistent message with no expiration.
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            expiration: None,
        }
    }

    /// Persistent message that expires after `ttl`.
    pub fn persistent_with_ttl(ttl: Duration) -> Self {
        Self {
            persistent: true,
            expiration: Some(ttl),
        }
    }
}

/// Acknowledgement mode for a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Deliveries must be acked/nacked explicitly
    Manual,
    /// Deliveries are acknowledged as soon as they are dispatched
    Auto,
}

/// Arguments for registering a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries outstanding on this consumer
    pub prefetch: u16,

    /// Acknowledgement mode
    pub ack_mode: AckMode,
}

impl ConsumeOptions {
    /// Manual-ack consumer with the given prefetch window.
    pub fn manual(prefetch: u16) -> Self {
        Self {
            prefetch,
            ack_mode: AckMode::Manual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_from_seed_is_deterministic() {
        assert_eq!(WorkerId::from_seed(7), WorkerId::from_seed(7));
        assert_ne!(WorkerId::from_seed(7), WorkerId::from_seed(8));
        assert_eq!(WorkerId::from_seed(7).as_str().len(), 8);
    }

    #[test]
    fn test_worker_id_display_is_raw_string() {
        let id = WorkerId::from("3");
        assert_eq!(id.to_string(), "3");
        assert_eq!(id.as_str(), "3");
    }

    #[test]
    fn test_queue_and_publish_options() {
        let q = QueueOptions::durable_with_ttl(Duration::from_secs(60));
        assert!(q.durable);
        assert_eq!(q.message_ttl, Some(Duration::from_secs(60)));
        assert_eq!(QueueOptions::durable().message_ttl, None);

        let p = PublishOptions::persistent_with_ttl(Duration::from_millis(500));
        assert!(p.persistent);
        assert_eq!(p.expiration, Some(Duration::from_millis(500)));
    }
}
