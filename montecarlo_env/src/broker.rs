//! Message broker abstraction shared by controller, workers and monitor.

use crate::error::EnvError;
use crate::types::{ConsumeOptions, ConsumerTag, Delivery, DeliveryTag, PublishOptions, QueueOptions};
use async_trait::async_trait;
use std::sync::Arc;

/// One broker session (connection + channel).
///
/// Sessions are never shared between concurrent loops: each loop opens its
/// own through a [`BrokerConnector`] so protocol frames never interleave.
///
/// # Implementations
///
/// - **Production**: an AMQP client session
/// - **Simulation**: `SimBroker`, an in-memory broker on the context clock
///
/// # Message Flow
///
/// ```text
/// Publisher                 Queue                     Consumer
///   |                         |                           |
///   |-- publish(q, body) ---->|                           |
///   |                         |-- recv()/get() ---------->|
///   |                         |<------- ack / nack(requeue)|
/// ```
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Declares (creates or asserts) a queue.
    ///
    /// # Returns
    /// * `Ok(())` - Queue exists with compatible arguments
    /// * `Err(EnvError::PreconditionFailed)` - Queue exists with a different TTL
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), EnvError>;

    /// Counts ready messages in a queue without creating it.
    ///
    /// # Returns
    /// * `Ok(count)` - Number of ready (not in-flight, not expired) messages
    /// * `Err(EnvError::QueueNotFound)` - The queue does not exist
    async fn passive_declare(&self, queue: &str) -> Result<u32, EnvError>;

    /// Publishes a payload to a queue.
    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), EnvError>;

    /// Fetches a single message without acknowledging it.
    ///
    /// Returns `Ok(None)` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, EnvError>;

    /// Registers a consumer on a queue.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<ConsumerTag, EnvError>;

    /// Receives the next delivery for a consumer.
    ///
    /// # Returns
    /// * `Some(delivery)` - A message was dispatched to this consumer
    /// * `None` - The session was closed (shutdown)
    ///
    /// # Blocking
    /// Blocks until a message arrives, the prefetch window frees up, or the
    /// session closes.
    async fn recv(&self, consumer: &ConsumerTag) -> Option<Delivery>;

    /// Acknowledges a delivery, removing it permanently.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), EnvError>;

    /// Rejects a delivery; with `requeue` it goes back to the head of its
    /// queue keeping its original expiry, otherwise it is dropped.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), EnvError>;

    /// Removes all ready messages; returns how many were removed.
    async fn purge(&self, queue: &str) -> Result<u32, EnvError>;

    /// Deletes a queue; returns how many ready messages it held.
    async fn delete(&self, queue: &str) -> Result<u32, EnvError>;

    /// Closes the session. Outstanding deliveries are requeued and blocked
    /// `recv` calls return `None`.
    async fn close(&self);

    /// Non-destructive read of the head of a queue.
    ///
    /// Implemented as a non-acknowledged [`get`](Self::get) immediately
    /// followed by `nack(requeue = true)`, so the message stays visible to
    /// other consumers and keeps its original expiry timer. The returned
    /// delivery's tag is already spent.
    async fn peek(&self, queue: &str) -> Result<Option<Delivery>, EnvError> {
        match self.get(queue).await? {
            Some(delivery) => {
                self.nack(delivery.tag, true).await?;
                Ok(Some(delivery))
            }
            None => Ok(None),
        }
    }
}

/// Opens independent broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Session: MessageBroker;

    /// Opens a new session.
    async fn connect(&self) -> Result<Arc<Self::Session>, EnvError>;
}
