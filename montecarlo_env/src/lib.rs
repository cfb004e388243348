//! Monte Carlo Cluster Environment Abstraction Layer
//!
//! This crate provides the seams that let the controller, the workers and the
//! monitor run against a **production** runtime (tokio + a real broker) or the
//! **simulation** harness (paused clock + in-memory broker).
//!
//! # Core Concept: Queue-Only Coordination
//!
//! Components never talk to each other directly. Everything crosses a
//! [`MessageBroker`]: durable named queues with at-least-once delivery,
//! explicit ack/nack, per-message and per-queue TTL, purge and a passive
//! occupancy count. Time, sleeping and task spawning go through a
//! [`MonteCarloContext`] so a simulation can control them.
//!
//! # Example
//!
//! ```ignore
//! use montecarlo_env::{MessageBroker, MonteCarloContext, ConsumeOptions};
//!
//! async fn drain<Ctx: MonteCarloContext, B: MessageBroker>(ctx: &Ctx, broker: &B) {
//!     let consumer = broker.consume("resultados", ConsumeOptions::manual(50)).await?;
//!     while let Some(delivery) = broker.recv(&consumer).await {
//!         handle(delivery.payload);
//!         broker.ack(delivery.tag).await?;
//!     }
//! }
//! ```

mod broker;
mod context;
mod error;
mod signal;
mod tokio_impl;
mod types;

pub use broker::{BrokerConnector, MessageBroker};
pub use context::MonteCarloContext;
pub use error::EnvError;
pub use signal::StopSignal;
pub use tokio_impl::TokioContext;
pub use types::{
    AckMode, ConsumeOptions, ConsumerTag, Delivery, DeliveryTag, PublishOptions, QueueOptions,
    WorkerId,
};
