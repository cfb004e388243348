//! Monte Carlo Core - model broadcast and scenario evaluation over plain queues
//!
//! A single controller makes one "current model" visible to an unknown set of
//! competing workers using nothing but a work queue and message expiry:
//! 1. **Broadcast**: the model is one never-acked message with a TTL; workers peek it
//! 2. **Staleness**: a scenario whose keys differ from a worker's model triggers a resync
//! 3. **Aggregation**: the monitor resets its statistics when results name a new model

pub mod aggregator;
pub mod broadcast;
pub mod config;
pub mod controller;
pub mod formula;
pub mod generator;
pub mod loader;
pub mod model;
pub mod monitor;
pub mod wire;
pub mod worker;

// Re-export key types for convenience
pub use aggregator::{IngestOutcome, Liveness, ResultAggregator, StatsSnapshot, WorkerStats};
pub use broadcast::{GenerationHandle, GenerationLoop, GenerationReport, ModelBroadcaster, StopReason};
pub use config::{ConfigError, MonteCarloConfig, QueueNames};
pub use controller::{Controller, ControllerError};
pub use formula::{EvalError, Formula, FormulaError};
pub use generator::{generate_value, next_unique, ScenarioGenerator};
pub use loader::{FileModelLoader, ModelCatalog, ModelLoader};
pub use model::{DistributionKind, Model, ModelError, Scenario, VariableSpec};
pub use monitor::{CommandClient, Monitor, MonitorError};
pub use wire::{CodecError, Command, ResultRecord};
pub use worker::{DropReason, RequeueReason, ScenarioOutcome, SyncError, Worker, WorkerCounters, WorkerSync};
