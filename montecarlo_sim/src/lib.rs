//! Monte Carlo Deterministic Simulation Harness
//!
//! Runs the whole cluster (controller, any number of workers, monitor) in one
//! process against an in-memory broker, on a paused tokio clock:
//! - **Time**: virtual; TTLs, settle delays and pacing elapse instantly
//! - **Broker**: queues with TTL, requeue, prefetch and fault injection
//! - **Randomness**: every scenario stream derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        SimCluster                          │
//! │  ┌────────────┐   modelo / escenarios   ┌──────────────┐   │
//! │  │ Controller │ ──────────────────────► │  Worker × N  │   │
//! │  └─────▲──────┘                         └──────┬───────┘   │
//! │        │ comandos                              │ resultados│
//! │  ┌─────┴──────┐                                │           │
//! │  │  Monitor   │ ◄──────────────────────────────┘           │
//! │  └────────────┘                                            │
//! │            SimBrokerServer (paused tokio clock)            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use montecarlo_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 3).run(ScenarioId::ModelSwap);
//! assert!(result.passed);
//! ```

mod broker;
pub mod catalog;
mod context;
mod exporter;
mod runner;
pub mod scenarios;
mod world;

pub use broker::{BrokerStats, SimBroker, SimBrokerFaults, SimBrokerServer};
pub use context::SimContext;
pub use exporter::SimExport;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{ClusterReport, MonitorReport, SimCluster, WorkerReport};
