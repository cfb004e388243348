//! Model broadcast over a TTL-bounded queue and the scenario generation loop.
//!
//! The model queue holds exactly one message. Nobody acks it away: workers
//! peek it, and it disappears only when its TTL runs out or the controller
//! purges it for a replacement. The generation loop uses the presence of
//! that message as its liveness signal.

use crate::config::{MonteCarloConfig, QueueNames};
use crate::controller::ControllerError;
use crate::generator::ScenarioGenerator;
use crate::model::{Model, Scenario};
use crate::wire::encode;
use montecarlo_env::{
    EnvError, MessageBroker, MonteCarloContext, PublishOptions, QueueOptions, StopSignal,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Publishes models and manages the queue topology on one session.
pub struct ModelBroadcaster<B: MessageBroker> {
    broker: Arc<B>,
    queues: QueueNames,
    ttl: Duration,
}

impl<B: MessageBroker> ModelBroadcaster<B> {
    pub fn new(broker: Arc<B>, queues: QueueNames, ttl: Duration) -> Self {
        Self {
            broker,
            queues,
            ttl,
        }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    /// Declares the model queue with its TTL and the other three as durable.
    ///
    /// If the model queue already exists with different arguments it is
    /// re-declared without the TTL; the per-message expiration still bounds
    /// the model's lifetime.
    pub async fn declare_topology(&self) -> Result<(), EnvError> {
        match self
            .broker
            .declare(&self.queues.model, QueueOptions::durable_with_ttl(self.ttl))
            .await
        {
            Ok(()) => {}
            Err(EnvError::PreconditionFailed(reason)) => {
                warn!(queue = %self.queues.model, %reason, "Model queue already exists, keeping its arguments");
                self.broker
                    .declare(&self.queues.model, QueueOptions::durable())
                    .await?;
            }
            Err(e) => return Err(e),
        }

        for queue in [
            &self.queues.scenarios,
            &self.queues.results,
            &self.queues.commands,
        ] {
            self.broker.declare(queue, QueueOptions::durable()).await?;
        }
        Ok(())
    }

    /// Replaces the resident model.
    ///
    /// Purges the model and scenario queues (failures ignored) and publishes
    /// `model` as a persistent message expiring after the TTL.
    pub async fn publish(&self, model: &Model) -> Result<(), ControllerError> {
        for queue in [&self.queues.model, &self.queues.scenarios] {
            match self.broker.purge(queue).await {
                Ok(removed) => debug!(queue = %queue, removed, "Queue purged"),
                Err(e) => debug!(queue = %queue, error = %e, "Purge failed, continuing"),
            }
        }

        let payload = encode(model)?;
        self.broker
            .publish(
                &self.queues.model,
                payload,
                PublishOptions::persistent_with_ttl(self.ttl),
            )
            .await?;

        info!(
            model = %model.name,
            queue = %self.queues.model,
            ttl_secs = self.ttl.as_secs_f64(),
            "📡 Model published"
        );
        Ok(())
    }

    /// True while the model message is still resident (not expired, not purged).
    ///
    /// Any broker error counts as "not resident".
    pub async fn model_resident(&self) -> bool {
        match self.broker.passive_declare(&self.queues.model).await {
            Ok(count) => count > 0,
            Err(e) => {
                debug!(error = %e, "Model queue check failed");
                false
            }
        }
    }

    /// Deletes all four queues; missing queues are fine.
    ///
    /// Returns the number of ready messages discarded.
    pub async fn reset_queues(&self) -> Result<u32, EnvError> {
        let mut discarded = 0;
        for queue in self.queues.all() {
            match self.broker.delete(queue).await {
                Ok(count) => {
                    info!(queue, count, "Queue deleted");
                    discarded += count;
                }
                Err(EnvError::QueueNotFound(_)) => debug!(queue, "Queue did not exist"),
                Err(e) => return Err(e),
            }
        }
        Ok(discarded)
    }
}

/// Why a generation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Stop signal raised (swap, stop command, shutdown)
    Stopped,

    /// The model message expired or was removed
    Expired,

    /// A publish failed with an error that retrying cannot clear
    /// (closed session, missing queue, ...)
    SessionLost,
}

/// Counters of one generation loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationReport {
    pub model_name: String,

    /// Scenarios published
    pub total: u64,

    /// Published scenarios that passed the uniqueness check
    pub unique: u64,

    /// Published scenarios accepted as duplicates after exhausting retries
    pub fallbacks: u64,

    /// Transient publish errors survived
    pub publish_failures: u64,

    pub stop_reason: StopReason,
}

/// Continuously generates unique scenarios for one model.
///
/// Runs on its own session, never the command listener's.
pub struct GenerationLoop<C: MonteCarloContext, B: MessageBroker> {
    context: Arc<C>,
    broadcaster: ModelBroadcaster<B>,
    model: Model,
    generator: ScenarioGenerator,
    stop: Arc<StopSignal>,
    config: MonteCarloConfig,
}

impl<C: MonteCarloContext, B: MessageBroker> GenerationLoop<C, B> {
    pub fn new(
        context: Arc<C>,
        broker: Arc<B>,
        model: Model,
        seed: u64,
        config: MonteCarloConfig,
    ) -> Self {
        let broadcaster =
            ModelBroadcaster::new(broker, config.queues.clone(), config.model_ttl());
        Self {
            context,
            broadcaster,
            model,
            generator: ScenarioGenerator::seeded(seed, config.max_unique_attempts as usize),
            stop: StopSignal::shared(),
            config,
        }
    }

    /// Signal that ends this loop once raised.
    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    /// Runs until stopped, the model expires, or the session is lost.
    ///
    /// Closes its session on exit.
    pub async fn run(mut self) -> GenerationReport {
        let mut report = GenerationReport {
            model_name: self.model.name.clone(),
            total: 0,
            unique: 0,
            fallbacks: 0,
            publish_failures: 0,
            stop_reason: StopReason::Stopped,
        };
        let check_every = self.config.expiry_check_every.max(1);
        let progress_every = self.config.progress_every.max(1);
        let mut pending: Option<(Scenario, bool)> = None;
        let mut last_check = None;

        info!(model = %self.model.name, "🎲 Scenario generation started");

        report.stop_reason = loop {
            if self.stop.is_triggered() {
                break StopReason::Stopped;
            }

            if report.total > 0 && report.total % check_every == 0 && last_check != Some(report.total) {
                last_check = Some(report.total);
                if !self.broadcaster.model_resident().await {
                    warn!(
                        model = %self.model.name,
                        generated = report.total,
                        "⏱️ Model expired, stopping generation"
                    );
                    break StopReason::Expired;
                }
            }

            let (scenario, unique) = match pending.take() {
                Some(retry) => retry,
                None => self.generator.next_unique(&self.model),
            };

            let payload = match encode(&scenario) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to encode scenario, skipping");
                    continue;
                }
            };

            match self
                .broadcaster
                .broker()
                .publish(
                    &self.broadcaster.queues().scenarios,
                    payload,
                    PublishOptions::persistent(),
                )
                .await
            {
                Ok(()) => {
                    report.total += 1;
                    if unique {
                        report.unique += 1;
                    } else {
                        report.fallbacks += 1;
                        debug!(total = report.total, "Accepted duplicate scenario");
                    }
                    if report.total % progress_every == 0 {
                        info!(
                            model = %self.model.name,
                            total = report.total,
                            distinct = self.generator.distinct(),
                            "Scenarios generated"
                        );
                    }
                }
                Err(e) if e.is_transient() => {
                    report.publish_failures += 1;
                    warn!(error = %e, "Scenario publish failed, retrying");
                    pending = Some((scenario, unique));
                    self.context.sleep(self.config.publish_retry()).await;
                    continue;
                }
                Err(e) => {
                    warn!(model = %self.model.name, error = %e, "Generation session lost");
                    break StopReason::SessionLost;
                }
            }

            self.context.sleep(self.config.scenario_interval()).await;
        };

        self.broadcaster.broker().close().await;
        info!(
            model = %report.model_name,
            total = report.total,
            reason = ?report.stop_reason,
            "Scenario generation finished"
        );
        report
    }
}

/// A spawned generation loop.
pub struct GenerationHandle {
    model_name: String,
    stop: Arc<StopSignal>,
    task: JoinHandle<GenerationReport>,
}

impl GenerationHandle {
    /// Spawns `generation` on the context.
    pub fn spawn<C: MonteCarloContext, B: MessageBroker>(
        context: &C,
        generation: GenerationLoop<C, B>,
    ) -> Self {
        let model_name = generation.model.name.clone();
        let stop = generation.stop_signal();
        let task = context.spawn("generation", generation.run());
        Self {
            model_name,
            stop,
            task,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// False once the loop has ended on its own or been stopped.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signals the loop and waits for it, at most `timeout`.
    ///
    /// A loop that does not finish in time is detached and `None` returned.
    pub async fn stop<C: MonteCarloContext>(
        mut self,
        context: &C,
        timeout: Duration,
    ) -> Option<GenerationReport> {
        self.stop.trigger();
        tokio::select! {
            joined = &mut self.task => match joined {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(model = %self.model_name, error = %e, "Generation task failed");
                    None
                }
            },
            _ = context.sleep(timeout) => {
                warn!(
                    model = %self.model_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Generation loop did not stop in time, detaching"
                );
                None
            }
        }
    }
}
