//! Worker: syncs the model by peeking, evaluates scenarios, and resyncs
//! on its own when scenarios stop matching its model.

use crate::config::MonteCarloConfig;
use crate::formula::{Formula, FormulaError};
use crate::model::{Model, Scenario};
use crate::wire::{decode_model, decode_scenario, encode, CodecError, ResultRecord};
use montecarlo_env::{
    ConsumeOptions, Delivery, DeliveryTag, EnvError, MessageBroker, MonteCarloContext,
    PublishOptions, QueueOptions, StopSignal, WorkerId,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Worker errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No model available after {attempts} attempts")]
    ModelUnavailable { attempts: u32 },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Broker error: {0}")]
    Broker(#[from] EnvError),
}

/// Reads the resident model without consuming it.
pub struct WorkerSync<C: MonteCarloContext, B: MessageBroker> {
    context: Arc<C>,
    broker: Arc<B>,
    model_queue: String,
    attempts: u32,
    interval: Duration,
}

impl<C: MonteCarloContext, B: MessageBroker> WorkerSync<C, B> {
    pub fn new(context: Arc<C>, broker: Arc<B>, config: &MonteCarloConfig) -> Self {
        Self {
            context,
            broker,
            model_queue: config.queues.model.clone(),
            attempts: config.acquire_attempts.max(1),
            interval: config.acquire_interval(),
        }
    }

    /// One non-destructive read of the model queue.
    ///
    /// The message is returned to the queue with its original expiry, so
    /// every other worker can still read it.
    pub async fn peek_model(&self) -> Result<Option<Model>, SyncError> {
        match self.broker.peek(&self.model_queue).await? {
            Some(delivery) => Ok(Some(decode_model(&delivery.payload)?)),
            None => Ok(None),
        }
    }

    /// Polls for the model within the attempt budget.
    pub async fn acquire(&self) -> Result<Model, SyncError> {
        for attempt in 1..=self.attempts {
            match self.peek_model().await {
                Ok(Some(model)) => return Ok(model),
                Ok(None) => info!(attempt, attempts = self.attempts, "Waiting for model..."),
                Err(e) => warn!(attempt, error = %e, "Failed to read model"),
            }
            if attempt < self.attempts {
                self.context.sleep(self.interval).await;
            }
        }
        Err(SyncError::ModelUnavailable {
            attempts: self.attempts,
        })
    }
}

/// Why a scenario went back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// Key set did not match; the model was re-read
    Stale,

    /// Key set did not match and no model could be read
    ResyncFailed,

    /// Result could not be published
    PublishFailed,
}

/// Why a scenario was removed without being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Payload was not a scenario
    Undecodable,

    /// Formula failed to parse or evaluate
    EvaluationFailed,

    /// Matches neither the held model nor the resident one.
    ///
    /// Such a scenario was generated under a retired model, so no worker
    /// can ever evaluate it; requeueing would only cycle it forever. The
    /// live model's scenarios always match the resident model and are
    /// never dropped this way.
    OrphanScenario,
}

/// What happened to one delivered scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioOutcome {
    Evaluated(ResultRecord),
    Requeued(RequeueReason),
    Dropped(DropReason),
}

/// Per-worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounters {
    pub evaluated: u64,
    pub requeued: u64,
    pub dropped: u64,

    /// Staleness detections
    pub resyncs: u64,

    /// Model installs after the initial one
    pub model_changes: u64,
}

struct ActiveModel {
    model: Model,
    formula: Result<Formula, FormulaError>,
}

impl ActiveModel {
    fn new(model: Model) -> Self {
        let formula = Formula::parse(&model.formula);
        Self { model, formula }
    }
}

/// One competing consumer of the scenario queue.
pub struct Worker<C: MonteCarloContext, B: MessageBroker> {
    id: WorkerId,
    context: Arc<C>,
    broker: Arc<B>,
    sync: WorkerSync<C, B>,
    config: MonteCarloConfig,
    model: Option<ActiveModel>,

    /// Results under the current model; reset on model change
    processed: u64,

    counters: WorkerCounters,
}

impl<C: MonteCarloContext, B: MessageBroker> Worker<C, B> {
    pub fn new(id: WorkerId, context: Arc<C>, broker: Arc<B>, config: MonteCarloConfig) -> Self {
        let sync = WorkerSync::new(context.clone(), broker.clone(), &config);
        Self {
            id,
            context,
            broker,
            sync,
            config,
            model: None,
            processed: 0,
            counters: WorkerCounters::default(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref().map(|active| &active.model)
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn counters(&self) -> &WorkerCounters {
        &self.counters
    }

    pub fn sync(&self) -> &WorkerSync<C, B> {
        &self.sync
    }

    /// Declares the scenario and result queues and waits for a model.
    ///
    /// The model queue is not declared here; the controller owns its
    /// arguments. Fails with [`SyncError::ModelUnavailable`] when the
    /// polling budget runs out.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        for queue in [&self.config.queues.scenarios, &self.config.queues.results] {
            self.broker.declare(queue, QueueOptions::durable()).await?;
        }

        info!(worker = %self.id, "Waiting for model");
        let model = self.sync.acquire().await?;
        self.install(model);
        Ok(())
    }

    fn install(&mut self, model: Model) {
        let changed = self
            .model
            .as_ref()
            .map_or(true, |active| active.model != model);
        if !changed {
            return;
        }

        if self.model.is_some() {
            self.counters.model_changes += 1;
        }
        self.processed = 0;

        let active = ActiveModel::new(model);
        match &active.formula {
            Ok(_) => info!(
                worker = %self.id,
                model = %active.model.name,
                formula = %active.model.formula,
                variables = ?active.model.variable_names(),
                "✅ Model loaded"
            ),
            Err(e) => error!(
                worker = %self.id,
                model = %active.model.name,
                error = %e,
                "Model formula does not parse, its scenarios will be dropped"
            ),
        }
        self.model = Some(active);
    }

    /// Processes one delivery: evaluate, requeue, or drop it.
    pub async fn handle_delivery(&mut self, delivery: Delivery) -> Result<ScenarioOutcome, SyncError> {
        let scenario = match decode_scenario(&delivery.payload) {
            Ok(scenario) => scenario,
            Err(e) => {
                warn!(worker = %self.id, error = %e, "Dropping undecodable scenario");
                return self.drop_delivery(delivery.tag, DropReason::Undecodable).await;
            }
        };

        let matches = self
            .model
            .as_ref()
            .is_some_and(|active| active.model.matches(&scenario));
        if !matches {
            return self.resync(delivery.tag, &scenario).await;
        }

        let Some(active) = self.model.as_ref() else {
            return self.resync(delivery.tag, &scenario).await;
        };

        let evaluated = match &active.formula {
            Ok(formula) => formula.evaluate(&scenario).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let value = match evaluated {
            Ok(value) => value,
            Err(reason) => {
                warn!(worker = %self.id, %reason, "Evaluation failed, dropping scenario");
                return self.drop_delivery(delivery.tag, DropReason::EvaluationFailed).await;
            }
        };

        let record = ResultRecord {
            worker_id: self.id.clone(),
            scenario,
            value,
            timestamp: self.context.unix_timestamp(),
            model_name: active.model.name.clone(),
        };

        let published = match encode(&record) {
            Ok(payload) => self
                .broker
                .publish(&self.config.queues.results, payload, PublishOptions::persistent())
                .await
                .map_err(SyncError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            warn!(worker = %self.id, error = %e, "Result publish failed, requeueing scenario");
            self.broker.nack(delivery.tag, true).await?;
            self.counters.requeued += 1;
            return Ok(ScenarioOutcome::Requeued(RequeueReason::PublishFailed));
        }

        self.broker.ack(delivery.tag).await?;
        self.processed += 1;
        self.counters.evaluated += 1;
        if self.processed % self.config.worker_progress_every.max(1) == 0 {
            info!(
                worker = %self.id,
                processed = self.processed,
                last = value,
                "Scenarios processed"
            );
        }
        Ok(ScenarioOutcome::Evaluated(record))
    }

    /// Scenario does not match the held model: re-read the model once and
    /// put the scenario back.
    async fn resync(&mut self, tag: DeliveryTag, scenario: &Scenario) -> Result<ScenarioOutcome, SyncError> {
        self.counters.resyncs += 1;
        warn!(
            worker = %self.id,
            expected = ?self.model().map(Model::variable_names),
            received = ?scenario.keys().collect::<Vec<_>>(),
            "⚠️ Model change detected, reloading"
        );

        match self.sync.peek_model().await {
            Ok(Some(model)) => {
                let unchanged = self.model().is_some_and(|held| *held == model);
                if unchanged && !model.matches(scenario) {
                    warn!(worker = %self.id, "Scenario belongs to no resident model, dropping");
                    return self.drop_delivery(tag, DropReason::OrphanScenario).await;
                }

                self.install(model);
                self.requeue(tag, RequeueReason::Stale).await
            }
            Ok(None) => {
                warn!(worker = %self.id, "No model available to reload, keeping current one");
                self.stall(tag).await
            }
            Err(e) => {
                warn!(worker = %self.id, error = %e, "Model reload failed, keeping current one");
                self.stall(tag).await
            }
        }
    }

    async fn stall(&mut self, tag: DeliveryTag) -> Result<ScenarioOutcome, SyncError> {
        let outcome = self.requeue(tag, RequeueReason::ResyncFailed).await?;
        self.context.sleep(self.config.acquire_interval()).await;
        Ok(outcome)
    }

    async fn requeue(&mut self, tag: DeliveryTag, reason: RequeueReason) -> Result<ScenarioOutcome, SyncError> {
        self.broker.nack(tag, true).await?;
        self.counters.requeued += 1;
        debug!(worker = %self.id, ?reason, "Scenario requeued");
        Ok(ScenarioOutcome::Requeued(reason))
    }

    async fn drop_delivery(&mut self, tag: DeliveryTag, reason: DropReason) -> Result<ScenarioOutcome, SyncError> {
        match reason {
            DropReason::EvaluationFailed => self.broker.ack(tag).await?,
            DropReason::Undecodable | DropReason::OrphanScenario => {
                self.broker.nack(tag, false).await?
            }
        }
        self.counters.dropped += 1;
        Ok(ScenarioOutcome::Dropped(reason))
    }

    /// Consumes scenarios until `shutdown` is raised or the session closes.
    pub async fn run(&mut self, shutdown: Arc<StopSignal>) -> Result<WorkerCounters, SyncError> {
        let consumer = self
            .broker
            .consume(
                &self.config.queues.scenarios,
                ConsumeOptions::manual(self.config.worker_prefetch),
            )
            .await?;
        info!(worker = %self.id, "Processing scenarios");

        let broker = self.broker.clone();
        loop {
            let delivery = tokio::select! {
                _ = shutdown.wait() => break,
                received = broker.recv(&consumer) => match received {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            match self.handle_delivery(delivery).await {
                Ok(_) => {}
                Err(SyncError::Broker(EnvError::SessionClosed)) => break,
                Err(e) => warn!(worker = %self.id, error = %e, "Failed to settle scenario"),
            }
        }

        self.broker.close().await;
        info!(
            worker = %self.id,
            processed = self.processed,
            evaluated = self.counters.evaluated,
            "Worker stopped"
        );
        Ok(self.counters.clone())
    }
}
