//! Monitor: issues commands and turns the result stream into live statistics.

use crate::aggregator::{IngestOutcome, Liveness, ResultAggregator, StatsSnapshot};
use crate::config::MonteCarloConfig;
use crate::wire::{decode_result, encode_command, CodecError, Command};
use montecarlo_env::{
    ConsumeOptions, Delivery, EnvError, MessageBroker, MonteCarloContext, PublishOptions,
    QueueOptions, StopSignal,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Monitor errors.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Broker error: {0}")]
    Broker(#[from] EnvError),
}

/// Publishes commands for the controller.
///
/// Holds its own session when used alongside a running [`Monitor`].
pub struct CommandClient<C: MonteCarloContext, B: MessageBroker> {
    context: Arc<C>,
    broker: Arc<B>,
    queue: String,
}

impl<C: MonteCarloContext, B: MessageBroker> CommandClient<C, B> {
    pub fn new(context: Arc<C>, broker: Arc<B>, config: &MonteCarloConfig) -> Self {
        Self {
            context,
            broker,
            queue: config.queues.commands.clone(),
        }
    }

    /// Asks the controller to switch to `model_ref`.
    pub async fn request_swap(&self, model_ref: &str) -> Result<(), MonitorError> {
        let command = Command::swap(model_ref, self.context.unix_timestamp());
        self.send(command).await?;
        info!(model_ref, "📤 Model change requested");
        Ok(())
    }

    /// Asks the controller to stop generating.
    pub async fn request_stop(&self) -> Result<(), MonitorError> {
        let command = Command::Stop {
            timestamp: Some(self.context.unix_timestamp()),
        };
        self.send(command).await?;
        info!("📤 Stop requested");
        Ok(())
    }

    /// Publishes any command, persistent.
    pub async fn send(&self, command: Command) -> Result<(), MonitorError> {
        let payload = encode_command(command)?;
        self.broker
            .publish(&self.queue, payload, PublishOptions::persistent())
            .await?;
        Ok(())
    }
}

/// Owns the aggregate statistics; the only consumer of results.
pub struct Monitor<C: MonteCarloContext, B: MessageBroker> {
    context: Arc<C>,
    broker: Arc<B>,
    config: MonteCarloConfig,
    commands: CommandClient<C, B>,
    aggregator: ResultAggregator,
    malformed: u64,
}

impl<C: MonteCarloContext, B: MessageBroker> Monitor<C, B> {
    pub fn new(context: Arc<C>, broker: Arc<B>, config: MonteCarloConfig) -> Self {
        let aggregator = ResultAggregator::new(config.quiet_period());
        let commands = CommandClient::new(context.clone(), broker.clone(), &config);
        Self {
            context,
            broker,
            config,
            commands,
            aggregator,
            malformed: 0,
        }
    }

    pub fn aggregator(&self) -> &ResultAggregator {
        &self.aggregator
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.aggregator.snapshot(self.context.now())
    }

    /// Result payloads that could not be decoded.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Declares the command and result queues.
    pub async fn declare(&self) -> Result<(), MonitorError> {
        for queue in [&self.config.queues.commands, &self.config.queues.results] {
            self.broker.declare(queue, QueueOptions::durable()).await?;
        }
        Ok(())
    }

    /// Asks the controller to switch to `model_ref`.
    ///
    /// Statistics are left alone; they reset when the first result of the
    /// new model arrives.
    pub async fn request_swap(&self, model_ref: &str) -> Result<(), MonitorError> {
        self.commands.request_swap(model_ref).await
    }

    pub async fn request_stop(&self) -> Result<(), MonitorError> {
        self.commands.request_stop().await
    }

    /// Folds one result payload in; malformed payloads are counted and skipped.
    pub fn ingest(&mut self, payload: &[u8]) -> Option<IngestOutcome> {
        let result = match decode_result(payload) {
            Ok(result) => result,
            Err(e) => {
                self.malformed += 1;
                warn!(error = %e, "Skipping malformed result");
                return None;
            }
        };

        let outcome = self.aggregator.ingest(&result, self.context.now());
        if let IngestOutcome::ModelChanged { previous, current } = &outcome {
            info!(previous = %previous, current = %current, "🔄 Model change detected, statistics reset");
        }
        Some(outcome)
    }

    async fn settle(&mut self, delivery: Delivery) {
        self.ingest(&delivery.payload);
        if let Err(e) = self.broker.ack(delivery.tag).await {
            warn!(error = %e, "Failed to acknowledge result");
        }
    }

    /// Runs the silence watchdog and logs the current statistics, one line
    /// per worker after the summary. Returns the snapshot it logged.
    pub fn refresh(&mut self) -> StatsSnapshot {
        let now = self.context.now();
        if let Liveness::PossiblyExpired { silent_for } = self.aggregator.check_liveness(now) {
            warn!(
                model = ?self.aggregator.model_name(),
                silent_secs = silent_for.as_secs_f64(),
                "⏱️ No results received, model may have expired"
            );
        }

        let snap = self.aggregator.snapshot(now);
        if snap.count > 0 {
            info!(
                model = ?snap.model_name,
                count = snap.count,
                mean = snap.mean,
                std = snap.std_dev,
                min = snap.min,
                max = snap.max,
                elapsed_secs = snap.elapsed.as_secs_f64(),
                throughput = snap.throughput,
                workers = snap.workers.len(),
                "📊 Statistics"
            );
            for share in &snap.workers {
                info!(
                    worker = %share.worker_id,
                    count = share.count,
                    share_pct = share.share_pct,
                    last_value = share.last_value,
                    "Worker share"
                );
            }
        }
        snap
    }

    /// Drains results until `shutdown` is raised or the session closes.
    ///
    /// Every result is acknowledged. Statistics and the watchdog refresh on
    /// their own cadence regardless of traffic.
    pub async fn run(&mut self, shutdown: Arc<StopSignal>) -> Result<StatsSnapshot, MonitorError> {
        let consumer = self
            .broker
            .consume(
                &self.config.queues.results,
                ConsumeOptions::manual(self.config.result_prefetch),
            )
            .await?;
        info!(queue = %consumer.queue, "Monitoring results");

        let broker = self.broker.clone();
        let context = self.context.clone();
        let refresh = self.config.refresh_interval();
        let mut next_refresh = context.now() + refresh;

        loop {
            let wait = next_refresh.saturating_sub(context.now());
            tokio::select! {
                _ = shutdown.wait() => break,
                received = broker.recv(&consumer) => match received {
                    Some(delivery) => self.settle(delivery).await,
                    None => break,
                },
                _ = context.sleep(wait) => {}
            }

            if context.now() >= next_refresh {
                self.refresh();
                next_refresh = context.now() + refresh;
            }
        }

        self.broker.close().await;
        Ok(self.snapshot())
    }
}
