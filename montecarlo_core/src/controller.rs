//! Controller: owns the active model, broadcasts it, drives generation and
//! serves monitor commands.

use crate::broadcast::{GenerationHandle, GenerationLoop, GenerationReport, ModelBroadcaster};
use crate::config::MonteCarloConfig;
use crate::loader::ModelLoader;
use crate::model::{Model, ModelError};
use crate::wire::{decode_command, CodecError, Command};
use montecarlo_env::{
    BrokerConnector, ConsumeOptions, EnvError, MessageBroker, MonteCarloContext, QueueOptions,
    StopSignal,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Controller errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Broker error: {0}")]
    Broker(#[from] EnvError),

    #[error("No model loaded")]
    NoModel,
}

/// The single producer of models and scenarios.
///
/// Holds two kinds of broker sessions: one for commands and model
/// publication, and a fresh one per generation loop.
pub struct Controller<C, K, L>
where
    C: MonteCarloContext,
    K: BrokerConnector,
    L: ModelLoader,
{
    context: Arc<C>,
    connector: Arc<K>,
    loader: L,
    config: MonteCarloConfig,
    broadcaster: ModelBroadcaster<K::Session>,

    /// Model most recently published
    current_model: Option<Model>,

    generation: Option<GenerationHandle>,

    /// Incremented per published model; seeds each generation's RNG
    epoch: u64,

    /// Reports of finished generation loops, oldest first
    reports: Vec<GenerationReport>,
}

impl<C, K, L> Controller<C, K, L>
where
    C: MonteCarloContext,
    K: BrokerConnector,
    L: ModelLoader,
{
    /// Opens the command session and declares the queue topology.
    pub async fn connect(
        context: Arc<C>,
        connector: Arc<K>,
        loader: L,
        config: MonteCarloConfig,
    ) -> Result<Self, ControllerError> {
        let session = connector.connect().await?;
        let broadcaster = ModelBroadcaster::new(session, config.queues.clone(), config.model_ttl());
        broadcaster.declare_topology().await?;
        info!("✅ Controller connected");

        Ok(Self {
            context,
            connector,
            loader,
            config,
            broadcaster,
            current_model: None,
            generation: None,
            epoch: 0,
            reports: Vec::new(),
        })
    }

    pub fn current_model(&self) -> Option<&Model> {
        self.current_model.as_ref()
    }

    /// True while a generation loop is producing scenarios.
    pub fn is_generating(&self) -> bool {
        self.generation.as_ref().is_some_and(GenerationHandle::is_running)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn reports(&self) -> &[GenerationReport] {
        &self.reports
    }

    pub fn broadcaster(&self) -> &ModelBroadcaster<K::Session> {
        &self.broadcaster
    }

    /// Replaces the active model.
    ///
    /// Stops current generation first. If loading fails the error is
    /// returned and generation stays stopped; the previous model is not
    /// restarted.
    pub async fn swap(&mut self, reference: &str) -> Result<(), ControllerError> {
        self.stop_generation().await;

        let model = self.loader.load(reference)?;
        self.broadcaster.publish(&model).await?;
        self.current_model = Some(model);
        self.epoch += 1;

        // Give workers a chance to observe the new model before scenarios flow.
        self.context.sleep(self.config.settle_delay()).await;

        self.start_generation().await
    }

    /// Starts a generation loop for the current model on a new session.
    pub async fn start_generation(&mut self) -> Result<(), ControllerError> {
        let model = self.current_model.clone().ok_or(ControllerError::NoModel)?;
        self.stop_generation().await;

        let session = self.connector.connect().await?;
        session
            .declare(&self.config.queues.scenarios, QueueOptions::durable())
            .await?;

        let seed = self.context.derive_seed(self.epoch);
        let generation = GenerationLoop::new(
            self.context.clone(),
            session,
            model,
            seed,
            self.config.clone(),
        );
        self.generation = Some(GenerationHandle::spawn(self.context.as_ref(), generation));
        Ok(())
    }

    /// Stops generation with a bounded join. No-op when idle.
    pub async fn stop_generation(&mut self) {
        let Some(handle) = self.generation.take() else {
            return;
        };

        let model = handle.model_name().to_string();
        if let Some(report) = handle.stop(self.context.as_ref(), self.config.join_timeout()).await {
            info!(
                model = %model,
                total = report.total,
                fallbacks = report.fallbacks,
                "Generation stopped"
            );
            self.reports.push(report);
        }
    }

    /// Applies one command.
    pub async fn handle_command(&mut self, command: Command) -> Result<(), ControllerError> {
        match command {
            Command::SwapModel { model_ref, .. } => {
                info!(model_ref = %model_ref, "🔄 Swapping model");
                self.swap(&model_ref).await
            }
            Command::Stop { .. } => {
                info!("⏹️ Stop requested");
                self.stop_generation().await;
                Ok(())
            }
            Command::Unknown(kind) => {
                warn!(command = %kind, "Ignoring unknown command");
                Ok(())
            }
        }
    }

    /// Deletes every queue this system uses.
    pub async fn reset_queues(&mut self) -> Result<u32, ControllerError> {
        self.stop_generation().await;
        self.current_model = None;
        Ok(self.broadcaster.reset_queues().await?)
    }

    /// Serves commands until `shutdown` is raised or the session closes,
    /// then shuts down.
    ///
    /// Malformed commands are rejected without requeue; failed commands are
    /// logged and acknowledged.
    pub async fn run(&mut self, shutdown: Arc<StopSignal>) -> Result<(), ControllerError> {
        let broker = self.broadcaster.broker().clone();
        let consumer = broker
            .consume(&self.config.queues.commands, ConsumeOptions::manual(1))
            .await?;
        info!(queue = %consumer.queue, "Waiting for commands");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.wait() => break,
                received = broker.recv(&consumer) => match received {
                    Some(delivery) => delivery,
                    None => {
                        warn!("Command session closed");
                        break;
                    }
                },
            };

            let command = match decode_command(&delivery.payload) {
                Ok(command) => command,
                Err(e) => {
                    warn!(error = %e, "Rejecting malformed command");
                    if let Err(e) = broker.nack(delivery.tag, false).await {
                        warn!(error = %e, "Failed to reject command");
                    }
                    continue;
                }
            };

            info!(command = command.kind(), "📨 Command received");
            if let Err(e) = self.handle_command(command).await {
                error!(error = %e, "Command failed");
            }
            if let Err(e) = broker.ack(delivery.tag).await {
                warn!(error = %e, "Failed to acknowledge command");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stops generation, then closes the command session.
    pub async fn shutdown(&mut self) {
        self.stop_generation().await;
        self.broadcaster.broker().close().await;
        info!("Controller stopped");
    }
}
