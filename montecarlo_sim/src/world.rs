//! SimCluster - controller, workers and monitor wired to one simulated broker.

use crate::broker::{BrokerStats, SimBroker, SimBrokerServer};
use crate::context::SimContext;

use montecarlo_core::{
    CommandClient, Controller, ControllerError, GenerationReport, ModelCatalog, Monitor,
    MonitorError, MonteCarloConfig, StatsSnapshot, SyncError, Worker, WorkerCounters,
};
use montecarlo_env::{BrokerConnector, EnvError, MonteCarloContext, StopSignal, WorkerId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type SimSession = SimBroker<SimContext>;
type SimController = Controller<SimContext, SimBrokerServer<SimContext>, ModelCatalog>;

/// Handle to a simulated worker.
struct WorkerHandle {
    id: WorkerId,
    stop: Arc<StopSignal>,
    task: JoinHandle<Result<WorkerCounters, SyncError>>,
}

/// How one worker ended.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker_id: WorkerId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<WorkerCounters>,

    /// Set when the worker exited with an error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The worker never got a model within its polling budget
    pub starved: bool,
}

/// What the monitor saw.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub snapshot: StatsSnapshot,

    /// Model changes observed in the result stream
    pub epochs: u64,

    pub malformed: u64,
}

/// Everything a finished cluster run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterReport {
    pub generations: Vec<GenerationReport>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_error: Option<String>,

    pub workers: Vec<WorkerReport>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorReport>,

    pub broker: BrokerStats,

    pub final_time_secs: f64,
}

impl ClusterReport {
    /// Scenarios evaluated across all workers.
    pub fn evaluated(&self) -> u64 {
        self.worker_counters().map(|c| c.evaluated).sum()
    }

    pub fn worker_counters(&self) -> impl Iterator<Item = &WorkerCounters> {
        self.workers.iter().filter_map(|w| w.counters.as_ref())
    }

    /// Results aggregated by the monitor under the final model.
    pub fn aggregated(&self) -> u64 {
        self.monitor.as_ref().map_or(0, |m| m.snapshot.count)
    }
}

/// The SimCluster - one broker and every process of the system.
pub struct SimCluster {
    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// The simulated broker
    pub server: Arc<SimBrokerServer<SimContext>>,

    pub config: MonteCarloConfig,

    catalog: ModelCatalog,

    /// Dashboard-side command sender, on its own session
    console: CommandClient<SimContext, SimSession>,

    controller_stop: Arc<StopSignal>,
    controller: Option<JoinHandle<Result<Vec<GenerationReport>, ControllerError>>>,

    workers: Vec<WorkerHandle>,

    monitor_stop: Arc<StopSignal>,
    monitor: Option<JoinHandle<Result<Monitor<SimContext, SimSession>, MonitorError>>>,
}

impl SimCluster {
    /// Creates the broker and the command console. Nothing runs yet.
    pub async fn new(
        context: Arc<SimContext>,
        config: MonteCarloConfig,
        catalog: ModelCatalog,
    ) -> Result<Self, EnvError> {
        let server = SimBrokerServer::shared(context.clone());
        let console_session = server.connect().await?;
        let console = CommandClient::new(context.clone(), console_session, &config);

        Ok(Self {
            context,
            server,
            config,
            catalog,
            console,
            controller_stop: StopSignal::shared(),
            controller: None,
            workers: Vec::new(),
            monitor_stop: StopSignal::shared(),
            monitor: None,
        })
    }

    /// Starts the controller; with `initial_model` it publishes that model
    /// before listening for commands.
    pub fn start_controller(&mut self, initial_model: Option<&str>) {
        let context = self.context.clone();
        let server = self.server.clone();
        let catalog = self.catalog.clone();
        let config = self.config.clone();
        let stop = self.controller_stop.clone();
        let initial = initial_model.map(str::to_string);

        let task = self.context.spawn("controller", async move {
            let mut controller: SimController =
                Controller::connect(context, server, catalog, config).await?;
            if let Some(reference) = initial {
                if let Err(e) = controller.swap(&reference).await {
                    warn!(error = %e, "Initial model could not be published");
                }
            }
            controller.run(stop).await?;
            Ok::<_, ControllerError>(controller.reports().to_vec())
        });
        self.controller = Some(task);
    }

    /// Starts a worker after `delay`; returns its id.
    pub fn spawn_worker(&mut self, delay: Duration) -> WorkerId {
        let index = self.workers.len() as u64 + 1;
        let id = WorkerId::from(index.to_string());
        let context = self.context.clone();
        let server = self.server.clone();
        let config = self.config.clone();
        let stop = StopSignal::shared();
        let worker_stop = stop.clone();
        let worker_id = id.clone();

        let task = self.context.spawn("worker", async move {
            if !delay.is_zero() {
                context.sleep(delay).await;
            }
            let session = server.connect().await?;
            let mut worker = Worker::new(worker_id, context, session, config);
            worker.start().await?;
            worker.run(worker_stop).await
        });

        self.workers.push(WorkerHandle {
            id: id.clone(),
            stop,
            task,
        });
        id
    }

    /// Starts the result monitor.
    pub fn start_monitor(&mut self) {
        let context = self.context.clone();
        let server = self.server.clone();
        let config = self.config.clone();
        let stop = self.monitor_stop.clone();

        let task = self.context.spawn("monitor", async move {
            let session = server.connect().await?;
            let mut monitor = Monitor::new(context, session, config);
            monitor.declare().await?;
            monitor.run(stop).await?;
            Ok::<_, MonitorError>(monitor)
        });
        self.monitor = Some(task);
    }

    pub async fn request_swap(&self, model_ref: &str) -> Result<(), MonitorError> {
        self.console.request_swap(model_ref).await
    }

    pub async fn request_stop(&self) -> Result<(), MonitorError> {
        self.console.request_stop().await
    }

    /// Lets virtual time pass.
    pub async fn run_for(&self, duration: Duration) {
        self.context.sleep(duration).await;
    }

    /// Stops everything in dependency order and collects reports:
    /// controller first, then workers, monitor last so it can drain.
    pub async fn shutdown(mut self) -> ClusterReport {
        let mut generations = Vec::new();
        let mut controller_error = None;
        self.controller_stop.trigger();
        if let Some(task) = self.controller.take() {
            match task.await {
                Ok(Ok(reports)) => generations = reports,
                Ok(Err(e)) => controller_error = Some(e.to_string()),
                Err(e) => controller_error = Some(e.to_string()),
            }
        }

        let mut workers = Vec::new();
        for handle in self.workers.drain(..) {
            handle.stop.trigger();
            let report = match handle.task.await {
                Ok(Ok(counters)) => WorkerReport {
                    worker_id: handle.id,
                    counters: Some(counters),
                    error: None,
                    starved: false,
                },
                Ok(Err(e)) => WorkerReport {
                    worker_id: handle.id,
                    counters: None,
                    starved: matches!(e, SyncError::ModelUnavailable { .. }),
                    error: Some(e.to_string()),
                },
                Err(e) => WorkerReport {
                    worker_id: handle.id,
                    counters: None,
                    error: Some(e.to_string()),
                    starved: false,
                },
            };
            workers.push(report);
        }

        // Give the monitor one refresh to drain what the workers published.
        self.context.sleep(self.config.refresh_interval()).await;
        self.monitor_stop.trigger();
        let monitor = match self.monitor.take() {
            Some(task) => match task.await {
                Ok(Ok(monitor)) => Some(MonitorReport {
                    snapshot: monitor.snapshot(),
                    epochs: monitor.aggregator().epochs(),
                    malformed: monitor.malformed(),
                }),
                Ok(Err(e)) => {
                    warn!(error = %e, "Monitor failed");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Monitor task panicked");
                    None
                }
            },
            None => None,
        };

        let report = ClusterReport {
            generations,
            controller_error,
            workers,
            monitor,
            broker: self.server.stats(),
            final_time_secs: self.context.now().as_secs_f64(),
        };
        info!(
            evaluated = report.evaluated(),
            aggregated = report.aggregated(),
            "Cluster stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, AREA, BENEFICIO, INVALIDO};
    use montecarlo_core::wire::{decode_command, encode};
    use montecarlo_core::{
        Command, DropReason, GenerationLoop, IngestOutcome, ModelBroadcaster, RequeueReason,
        ResultRecord, Scenario, ScenarioOutcome, StopReason, WorkerSync,
    };
    use montecarlo_env::{MessageBroker, PublishOptions};

    type Server = SimBrokerServer<SimContext>;

    async fn setup() -> (Arc<SimContext>, Arc<Server>, ModelBroadcaster<SimSession>, MonteCarloConfig) {
        let ctx = SimContext::shared(11);
        let server = SimBrokerServer::shared(ctx.clone());
        let config = MonteCarloConfig::default();
        let session = server.connect().await.unwrap();
        let broadcaster = ModelBroadcaster::new(session, config.queues.clone(), config.model_ttl());
        broadcaster.declare_topology().await.unwrap();
        broadcaster.publish(&catalog::beneficio()).await.unwrap();
        (ctx, server, broadcaster, config)
    }

    async fn started_worker(
        ctx: &Arc<SimContext>,
        server: &Arc<Server>,
        config: &MonteCarloConfig,
    ) -> (Worker<SimContext, SimSession>, Arc<SimSession>) {
        let session = server.connect().await.unwrap();
        let mut worker = Worker::new(WorkerId::from("w1"), ctx.clone(), session.clone(), config.clone());
        worker.start().await.unwrap();
        (worker, session)
    }

    async fn push_scenario(broadcaster: &ModelBroadcaster<SimSession>, values: &[(&str, f64)]) {
        let scenario: Scenario = values.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        broadcaster
            .broker()
            .publish("escenarios", encode(&scenario).unwrap(), PublishOptions::persistent())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_twice_returns_same_model_and_keeps_it_resident() {
        let (ctx, server, broadcaster, config) = setup().await;
        let session = server.connect().await.unwrap();
        let sync = WorkerSync::new(ctx, session, &config);

        let first = sync.acquire().await.unwrap();
        let second = sync.acquire().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, "beneficio");
        assert_eq!(broadcaster.broker().passive_declare("modelo").await.unwrap(), 1);
        assert_eq!(server.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_evaluates_scenario_and_publishes_result() {
        let (ctx, server, broadcaster, config) = setup().await;
        let (mut worker, session) = started_worker(&ctx, &server, &config).await;

        push_scenario(&broadcaster, &[("ingresos", 150.0), ("costos", 60.0)]).await;
        let delivery = session.get("escenarios").await.unwrap().unwrap();
        let outcome = worker.handle_delivery(delivery).await.unwrap();
        match outcome {
            ScenarioOutcome::Evaluated(record) => assert_eq!(record.value, 90.0),
            other => panic!("expected evaluation, got {:?}", other),
        }

        let results = server.snapshot("resultados");
        assert_eq!(results.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&results[0]).unwrap();
        assert_eq!(json["worker_id"], "w1");
        assert_eq!(json["resultado"], 90.0);
        assert_eq!(json["modelo"], "beneficio");
        assert_eq!(json["escenario"]["ingresos"], 150.0);
        assert_eq!(json["escenario"]["costos"], 60.0);
        assert!(json["timestamp"].as_f64().unwrap() > 1.7e9);
        assert_eq!(server.ready_count("escenarios"), Some(0));
        assert_eq!(worker.processed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_scenario_rereads_model_once_and_requeues() {
        let (ctx, server, broadcaster, config) = setup().await;
        let (mut worker, session) = started_worker(&ctx, &server, &config).await;

        broadcaster.publish(&catalog::area()).await.unwrap();
        push_scenario(&broadcaster, &[("radio", 2.0)]).await;

        let delivery = session.get("escenarios").await.unwrap().unwrap();
        let gets_before = server.stats().gets;
        let outcome = worker.handle_delivery(delivery).await.unwrap();

        assert_eq!(outcome, ScenarioOutcome::Requeued(RequeueReason::Stale));
        assert_eq!(server.stats().gets - gets_before, 1);
        assert_eq!(server.ready_count("escenarios"), Some(1));
        assert_eq!(server.ready_count("resultados"), Some(0));
        assert_eq!(worker.model().unwrap().name, "area");
        assert_eq!(worker.counters().resyncs, 1);
        assert_eq!(worker.counters().model_changes, 1);
        assert_eq!(worker.counters().evaluated, 0);

        // The requeued scenario now matches and is evaluated under the new model.
        let delivery = session.get("escenarios").await.unwrap().unwrap();
        assert!(delivery.redelivered);
        match worker.handle_delivery(delivery).await.unwrap() {
            ScenarioOutcome::Evaluated(record) => {
                assert_eq!(record.model_name, "area");
                assert_eq!(record.value, 12.5664);
            }
            other => panic!("expected evaluation, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_of_no_resident_model_is_dropped() {
        let (ctx, server, broadcaster, config) = setup().await;
        let (mut worker, session) = started_worker(&ctx, &server, &config).await;

        push_scenario(&broadcaster, &[("x", 1.0)]).await;
        let delivery = session.get("escenarios").await.unwrap().unwrap();
        let outcome = worker.handle_delivery(delivery).await.unwrap();

        assert_eq!(outcome, ScenarioOutcome::Dropped(DropReason::OrphanScenario));
        assert_eq!(server.ready_count("escenarios"), Some(0));
        assert_eq!(worker.model().unwrap().name, "beneficio");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_without_model_requeues_and_waits() {
        let (ctx, server, broadcaster, config) = setup().await;
        let (mut worker, session) = started_worker(&ctx, &server, &config).await;

        broadcaster.broker().purge("modelo").await.unwrap();
        push_scenario(&broadcaster, &[("radio", 2.0)]).await;
        let delivery = session.get("escenarios").await.unwrap().unwrap();

        let before = ctx.now();
        let outcome = worker.handle_delivery(delivery).await.unwrap();
        assert_eq!(outcome, ScenarioOutcome::Requeued(RequeueReason::ResyncFailed));
        assert!(ctx.now() - before >= config.acquire_interval());
        assert_eq!(server.ready_count("escenarios"), Some(1));
        assert_eq!(worker.model().unwrap().name, "beneficio");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_result_publish_requeues_scenario() {
        let (ctx, server, broadcaster, config) = setup().await;
        let (mut worker, session) = started_worker(&ctx, &server, &config).await;

        server.faults().fail_publishes("resultados", 1);
        push_scenario(&broadcaster, &[("ingresos", 150.0), ("costos", 60.0)]).await;
        let delivery = session.get("escenarios").await.unwrap().unwrap();

        let outcome = worker.handle_delivery(delivery).await.unwrap();
        assert_eq!(outcome, ScenarioOutcome::Requeued(RequeueReason::PublishFailed));
        assert_eq!(server.ready_count("escenarios"), Some(1));
        assert_eq!(worker.processed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_gives_up_without_model() {
        let ctx = SimContext::shared(3);
        let server = SimBrokerServer::shared(ctx.clone());
        let config = MonteCarloConfig::default();
        let session = server.connect().await.unwrap();
        let mut worker = Worker::new(WorkerId::from("w1"), ctx.clone(), session, config.clone());

        let err = worker.start().await.unwrap_err();
        assert!(matches!(err, SyncError::ModelUnavailable { attempts: 10 }));
        assert!(ctx.now() >= config.acquire_interval() * 9);
        assert!(ctx.now() < config.acquire_interval() * 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_halts_within_one_check_of_expiry() {
        let ctx = SimContext::shared(5);
        let server = SimBrokerServer::shared(ctx.clone());
        let config = MonteCarloConfig {
            model_ttl_ms: 5_000,
            ..MonteCarloConfig::default()
        };
        let session = server.connect().await.unwrap();
        let broadcaster = ModelBroadcaster::new(session.clone(), config.queues.clone(), config.model_ttl());
        broadcaster.declare_topology().await.unwrap();
        broadcaster.publish(&catalog::beneficio()).await.unwrap();
        ctx.sleep(Duration::from_secs(1)).await;

        let report = GenerationLoop::new(ctx.clone(), session, catalog::beneficio(), 1, config.clone())
            .run()
            .await;

        assert_eq!(report.stop_reason, StopReason::Expired);
        assert_eq!(report.total, config.expiry_check_every);
        assert_eq!(report.unique + report.fallbacks, report.total);
        assert_eq!(server.published_to("escenarios"), report.total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_retries_transient_publish_failures() {
        let ctx = SimContext::shared(5);
        let server = SimBrokerServer::shared(ctx.clone());
        let config = MonteCarloConfig {
            model_ttl_ms: 5_000,
            ..MonteCarloConfig::default()
        };
        let session = server.connect().await.unwrap();
        let broadcaster = ModelBroadcaster::new(session.clone(), config.queues.clone(), config.model_ttl());
        broadcaster.declare_topology().await.unwrap();
        broadcaster.publish(&catalog::beneficio()).await.unwrap();
        server.faults().fail_publishes("escenarios", 3);

        let report = GenerationLoop::new(ctx.clone(), session, catalog::beneficio(), 1, config.clone())
            .run()
            .await;

        assert_eq!(report.publish_failures, 3);
        assert_eq!(server.stats().injected_failures, 3);
        assert_eq!(report.stop_reason, StopReason::Expired);
        assert_eq!(report.total, config.expiry_check_every);
        assert_eq!(server.published_to("escenarios"), report.total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_stops_on_closed_session() {
        let (ctx, server, _broadcaster, config) = setup().await;
        let session = server.connect().await.unwrap();
        session.close().await;

        let report = GenerationLoop::new(ctx.clone(), session, catalog::beneficio(), 1, config)
            .run()
            .await;

        assert_eq!(report.stop_reason, StopReason::SessionLost);
        assert_eq!(report.total, 0);
        assert_eq!(report.publish_failures, 0);
        assert_eq!(server.published_to("escenarios"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_swap_and_stop_commands() {
        let ctx = SimContext::shared(9);
        let server = SimBrokerServer::shared(ctx.clone());
        let config = MonteCarloConfig::default();
        let mut controller: SimController =
            Controller::connect(ctx.clone(), server.clone(), catalog::builtin(), config)
                .await
                .unwrap();

        controller.handle_command(Command::swap(AREA, 0.0)).await.unwrap();
        assert_eq!(controller.current_model().unwrap().name, "area");
        assert_eq!(controller.epoch(), 1);
        assert!(controller.is_generating());
        assert_eq!(server.ready_count("modelo"), Some(1));

        ctx.sleep(Duration::from_secs(1)).await;
        assert!(server.published_to("escenarios") > 0);

        controller
            .handle_command(Command::Stop { timestamp: None })
            .await
            .unwrap();
        assert!(!controller.is_generating());
        assert_eq!(controller.reports().len(), 1);
        assert_eq!(controller.reports()[0].stop_reason, StopReason::Stopped);

        controller
            .handle_command(Command::Unknown("reiniciar".to_string()))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_swap_leaves_generation_stopped() {
        let ctx = SimContext::shared(9);
        let server = SimBrokerServer::shared(ctx.clone());
        let mut controller: SimController = Controller::connect(
            ctx.clone(),
            server.clone(),
            catalog::builtin(),
            MonteCarloConfig::default(),
        )
        .await
        .unwrap();

        controller.swap(BENEFICIO).await.unwrap();
        assert!(controller.is_generating());

        let err = controller.swap(INVALIDO).await.unwrap_err();
        assert!(matches!(err, ControllerError::Model(_)));
        assert!(!controller.is_generating());
        assert_eq!(controller.epoch(), 1);

        let published = server.published_to("escenarios");
        ctx.sleep(Duration::from_secs(5)).await;
        assert_eq!(server.published_to("escenarios"), published);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_queues_deletes_topology() {
        let ctx = SimContext::shared(9);
        let server = SimBrokerServer::shared(ctx.clone());
        let mut controller: SimController = Controller::connect(
            ctx.clone(),
            server.clone(),
            catalog::builtin(),
            MonteCarloConfig::default(),
        )
        .await
        .unwrap();
        controller.swap(BENEFICIO).await.unwrap();

        let discarded = controller.reset_queues().await.unwrap();
        assert!(discarded >= 1);
        assert!(controller.current_model().is_none());
        assert_eq!(server.ready_count("modelo"), None);
        assert_eq!(server.ready_count("comandos"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_resets_on_new_model() {
        let ctx = SimContext::shared(2);
        let server = SimBrokerServer::shared(ctx.clone());
        let session = server.connect().await.unwrap();
        let mut monitor = Monitor::new(ctx, session, MonteCarloConfig::default());

        let record = |worker: &str, model: &str, value: f64| ResultRecord {
            worker_id: WorkerId::from(worker),
            scenario: Scenario::from([("x".to_string(), value)]),
            value,
            timestamp: 0.0,
            model_name: model.to_string(),
        };
        for i in 0..5 {
            let worker = if i % 2 == 0 { "1" } else { "2" };
            monitor.ingest(&encode(&record(worker, "A", i as f64)).unwrap());
        }
        assert_eq!(monitor.snapshot().count, 5);

        let outcome = monitor.ingest(&encode(&record("3", "B", 9.0)).unwrap());
        assert_eq!(
            outcome,
            Some(IngestOutcome::ModelChanged {
                previous: "A".to_string(),
                current: "B".to_string(),
            })
        );
        let snap = monitor.snapshot();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.workers.len(), 1);
        assert_eq!(snap.workers[0].worker_id, WorkerId::from("3"));

        assert_eq!(monitor.ingest(b"not json"), None);
        assert_eq!(monitor.malformed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_refresh_reports_elapsed_and_worker_shares() {
        let ctx = SimContext::shared(4);
        let server = SimBrokerServer::shared(ctx.clone());
        let session = server.connect().await.unwrap();
        let mut monitor = Monitor::new(ctx.clone(), session, MonteCarloConfig::default());

        assert_eq!(monitor.refresh().count, 0);

        let record = |worker: &str, value: f64| ResultRecord {
            worker_id: WorkerId::from(worker),
            scenario: Scenario::from([("x".to_string(), value)]),
            value,
            timestamp: 0.0,
            model_name: "A".to_string(),
        };
        for (worker, value) in [("1", 1.0), ("1", 2.0), ("2", 3.0), ("1", 4.0)] {
            monitor.ingest(&encode(&record(worker, value)).unwrap());
            ctx.sleep(Duration::from_secs(1)).await;
        }

        let snap = monitor.refresh();
        assert_eq!(snap.count, 4);
        assert_eq!(snap.elapsed, Duration::from_secs(4));
        assert_eq!(snap.workers.len(), 2);

        let one = snap.workers.iter().find(|w| w.worker_id == WorkerId::from("1")).unwrap();
        assert_eq!(one.count, 3);
        assert!((one.share_pct - 75.0).abs() < 1e-9);
        assert_eq!(one.last_value, 4.0);

        let two = snap.workers.iter().find(|w| w.worker_id == WorkerId::from("2")).unwrap();
        assert_eq!(two.count, 1);
        assert!((two.share_pct - 25.0).abs() < 1e-9);
        assert_eq!(two.last_value, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_client_publishes_swap() {
        let ctx = SimContext::shared(2);
        let server = SimBrokerServer::shared(ctx.clone());
        let session = server.connect().await.unwrap();
        let monitor = Monitor::new(ctx, session.clone(), MonteCarloConfig::default());
        monitor.declare().await.unwrap();

        monitor.request_swap(AREA).await.unwrap();
        monitor.request_stop().await.unwrap();

        let swap = session.get("comandos").await.unwrap().unwrap();
        match decode_command(&swap.payload).unwrap() {
            Command::SwapModel { model_ref, .. } => assert_eq!(model_ref, AREA),
            other => panic!("expected swap, got {:?}", other),
        }
        let stop = session.get("comandos").await.unwrap().unwrap();
        assert!(matches!(decode_command(&stop.payload).unwrap(), Command::Stop { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_round_trip() {
        let mut cluster = SimCluster::new(
            SimContext::shared(42),
            MonteCarloConfig::default(),
            catalog::builtin(),
        )
        .await
        .unwrap();
        cluster.start_monitor();
        cluster.start_controller(Some(BENEFICIO));
        cluster.spawn_worker(Duration::ZERO);
        cluster.spawn_worker(Duration::ZERO);
        cluster.run_for(Duration::from_secs(10)).await;
        let report = cluster.shutdown().await;

        assert!(report.controller_error.is_none());
        assert_eq!(report.workers.len(), 2);
        assert!(report.evaluated() > 0);
        assert_eq!(report.generations.len(), 1);
        assert_eq!(report.generations[0].model_name, "beneficio");
        let monitor = report.monitor.as_ref().unwrap();
        assert_eq!(monitor.snapshot.model_name.as_deref(), Some("beneficio"));
        assert_eq!(monitor.snapshot.count, report.evaluated());
        assert_eq!(monitor.malformed, 0);
        assert!(report.final_time_secs >= 10.0);
    }
}
