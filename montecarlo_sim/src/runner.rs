//! Scenario runner - drives a simulated cluster through each scenario.

use crate::catalog::{self, AREA, BENEFICIO, INVALIDO, ROTO, TIEMPO};
use crate::context::SimContext;
use crate::scenarios::ScenarioId;
use crate::world::{ClusterReport, SimCluster};

use montecarlo_core::{Model, ModelCatalog, MonteCarloConfig, StopReason};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Full cluster report, when the cluster got that far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ClusterReport>,
}

impl ScenarioResult {
    fn aborted(scenario: ScenarioId, seed: u64, reason: String) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            final_time_secs: 0.0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
            report: None,
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Scenarios published across all generation loops
    pub scenarios_published: u64,

    /// Results computed by workers
    pub results_evaluated: u64,

    /// Results counted by the monitor under the final model
    pub results_aggregated: u64,

    /// Staleness detections across workers
    pub resyncs: u64,

    pub requeued: u64,
    pub dropped: u64,

    /// Model changes seen by the monitor
    pub model_epochs: u64,

    /// Generation loops that ended
    pub generations: usize,

    pub publish_failures: u64,
}

impl ScenarioMetrics {
    fn from_report(report: &ClusterReport) -> Self {
        let mut metrics = Self {
            scenarios_published: report.generations.iter().map(|g| g.total).sum(),
            results_evaluated: report.evaluated(),
            results_aggregated: report.aggregated(),
            model_epochs: report.monitor.as_ref().map_or(0, |m| m.epochs),
            generations: report.generations.len(),
            publish_failures: report.generations.iter().map(|g| g.publish_failures).sum(),
            ..Self::default()
        };
        for counters in report.worker_counters() {
            metrics.resyncs += counters.resyncs;
            metrics.requeued += counters.requeued;
            metrics.dropped += counters.dropped;
        }
        metrics
    }
}

/// Collected assertion failures of one scenario.
#[derive(Debug, Default)]
struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn check(&mut self, ok: bool, message: impl Into<String>) {
        if !ok {
            let message = message.into();
            warn!("Check failed: {}", message);
            self.failures.push(message);
        }
    }
}

/// Runs cluster scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of workers
    num_workers: usize,

    /// Virtual run length
    duration: Duration,

    /// Cluster configuration
    config: MonteCarloConfig,

    /// Models the controller can swap to
    catalog: ModelCatalog,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_workers: usize) -> Self {
        Self {
            seed,
            num_workers: num_workers.max(1),
            duration: Duration::from_secs(30),
            config: MonteCarloConfig::default(),
            catalog: catalog::builtin(),
        }
    }

    /// Sets the virtual duration of each scenario, in seconds.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration = Duration::from_secs_f64(secs.max(1.0));
        self
    }

    /// Sets the cluster configuration.
    pub fn with_config(mut self, config: MonteCarloConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds models to the built-in catalog, replacing same-named entries.
    pub fn with_models(mut self, models: impl IntoIterator<Item = (String, Model)>) -> Self {
        for (reference, model) in models {
            self.catalog.insert(reference, model);
        }
        self
    }

    /// Runs a scenario on a fresh paused-clock runtime and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                return ScenarioResult::aborted(scenario, self.seed, format!("runtime: {}", e))
            }
        };

        runtime.block_on(self.run_async(scenario))
    }

    /// Runs a scenario on the current runtime; the clock should be paused.
    pub async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        let cluster = match SimCluster::new(
            SimContext::shared(self.seed),
            self.config_for(scenario),
            self.catalog.clone(),
        )
        .await
        {
            Ok(cluster) => cluster,
            Err(e) => return ScenarioResult::aborted(scenario, self.seed, e.to_string()),
        };

        let mut checks = Checks::default();
        let report = match scenario {
            ScenarioId::SteadyState => self.run_steady_state(cluster, &mut checks).await,
            ScenarioId::ModelSwap => self.run_model_swap(cluster, &mut checks).await,
            ScenarioId::ModelExpiry => self.run_model_expiry(cluster, &mut checks).await,
            ScenarioId::LateWorker => self.run_late_worker(cluster, &mut checks).await,
            ScenarioId::StaleWorker => self.run_stale_worker(cluster, &mut checks).await,
            ScenarioId::BrokenFormula => self.run_broken_formula(cluster, &mut checks).await,
            ScenarioId::TransientFaults => self.run_transient_faults(cluster, &mut checks).await,
            ScenarioId::InvalidModel => self.run_invalid_model(cluster, &mut checks).await,
            ScenarioId::WorkerStarvation => self.run_worker_starvation(cluster, &mut checks).await,
        };

        checks.check(
            report.controller_error.is_none(),
            format!("controller failed: {:?}", report.controller_error),
        );

        let passed = checks.failures.is_empty();
        if passed {
            info!("✅ {} PASSED", scenario.name());
        } else {
            warn!("❌ {} FAILED", scenario.name());
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            final_time_secs: report.final_time_secs,
            failure_reason: (!passed).then(|| checks.failures.join("; ")),
            metrics: ScenarioMetrics::from_report(&report),
            report: Some(report),
        }
    }

    fn config_for(&self, scenario: ScenarioId) -> MonteCarloConfig {
        let mut config = self.config.clone();
        if scenario == ScenarioId::ModelExpiry {
            config.model_ttl_ms = 5_000;
        }
        config
    }

    fn spawn_workers(&self, cluster: &mut SimCluster) {
        for _ in 0..self.num_workers {
            cluster.spawn_worker(Duration::ZERO);
        }
    }

    fn check_healthy_workers(report: &ClusterReport, checks: &mut Checks) {
        for worker in &report.workers {
            checks.check(
                worker.error.is_none(),
                format!("worker {} failed: {:?}", worker.worker_id, worker.error),
            );
        }
    }

    /// MC-001: SteadyState - results flow for a single model.
    ///
    /// **Assertion**: results are aggregated, all under 'beneficio', all
    /// within the formula's range.
    async fn run_steady_state(&self, mut cluster: SimCluster, checks: &mut Checks) -> ClusterReport {
        info!("MC-001: SteadyState");
        cluster.start_monitor();
        cluster.start_controller(Some(BENEFICIO));
        self.spawn_workers(&mut cluster);
        cluster.run_for(self.duration).await;
        let report = cluster.shutdown().await;

        Self::check_healthy_workers(&report, checks);
        checks.check(report.evaluated() > 0, "no scenario evaluated");
        match &report.monitor {
            Some(monitor) => {
                let snap = &monitor.snapshot;
                checks.check(snap.count > 0, "monitor aggregated nothing");
                checks.check(
                    snap.model_name.as_deref() == Some("beneficio"),
                    format!("monitor shows {:?}", snap.model_name),
                );
                checks.check(
                    snap.min >= 20.0 && snap.max <= 150.0,
                    format!("results out of range [{}, {}]", snap.min, snap.max),
                );
                checks.check(monitor.epochs == 1, format!("{} model epochs", monitor.epochs));
            }
            None => checks.check(false, "monitor did not report"),
        }
        report
    }

    /// MC-002: ModelSwap - swap halfway through.
    ///
    /// **Assertion**: the monitor ends on 'area' with freshly reset
    /// statistics, and both generations ran.
    async fn run_model_swap(&self, mut cluster: SimCluster, checks: &mut Checks) -> ClusterReport {
        info!("MC-002: ModelSwap");
        cluster.start_monitor();
        cluster.start_controller(Some(BENEFICIO));
        self.spawn_workers(&mut cluster);

        let half = self.duration / 2;
        cluster.run_for(half).await;
        if let Err(e) = cluster.request_swap(AREA).await {
            checks.check(false, format!("swap request failed: {}", e));
        }
        cluster.run_for(half.max(Duration::from_secs(10))).await;
        let report = cluster.shutdown().await;

        Self::check_healthy_workers(&report, checks);
        let names: Vec<&str> = report.generations.iter().map(|g| g.model_name.as_str()).collect();
        checks.check(
            names == ["beneficio", "area"],
            format!("generations ran for {:?}", names),
        );
        checks.check(
            report.generations.iter().all(|g| g.total > 0),
            "a generation published nothing",
        );
        match &report.monitor {
            Some(monitor) => {
                checks.check(
                    monitor.snapshot.model_name.as_deref() == Some("area"),
                    format!("monitor shows {:?}", monitor.snapshot.model_name),
                );
                checks.check(monitor.epochs >= 2, "monitor never saw the swap");
                checks.check(
                    monitor.snapshot.workers.iter().map(|w| w.count).sum::<u64>()
                        == monitor.snapshot.count,
                    "per-worker counts do not add up",
                );
            }
            None => checks.check(false, "monitor did not report"),
        }
        report
    }

    /// MC-003: ModelExpiry - the model TTL runs out mid-generation.
    ///
    /// **Assertion**: generation ends as expired, at most one check period
    /// after the model disappeared.
    async fn run_model_expiry(&self, mut cluster: SimCluster, checks: &mut Checks) -> ClusterReport {
        info!("MC-003: ModelExpiry");
        let config = cluster.config.clone();
        cluster.start_monitor();
        cluster.start_controller(Some(BENEFICIO));
        self.spawn_workers(&mut cluster);
        cluster
            .run_for(self.duration.max(Duration::from_secs(20)))
            .await;
        let report = cluster.shutdown().await;

        let bound = config.model_ttl_ms / config.scenario_interval_ms.max(1) + config.expiry_check_every;
        match report.generations.first() {
            Some(generation) => {
                checks.check(
                    generation.stop_reason == StopReason::Expired,
                    format!("generation ended with {:?}", generation.stop_reason),
                );
                checks.check(
                    generation.total > 0 && generation.total <= bound,
                    format!("{} scenarios published, bound {}", generation.total, bound),
                );
                checks.check(
                    generation.total % config.expiry_check_every.max(1) == 0,
                    "generation did not stop on a check boundary",
                );
            }
            None => checks.check(false, "no generation report"),
        }
        checks.check(report.generations.len() == 1, "generation restarted after expiry");
        report
    }

    /// MC-004: LateWorker - a worker starts 10s after the model was published.
    ///
    /// **Assertion**: the model is still resident and the worker evaluates.
    async fn run_late_worker(&self, mut cluster: SimCluster, checks: &mut Checks) -> ClusterReport {
        info!("MC-004: LateWorker");
        cluster.start_monitor();
        cluster.start_controller(Some(BENEFICIO));
        let late = cluster.spawn_worker(Duration::from_secs(10));
        cluster
            .run_for(self.duration.max(Duration::from_secs(20)))
            .await;
        let report = cluster.shutdown().await;

        Self::check_healthy_workers(&report, checks);
        let evaluated = report
            .workers
            .iter()
            .find(|w| w.worker_id == late)
            .and_then(|w| w.counters.as_ref())
            .map_or(0, |c| c.evaluated);
        checks.check(evaluated > 0, "late worker evaluated nothing");
        report
    }

    /// MC-005: StaleWorker - workers only learn of the swap from scenarios.
    ///
    /// **Assertion**: every worker that saw the new model resynced, and the
    /// result stream switched models exactly once (no stale evaluations).
    async fn run_stale_worker(&self, mut cluster: SimCluster, checks: &mut Checks) -> ClusterReport {
        info!("MC-005: StaleWorker");
        cluster.start_monitor();
        cluster.start_controller(Some(BENEFICIO));
        self.spawn_workers(&mut cluster);

        let third = self.duration / 3;
        cluster.run_for(third).await;
        if let Err(e) = cluster.request_swap(TIEMPO).await {
            checks.check(false, format!("swap request failed: {}", e));
        }
        cluster
            .run_for((self.duration - third).max(Duration::from_secs(10)))
            .await;
        let report = cluster.shutdown().await;

        Self::check_healthy_workers(&report, checks);
        let resyncs: u64 = report.worker_counters().map(|c| c.resyncs).sum();
        let changes: u64 = report.worker_counters().map(|c| c.model_changes).sum();
        checks.check(resyncs >= 1, "no worker detected the stale model");
        checks.check(changes >= 1, "no worker installed the new model");
        match &report.monitor {
            Some(monitor) => {
                checks.check(
                    monitor.epochs == 2,
                    format!("result stream switched models {} times", monitor.epochs),
                );
                checks.check(
                    monitor.snapshot.model_name.as_deref() == Some("tiempo"),
                    format!("monitor shows {:?}", monitor.snapshot.model_name),
                );
            }
            None => checks.check(false, "monitor did not report"),
        }
        report
    }

    /// MC-006: BrokenFormula - the formula cannot be evaluated.
    ///
    /// **Assertion**: scenarios are dropped, never requeued, no results.
    async fn run_broken_formula(&self, mut cluster: SimCluster, checks: &mut Checks) -> ClusterReport {
        info!("MC-006: BrokenFormula");
        cluster.start_monitor();
        cluster.start_controller(Some(ROTO));
        self.spawn_workers(&mut cluster);
        cluster.run_for(self.duration).await;
        let report = cluster.shutdown().await;

        Self::check_healthy_workers(&report, checks);
        let dropped: u64 = report.worker_counters().map(|c| c.dropped).sum();
        checks.check(report.evaluated() == 0, "broken formula produced results");
        checks.check(report.aggregated() == 0, "monitor aggregated results");
        checks.check(dropped > 0, "no scenario was dropped");
        report
    }

    /// MC-007: TransientFaults - publishes fail on both data queues.
    ///
    /// **Assertion**: the generation loop survives every failure and no
    /// failed result publish loses its scenario.
    async fn run_transient_faults(&self, mut cluster: SimCluster, checks: &mut Checks) -> ClusterReport {
        info!("MC-007: TransientFaults");
        let queues = cluster.config.queues.clone();
        cluster.start_monitor();
        cluster.start_controller(Some(BENEFICIO));
        self.spawn_workers(&mut cluster);

        let third = self.duration / 3;
        cluster.run_for(third).await;
        let faults = cluster.server.faults();
        faults.fail_publishes(&queues.scenarios, 5);
        faults.fail_publishes(&queues.results, 5);
        cluster
            .run_for((self.duration - third).max(Duration::from_secs(10)))
            .await;
        let report = cluster.shutdown().await;

        Self::check_healthy_workers(&report, checks);
        let failures: u64 = report.generations.iter().map(|g| g.publish_failures).sum();
        let requeued: u64 = report.worker_counters().map(|c| c.requeued).sum();
        checks.check(failures == 5, format!("{} scenario publish failures survived", failures));
        checks.check(requeued >= 5, format!("only {} scenarios requeued", requeued));
        checks.check(report.broker.injected_failures == 10, "not every fault fired");
        checks.check(report.aggregated() > 0, "no results after faults");
        report
    }

    /// MC-008: InvalidModel - a swap to a model without variables.
    ///
    /// **Assertion**: the swap aborts and generation stays stopped.
    async fn run_invalid_model(&self, mut cluster: SimCluster, checks: &mut Checks) -> ClusterReport {
        info!("MC-008: InvalidModel");
        let scenarios_queue = cluster.config.queues.scenarios.clone();
        cluster.start_monitor();
        cluster.start_controller(Some(BENEFICIO));
        self.spawn_workers(&mut cluster);

        let third = self.duration / 3;
        cluster.run_for(third).await;
        if let Err(e) = cluster.request_swap(INVALIDO).await {
            checks.check(false, format!("swap request failed: {}", e));
        }
        cluster.run_for(Duration::from_secs(5)).await;
        let published = cluster.server.published_to(&scenarios_queue);
        cluster
            .run_for((self.duration - third).max(Duration::from_secs(10)))
            .await;
        checks.check(
            cluster.server.published_to(&scenarios_queue) == published,
            "scenarios generated after a failed swap",
        );
        let report = cluster.shutdown().await;

        let names: Vec<&str> = report.generations.iter().map(|g| g.model_name.as_str()).collect();
        checks.check(names == ["beneficio"], format!("generations ran for {:?}", names));
        report
    }

    /// MC-009: WorkerStarvation - no model is ever published.
    ///
    /// **Assertion**: the worker exits after its full polling budget.
    async fn run_worker_starvation(&self, mut cluster: SimCluster, checks: &mut Checks) -> ClusterReport {
        info!("MC-009: WorkerStarvation");
        let config = cluster.config.clone();
        cluster.start_monitor();
        cluster.start_controller(None);
        cluster.spawn_worker(Duration::ZERO);

        let budget = config.acquire_interval() * config.acquire_attempts.saturating_sub(1);
        cluster
            .run_for(self.duration.max(budget + Duration::from_secs(5)))
            .await;
        let report = cluster.shutdown().await;

        checks.check(
            report.workers.iter().all(|w| w.starved),
            "worker did not give up on the model",
        );
        checks.check(report.generations.is_empty(), "generation ran without a model");
        report
    }
}
