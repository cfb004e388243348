//! Monte Carlo cluster simulator CLI
//!
//! Run the cluster scenarios deterministically on a virtual clock.

use clap::Parser;
use montecarlo_core::{FileModelLoader, Model, ModelError, ModelLoader, MonteCarloConfig};
use montecarlo_sim::scenarios::ScenarioId;
use montecarlo_sim::{ScenarioResult, ScenarioRunner, SimExport};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Monte Carlo cluster simulation CLI
#[derive(Parser, Debug)]
#[command(name = "montecarlo-sim")]
#[command(about = "Run deterministic simulations of the Monte Carlo cluster", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of worker processes
    #[arg(short, long, default_value = "3")]
    workers: usize,

    /// Scenario to run (steady_state, model_swap, model_expiry, late_worker,
    /// stale_worker, broken_formula, transient_faults, invalid_model,
    /// worker_starvation, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Run only the fault scenarios
    #[arg(long)]
    faults: bool,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Virtual duration of each scenario in seconds
    #[arg(short, long, default_value = "30")]
    duration: f64,

    /// Cluster configuration JSON (any subset of fields)
    #[arg(short, long)]
    config: Option<String>,

    /// Directory of extra model files to add to the catalog
    #[arg(short, long)]
    models: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the run to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn load_models(dir: &str) -> Result<Vec<(String, Model)>, ModelError> {
    let loader = FileModelLoader::new(dir);
    let mut models = Vec::new();
    for reference in loader.discover()? {
        let model = loader.load(&reference)?;
        info!("Loaded model '{}' from {}", model.name, reference);
        models.push((reference, model));
    }
    Ok(models)
}

/// Level used when `RUST_LOG` is unset; JSON mode keeps stdout for the summary.
fn default_directive(verbose: bool, json: bool) -> &'static str {
    if json {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    }
}

/// `RUST_LOG` when set, otherwise the level picked by the flags.
fn log_filter(verbose: bool, json: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, json)))
}

fn fail(message: String) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(args.verbose, args.json))
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        fail(format!("failed to set tracing subscriber: {}", e));
    }

    if !args.json {
        info!("Monte Carlo Cluster Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.faults {
        ScenarioId::faults()
    } else if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse::<ScenarioId>().unwrap_or_else(|e| {
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            fail(format!("{}\nAvailable scenarios: {}, all", e, names.join(", ")))
        })]
    };

    let config = match &args.config {
        Some(path) => MonteCarloConfig::from_json_file(path).unwrap_or_else(|e| fail(e.to_string())),
        None => MonteCarloConfig::default(),
    };
    let models = match &args.models {
        Some(dir) => load_models(dir).unwrap_or_else(|e| fail(e.to_string())),
        None => Vec::new(),
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    if args.export.is_some() && (scenarios.len() > 1 || args.seeds > 1) {
        fail("--export only supports a single scenario and seed".to_string());
    }

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let runner = ScenarioRunner::new(seed, args.workers)
            .with_duration(args.duration)
            .with_config(config.clone())
            .with_models(models.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED | published={} aggregated={} resyncs={}",
                        scenario.name(),
                        seed,
                        result.metrics.scenarios_published,
                        result.metrics.results_aggregated,
                        result.metrics.resyncs
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    if let (Some(path), Some(result)) = (&args.export, all_results.first()) {
        match SimExport::from_result(result).write_to_file(path) {
            Ok(()) => info!("Exported {} to {}", result.scenario.name(), path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "time_secs": r.final_time_secs,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => fail(e.to_string()),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
