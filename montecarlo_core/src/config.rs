//! Cluster configuration.
//!
//! Every knob has a default matching the standard deployment; a JSON file
//! may override any subset of them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Names of the four logical channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueNames {
    /// Holds the single current model message (never acked away)
    pub model: String,

    /// Scenarios generated by the controller, competed for by workers
    pub scenarios: String,

    /// Results published by workers, drained by the monitor
    pub results: String,

    /// Monitor-to-controller commands
    pub commands: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            model: "modelo".to_string(),
            scenarios: "escenarios".to_string(),
            results: "resultados".to_string(),
            commands: "comandos".to_string(),
        }
    }
}

impl QueueNames {
    /// All queue names, model queue first.
    pub fn all(&self) -> [&str; 4] {
        [
            self.model.as_str(),
            self.scenarios.as_str(),
            self.results.as_str(),
            self.commands.as_str(),
        ]
    }
}

/// Configuration shared by controller, workers and monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    /// Channel names
    pub queues: QueueNames,

    /// Lifetime of a published model, both per message and per queue (default: 60000)
    pub model_ttl_ms: u64,

    /// Pacing between published scenarios (default: 50)
    pub scenario_interval_ms: u64,

    /// Wait between publishing a model and starting generation (default: 2000)
    pub settle_delay_ms: u64,

    /// Check the model queue every this many scenarios (default: 100)
    pub expiry_check_every: u64,

    /// Draws attempted before accepting a duplicate scenario (default: 1000)
    pub max_unique_attempts: u32,

    /// Pause after a transient publish failure (default: 1000)
    pub publish_retry_ms: u64,

    /// Bounded join when stopping a generation loop (default: 5000)
    pub join_timeout_ms: u64,

    /// Model polling attempts at worker startup (default: 10)
    pub acquire_attempts: u32,

    /// Pause between worker polling attempts (default: 2000)
    pub acquire_interval_ms: u64,

    /// Scenario prefetch per worker (default: 1)
    pub worker_prefetch: u16,

    /// Result prefetch for the monitor (default: 50)
    pub result_prefetch: u16,

    /// Silence after which the monitor flags a possible expiry (default: 10000)
    pub quiet_period_ms: u64,

    /// Monitor snapshot/watchdog cadence (default: 1000)
    pub refresh_ms: u64,

    /// Controller progress log cadence, in scenarios (default: 100)
    pub progress_every: u64,

    /// Worker progress log cadence, in results (default: 10)
    pub worker_progress_every: u64,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            queues: QueueNames::default(),
            model_ttl_ms: 60_000,
            scenario_interval_ms: 50,
            settle_delay_ms: 2_000,
            expiry_check_every: 100,
            max_unique_attempts: 1_000,
            publish_retry_ms: 1_000,
            join_timeout_ms: 5_000,
            acquire_attempts: 10,
            acquire_interval_ms: 2_000,
            worker_prefetch: 1,
            result_prefetch: 50,
            quiet_period_ms: 10_000,
            refresh_ms: 1_000,
            progress_every: 100,
            worker_progress_every: 10,
        }
    }
}

impl MonteCarloConfig {
    /// Parses a (possibly partial) JSON config and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Rejects settings that would stall or spin the loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.model_ttl_ms == 0, "model_ttl_ms must be positive"),
            (self.scenario_interval_ms == 0, "scenario_interval_ms must be positive"),
            (self.expiry_check_every == 0, "expiry_check_every must be positive"),
            (self.max_unique_attempts == 0, "max_unique_attempts must be positive"),
            (self.acquire_attempts == 0, "acquire_attempts must be positive"),
            (self.worker_prefetch == 0, "worker_prefetch must be positive"),
            (self.result_prefetch == 0, "result_prefetch must be positive"),
        ];
        if let Some((_, msg)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(ConfigError::Invalid(msg.to_string()));
        }

        let names = self.queues.all();
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(ConfigError::Invalid("queue names must not be empty".to_string()));
            }
            if names[i + 1..].contains(name) {
                return Err(ConfigError::Invalid(format!("queue name '{}' used twice", name)));
            }
        }
        Ok(())
    }

    pub fn model_ttl(&self) -> Duration {
        Duration::from_millis(self.model_ttl_ms)
    }

    pub fn scenario_interval(&self) -> Duration {
        Duration::from_millis(self.scenario_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn publish_retry(&self) -> Duration {
        Duration::from_millis(self.publish_retry_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn acquire_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_interval_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }
}
