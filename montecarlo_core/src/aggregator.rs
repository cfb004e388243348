//! Live statistics over the result stream.

use crate::wire::ResultRecord;
use montecarlo_env::WorkerId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-worker tally under the current model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub count: u64,
    pub last_value: f64,
}

/// Effect of ingesting one result.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Recorded,

    /// The result named a different model; all statistics were reset and
    /// the result became the first sample of the new model.
    ModelChanged { previous: String, current: String },
}

/// Output of the quiet-period watchdog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Liveness {
    /// No model seen yet
    Idle,

    /// Results arrived within the quiet period (or already flagged)
    Receiving,

    /// Nothing received for `silent_for`; reported once per silence
    PossiblyExpired { silent_for: Duration },
}

/// One row of the per-worker table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerShare {
    pub worker_id: WorkerId,
    pub count: u64,

    /// Percentage of all results under this model
    pub share_pct: f64,

    pub last_value: f64,
}

/// Point-in-time view of the aggregate statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub model_name: Option<String>,
    pub count: u64,
    pub mean: f64,

    /// Population standard deviation
    pub std_dev: f64,

    pub min: f64,
    pub max: f64,

    /// Time since the first result of this model
    pub elapsed: Duration,

    /// Results per second over `elapsed`
    pub throughput: f64,

    pub workers: Vec<WorkerShare>,
}

/// Aggregates results for the monitor.
///
/// Times are monotonic offsets supplied by the caller (the context clock).
/// Duplicated results are counted again.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    model_name: Option<String>,
    values: Vec<f64>,
    workers: BTreeMap<WorkerId, WorkerStats>,
    started_at: Option<Duration>,
    last_receipt: Option<Duration>,
    quiet_period: Duration,
    expiry_flagged: bool,

    /// Model changes observed
    epochs: u64,
}

impl ResultAggregator {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            model_name: None,
            values: Vec::new(),
            workers: BTreeMap::new(),
            started_at: None,
            last_receipt: None,
            quiet_period,
            expiry_flagged: false,
            epochs: 0,
        }
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn count(&self) -> u64 {
        self.values.len() as u64
    }

    pub fn epochs(&self) -> u64 {
        self.epochs
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&WorkerStats> {
        self.workers.get(id)
    }

    /// Forgets the current model and all statistics.
    pub fn reset(&mut self) {
        self.model_name = None;
        self.clear();
    }

    fn clear(&mut self) {
        self.values.clear();
        self.workers.clear();
        self.started_at = None;
        self.last_receipt = None;
        self.expiry_flagged = false;
    }

    /// Folds one result in.
    pub fn ingest(&mut self, result: &ResultRecord, now: Duration) -> IngestOutcome {
        let mut outcome = IngestOutcome::Recorded;

        if result.has_known_model() && self.model_name.as_deref() != Some(result.model_name.as_str()) {
            let previous = self.model_name.replace(result.model_name.clone());
            self.clear();
            self.epochs += 1;
            outcome = IngestOutcome::ModelChanged {
                previous: previous.unwrap_or_default(),
                current: result.model_name.clone(),
            };
        }

        self.values.push(result.value);
        let stats = self.workers.entry(result.worker_id.clone()).or_default();
        stats.count += 1;
        stats.last_value = result.value;

        self.started_at.get_or_insert(now);
        self.last_receipt = Some(now);
        self.expiry_flagged = false;
        outcome
    }

    /// Quiet-period watchdog; display only.
    pub fn check_liveness(&mut self, now: Duration) -> Liveness {
        if self.model_name.is_none() {
            return Liveness::Idle;
        }
        let Some(last) = self.last_receipt else {
            return Liveness::Idle;
        };

        let silent_for = now.saturating_sub(last);
        if silent_for >= self.quiet_period && !self.expiry_flagged {
            self.expiry_flagged = true;
            return Liveness::PossiblyExpired { silent_for };
        }
        Liveness::Receiving
    }

    pub fn snapshot(&self, now: Duration) -> StatsSnapshot {
        let count = self.values.len();
        let (mean, std_dev, min, max) = if count == 0 {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let n = count as f64;
            let mean = self.values.iter().sum::<f64>() / n;
            let variance = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let min = self.values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (mean, variance.sqrt(), min, max)
        };

        let elapsed = self
            .started_at
            .map(|start| now.saturating_sub(start))
            .unwrap_or_default();
        let throughput = if elapsed.is_zero() {
            0.0
        } else {
            count as f64 / elapsed.as_secs_f64()
        };

        let workers = self
            .workers
            .iter()
            .map(|(id, stats)| WorkerShare {
                worker_id: id.clone(),
                count: stats.count,
                share_pct: if count == 0 {
                    0.0
                } else {
                    stats.count as f64 * 100.0 / count as f64
                },
                last_value: stats.last_value,
            })
            .collect();

        StatsSnapshot {
            model_name: self.model_name.clone(),
            count: count as u64,
            mean,
            std_dev,
            min,
            max,
            elapsed,
            throughput,
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scenario;
    use approx::assert_relative_eq;

    fn result(worker: &str, model: &str, value: f64) -> ResultRecord {
        ResultRecord {
            worker_id: WorkerId::from(worker),
            scenario: Scenario::new(),
            value,
            timestamp: 0.0,
            model_name: model.to_string(),
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_first_result_sets_model() {
        let mut agg = ResultAggregator::new(secs(10));
        let outcome = agg.ingest(&result("1", "beneficio", 90.0), secs(1));
        assert_eq!(
            outcome,
            IngestOutcome::ModelChanged {
                previous: String::new(),
                current: "beneficio".to_string()
            }
        );
        assert_eq!(agg.model_name(), Some("beneficio"));
        assert_eq!(agg.count(), 1);
    }

    #[test]
    fn test_statistics() {
        let mut agg = ResultAggregator::new(secs(10));
        for (i, v) in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].into_iter().enumerate() {
            let worker = if i % 2 == 0 { "a" } else { "b" };
            agg.ingest(&result(worker, "m", v), secs(2));
        }

        let snap = agg.snapshot(secs(6));
        assert_eq!(snap.count, 8);
        assert_relative_eq!(snap.mean, 5.0);
        assert_relative_eq!(snap.std_dev, 2.0);
        assert_eq!(snap.min, 2.0);
        assert_eq!(snap.max, 9.0);
        assert_eq!(snap.elapsed, secs(4));
        assert_relative_eq!(snap.throughput, 2.0);

        assert_eq!(snap.workers.len(), 2);
        assert_eq!(snap.workers[0].worker_id.as_str(), "a");
        assert_eq!(snap.workers[0].count, 4);
        assert_relative_eq!(snap.workers[0].share_pct, 50.0);
        assert_eq!(snap.workers[1].last_value, 9.0);
    }

    #[test]
    fn test_model_change_resets_everything() {
        let mut agg = ResultAggregator::new(secs(10));
        agg.ingest(&result("1", "beneficio", 90.0), secs(1));
        agg.ingest(&result("2", "beneficio", 80.0), secs(2));

        let outcome = agg.ingest(&result("3", "area", 12.5), secs(5));
        assert_eq!(
            outcome,
            IngestOutcome::ModelChanged {
                previous: "beneficio".to_string(),
                current: "area".to_string()
            }
        );

        let snap = agg.snapshot(secs(7));
        assert_eq!(snap.model_name.as_deref(), Some("area"));
        assert_eq!(snap.count, 1);
        assert_eq!(snap.mean, 12.5);
        assert_eq!(snap.elapsed, secs(2));
        assert_eq!(snap.workers.len(), 1);
        assert!(agg.worker(&WorkerId::from("1")).is_none());
        assert_eq!(agg.epochs(), 2);
    }

    #[test]
    fn test_unknown_model_name_does_not_reset() {
        let mut agg = ResultAggregator::new(secs(10));
        agg.ingest(&result("1", "beneficio", 90.0), secs(1));
        assert_eq!(agg.ingest(&result("1", "", 70.0), secs(2)), IngestOutcome::Recorded);
        assert_eq!(agg.ingest(&result("1", "N/A", 50.0), secs(3)), IngestOutcome::Recorded);
        assert_eq!(agg.count(), 3);
        assert_eq!(agg.worker(&WorkerId::from("1")).unwrap().last_value, 50.0);
    }

    #[test]
    fn test_duplicates_are_counted() {
        let mut agg = ResultAggregator::new(secs(10));
        let r = result("1", "m", 1.0);
        agg.ingest(&r, secs(1));
        agg.ingest(&r, secs(1));
        assert_eq!(agg.count(), 2);
    }

    #[test]
    fn test_liveness_watchdog_fires_once_per_silence() {
        let mut agg = ResultAggregator::new(secs(10));
        assert_eq!(agg.check_liveness(secs(100)), Liveness::Idle);

        agg.ingest(&result("1", "m", 1.0), secs(1));
        assert_eq!(agg.check_liveness(secs(5)), Liveness::Receiving);
        assert_eq!(
            agg.check_liveness(secs(11)),
            Liveness::PossiblyExpired { silent_for: secs(10) }
        );
        assert_eq!(agg.check_liveness(secs(20)), Liveness::Receiving);

        agg.ingest(&result("1", "m", 1.0), secs(21));
        assert!(matches!(
            agg.check_liveness(secs(40)),
            Liveness::PossiblyExpired { .. }
        ));
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = ResultAggregator::new(secs(10)).snapshot(secs(3));
        assert_eq!(snap.count, 0);
        assert_eq!(snap.mean, 0.0);
        assert!(snap.workers.is_empty());
        assert_eq!(snap.model_name, None);
    }
}
