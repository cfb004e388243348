//! Simulation context implementing MonteCarloContext for deterministic testing.

use async_trait::async_trait;
use montecarlo_env::MonteCarloContext;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Simulation context backed by the tokio clock and a master seed.
///
/// Intended to run on a current-thread runtime with a paused clock: every
/// `sleep` then completes instantly in wall time while virtual time jumps
/// forward, so a minute of cluster activity takes milliseconds.
///
/// - Time: tokio `Instant` since creation, plus a manual skew
/// - Randomness: seeds derived from the master seed per stream
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Origin of `now()`
    start: Instant,

    /// Extra offset added by `advance_time`
    skew: Arc<Mutex<Duration>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: Instant::now(),
            skew: Arc::new(Mutex::new(Duration::ZERO)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Shifts `now()` forward without waking any sleeper.
    ///
    /// Use this to make queued messages look older than they are; use
    /// `tokio::time::advance` to move the whole runtime.
    pub fn advance_time(&self, duration: Duration) {
        let mut skew = self.skew.lock().unwrap_or_else(PoisonError::into_inner);
        *skew += duration;
    }

    fn skew(&self) -> Duration {
        *self.skew.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            start: self.start,
            skew: Arc::clone(&self.skew),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl MonteCarloContext for SimContext {
    fn now(&self) -> Duration {
        self.start.elapsed() + self.skew()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        debug!(task = name, "spawning simulated task");
        tokio::spawn(future)
    }

    fn derive_seed(&self, stream: u64) -> u64 {
        // Combine master seed with stream for a distinct, reproducible sequence
        self.seed.wrapping_mul(0x517cc1b727220a95) ^ stream
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
