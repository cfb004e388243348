//! Core environment context trait for cluster components.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the controller, workers and
/// monitor can run in both production (tokio) and simulation (paused clock)
/// environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` - paused tokio clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// For simulation runs, all methods that would normally introduce
/// non-determinism (time, randomness) are controlled by the implementation.
#[async_trait]
pub trait MonteCarloContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for TTL bookkeeping, watchdogs and elapsed-time statistics.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for message timestamps.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as fractional seconds since the Unix epoch.
    ///
    /// This is the representation carried in `timestamp` fields on the wire.
    fn unix_timestamp(&self) -> f64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task and returns its handle.
    ///
    /// The handle is what bounded joins are performed against; dropping it
    /// detaches the task.
    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;

    /// Derives a seed for a component-local RNG.
    ///
    /// Simulation combines the master seed with `stream` so every component
    /// gets a distinct but reproducible sequence; production returns fresh
    /// entropy.
    fn derive_seed(&self, stream: u64) -> u64;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
