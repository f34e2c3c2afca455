//! Core environment context trait for SceneSync sessions.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// Abstracts the "real world" so that the synchronization engine can run in
/// production (tokio) and in the deterministic simulation with the same code.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `std::time::Instant`
/// - **Simulation**: `SimContext` - a manually advanced virtual clock
///
/// # Determinism
///
/// Pose interpolation, monitor cadence and recording timestamps all read
/// time through [`SceneContext::now`], so a simulated run is fully
/// reproducible from its seed.
#[async_trait]
pub trait SceneContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for interpolation, monitor scheduling and recording timestamps.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time, used when stamping outgoing frames.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}
