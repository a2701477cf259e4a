//! Core environment context trait for FleetWatch reconcilers.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the fleet reconciler can run
/// in both production (tokio wall clock) and simulation (virtual clock).
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `SystemTime::now`
/// - **Simulation**: `SimContext` - virtual wall clock on top of tokio's pausable timer
///
/// # Determinism
///
/// Every freshness decision (is a vehicle online?) goes through
/// `system_time()`, and every timer goes through `sleep()`. Nothing in the
/// reconciler reads the OS clock directly.
#[async_trait]
pub trait FleetContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to judge telemetry freshness.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task and hands back its owned handle.
    ///
    /// Dropping the handle detaches the task; call `TaskHandle::abort` to
    /// cancel it.
    fn spawn<F>(&self, name: &str, future: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Owned handle to a spawned background task.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    inner: JoinHandle<()>,
}

impl TaskHandle {
    /// Wraps a tokio join handle.
    pub fn new(name: impl Into<String>, inner: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    /// Task name given at spawn time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancels the task at its next await point.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Returns true once the task has completed or been aborted.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Waits for the task to end. Cancellation is not an error here.
    pub async fn join(self) {
        let _ = self.inner.await;
    }
}
