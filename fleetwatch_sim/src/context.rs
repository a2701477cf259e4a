//! Simulation context implementing FleetContext for deterministic testing.

use async_trait::async_trait;
use fleetwatch_env::{FleetContext, TaskHandle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Simulation context backed by tokio's pausable clock and a seeded RNG.
///
/// Run it on a runtime with a paused clock (`start_paused = true`): timers
/// then fire in virtual time as soon as every task is idle, so a 30 s poll
/// interval costs no wall-clock time and always fires in the same order.
///
/// `advance_time` additionally skews the wall clock without firing timers,
/// which is how tests age telemetry past the online window.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Tokio instant at creation (virtual when the clock is paused)
    start: Instant,

    /// Manual skew added on top of elapsed tokio time
    offset: Arc<Mutex<Duration>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Deterministic RNG for one consumer, derived from the master seed.
    pub fn rng(&self, stream: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_mul(0x517cc1b727220a95) ^ stream)
    }

    /// Skews the clock forward without firing any timer.
    pub fn advance_time(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += duration;
    }

    /// Sets the skew so that `now()` reads `time` (never moves backwards).
    pub fn set_time(&self, time: Duration) {
        let elapsed = self.start.elapsed();
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset = time.saturating_sub(elapsed).max(*offset);
    }

    /// Wall-clock time at virtual time zero.
    pub fn epoch(&self) -> SystemTime {
        self.epoch
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            start: self.start,
            offset: Arc::clone(&self.offset),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl FleetContext for SimContext {
    fn now(&self) -> Duration {
        self.start.elapsed() + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> TaskHandle
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        TaskHandle::new(name, tokio::spawn(future))
    }
}
