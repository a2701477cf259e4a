//! Scripted telemetry backend with fault injection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetwatch_core::records::records_in_window;
use fleetwatch_core::{LocationRecord, TelemetrySource, VehicleState};
use fleetwatch_env::{AgencyId, EnvError, FleetContext, VehicleId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::context::SimContext;

#[derive(Debug, Clone, Default)]
struct SimVehicle {
    snapshot: Option<VehicleState>,
    track: Vec<LocationRecord>,
    latest: Option<LocationRecord>,
    fail_latest: bool,
}

/// Counters observed by scenarios.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FetchStats {
    pub snapshot_calls: u64,
    pub latest_calls: u64,
    pub latest_failures: u64,
    pub max_in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    snapshot_calls: AtomicU64,
    latest_calls: AtomicU64,
    latest_failures: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

/// In-memory [`TelemetrySource`] driven by test code.
///
/// Latest positions are re-stamped with the simulation clock when the fetch
/// completes, the way a live device keeps reporting.
pub struct SimFleet {
    ctx: Arc<SimContext>,
    vehicles: Mutex<BTreeMap<VehicleId, SimVehicle>>,
    latency: Mutex<Duration>,
    snapshot_failure: Mutex<Option<EnvError>>,
    history_failure: Mutex<Option<EnvError>>,
    counters: Counters,
}

impl SimFleet {
    pub fn new(ctx: Arc<SimContext>) -> Self {
        Self {
            ctx,
            vehicles: Mutex::new(BTreeMap::new()),
            latency: Mutex::new(Duration::ZERO),
            snapshot_failure: Mutex::new(None),
            history_failure: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    fn vehicles(&self) -> MutexGuard<'_, BTreeMap<VehicleId, SimVehicle>> {
        self.vehicles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a vehicle to the bootstrap snapshot.
    pub fn add_vehicle(&self, state: VehicleState) {
        let id = state.vehicle_id.clone();
        self.vehicles().entry(id).or_default().snapshot = Some(state);
    }

    /// Replaces the stored history of a vehicle.
    pub fn set_track(&self, vehicle: &VehicleId, records: Vec<LocationRecord>) {
        self.vehicles().entry(vehicle.clone()).or_default().track = records;
    }

    pub fn set_latest(&self, vehicle: &VehicleId, record: LocationRecord) {
        self.vehicles().entry(vehicle.clone()).or_default().latest = Some(record);
    }

    /// Makes every latest-position fetch for `vehicle` fail (or succeed again).
    pub fn fail_latest(&self, vehicle: &VehicleId, fail: bool) {
        self.vehicles().entry(vehicle.clone()).or_default().fail_latest = fail;
    }

    pub fn fail_snapshot(&self, error: Option<EnvError>) {
        *self.snapshot_failure.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub fn fail_history(&self, error: Option<EnvError>) {
        *self.history_failure.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Delay applied to every latest-position fetch.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            snapshot_calls: self.counters.snapshot_calls.load(Ordering::SeqCst),
            latest_calls: self.counters.latest_calls.load(Ordering::SeqCst),
            latest_failures: self.counters.latest_failures.load(Ordering::SeqCst),
            max_in_flight: self.counters.max_in_flight.load(Ordering::SeqCst),
        }
    }

    fn history_error(&self) -> Option<EnvError> {
        self.history_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.ctx.system_time())
    }
}

#[async_trait]
impl TelemetrySource for SimFleet {
    async fn fetch_records_for_device(&self, device_serial: &str) -> Result<Vec<LocationRecord>, EnvError> {
        if let Some(error) = self.history_error() {
            return Err(error);
        }
        Ok(self
            .vehicles()
            .values()
            .flat_map(|v| v.track.iter())
            .filter(|r| r.device_id == device_serial)
            .cloned()
            .collect())
    }

    async fn fetch_records_in_range(
        &self,
        vehicle: &VehicleId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LocationRecord>, EnvError> {
        if let Some(error) = self.history_error() {
            return Err(error);
        }
        let vehicles = self.vehicles();
        let sim = vehicles.get(vehicle).ok_or_else(|| EnvError::not_found(vehicle))?;
        Ok(records_in_window(&sim.track, start, end))
    }

    async fn fetch_latest_position(&self, vehicle: &VehicleId) -> Result<LocationRecord, EnvError> {
        self.counters.latest_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        let (fail, latest) = match self.vehicles().get(vehicle) {
            Some(sim) => (sim.fail_latest, sim.latest.clone()),
            None => (false, None),
        };

        if fail {
            self.counters.latest_failures.fetch_add(1, Ordering::SeqCst);
            return Err(EnvError::network(format!("latest position for {vehicle}: 502 Bad Gateway")));
        }

        let mut record = latest.ok_or_else(|| EnvError::not_found(vehicle))?;
        record.timestamp = Some(self.now());
        Ok(record)
    }

    async fn fetch_fleet_snapshot(&self, _agency: &AgencyId) -> Result<Vec<VehicleState>, EnvError> {
        self.counters.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.snapshot_failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(error);
        }
        Ok(self.vehicles().values().filter_map(|v| v.snapshot.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_latest_position_is_stamped_with_sim_clock() {
        let ctx = SimContext::shared(1);
        let fleet = SimFleet::new(ctx.clone());
        let id = VehicleId::from("veh-1");
        fleet.set_latest(&id, LocationRecord::new("veh-1", 48.0, 2.0, DateTime::<Utc>::MIN_UTC));
        fleet.set_latency(Duration::from_secs(2));

        let record = fleet.fetch_latest_position(&id).await.unwrap();
        assert_eq!(record.timestamp, Some(DateTime::<Utc>::from(ctx.epoch() + Duration::from_secs(2))));
        assert_eq!(fleet.stats().latest_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_failures() {
        let fleet = SimFleet::new(SimContext::shared(1));
        let id = VehicleId::from("veh-1");
        fleet.set_latest(&id, LocationRecord::new("veh-1", 48.0, 2.0, DateTime::<Utc>::MIN_UTC));
        fleet.fail_latest(&id, true);
        fleet.fail_snapshot(Some(EnvError::network("down")));

        assert!(fleet.fetch_latest_position(&id).await.is_err());
        assert!(fleet.fetch_fleet_snapshot(&AgencyId::new("a")).await.is_err());
        assert_eq!(fleet.stats().latest_failures, 1);
        assert!(matches!(
            fleet.fetch_latest_position(&VehicleId::from("ghost")).await,
            Err(EnvError::NotFound(_))
        ));
    }
}
