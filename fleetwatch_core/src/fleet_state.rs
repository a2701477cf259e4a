//! Per-vehicle live state and the merge rules applied by every transport.
//!
//! `is_online` and `is_moving` are never stored. They are derived from
//! `last_update`, speed and ignition against an injected `now`, so push and
//! poll updates are judged identically.

use chrono::{DateTime, Utc};
use fleetwatch_env::VehicleId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::records::{is_valid_coordinate, LocationRecord};

/// Default freshness window for `is_online`.
pub const DEFAULT_ONLINE_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryStatus {
    Good,
    Low,
    Critical,
    Unknown,
}

impl BatteryStatus {
    /// Above 12.5 V good, above 11.8 V low, otherwise critical.
    pub fn from_voltage(voltage: Option<f64>) -> Self {
        match voltage {
            Some(v) if !v.is_finite() => BatteryStatus::Unknown,
            Some(v) if v > 12.5 => BatteryStatus::Good,
            Some(v) if v > 11.8 => BatteryStatus::Low,
            Some(_) => BatteryStatus::Critical,
            None => BatteryStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStrength {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

impl SignalStrength {
    /// GSM signal in dBm: above -70 excellent, above -85 good, above -100 fair.
    pub fn from_dbm(dbm: Option<i32>) -> Self {
        match dbm {
            Some(s) if s > -70 => SignalStrength::Excellent,
            Some(s) if s > -85 => SignalStrength::Good,
            Some(s) if s > -100 => SignalStrength::Fair,
            Some(_) => SignalStrength::Poor,
            None => SignalStrength::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

/// Stored state of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleState {
    pub vehicle_id: VehicleId,
    #[serde(default)]
    pub last_location: Option<LastLocation>,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(default)]
    pub ignition_on: bool,
    #[serde(default = "unknown_battery")]
    pub battery_status: BatteryStatus,
    #[serde(default = "unknown_signal")]
    pub signal_strength: SignalStrength,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

fn unknown_battery() -> BatteryStatus {
    BatteryStatus::Unknown
}

fn unknown_signal() -> SignalStrength {
    SignalStrength::Unknown
}

impl VehicleState {
    /// A vehicle with no telemetry yet; offline until its first update.
    pub fn new(vehicle_id: impl Into<VehicleId>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            last_location: None,
            speed_kmh: None,
            ignition_on: false,
            battery_status: BatteryStatus::Unknown,
            signal_strength: SignalStrength::Unknown,
            last_update: None,
        }
    }

    /// True when the last update is younger than `window`.
    ///
    /// A timestamp ahead of `now` (clock skew) counts as fresh; a vehicle
    /// that never reported is offline.
    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_update {
            Some(seen) => match (now - seen).to_std() {
                Ok(age) => age < window,
                Err(_) => true,
            },
            None => false,
        }
    }

    pub fn is_moving(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.is_online(now, window) && self.speed_kmh.map_or(false, |s| s > 0.0) && self.ignition_on
    }

    /// Merges a partial update. Returns true if anything changed.
    ///
    /// Location is replaced only when both coordinates are present and
    /// finite. Every other field is replaced only when present.
    pub fn merge(&mut self, update: &PositionUpdate) -> bool {
        let before = self.clone();

        if let (Some(latitude), Some(longitude)) = (update.latitude, update.longitude) {
            if latitude.is_finite() && longitude.is_finite() {
                self.last_location = Some(LastLocation {
                    latitude,
                    longitude,
                    accuracy: update.accuracy,
                });
            }
        }
        if let Some(speed) = update.speed_kmh.filter(|s| s.is_finite()) {
            self.speed_kmh = Some(speed);
        }
        if let Some(ignition) = update.ignition_on {
            self.ignition_on = ignition;
        }
        if update.battery_voltage.is_some() {
            self.battery_status = BatteryStatus::from_voltage(update.battery_voltage);
        }
        if update.gsm_signal.is_some() {
            self.signal_strength = SignalStrength::from_dbm(update.gsm_signal);
        }
        if let Some(timestamp) = update.timestamp {
            self.last_update = Some(timestamp);
        }

        *self != before
    }
}

/// Partial telemetry carried by a `position-update` event or a poll result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PositionUpdate {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub speed_kmh: Option<f64>,
    pub ignition_on: Option<bool>,
    pub battery_voltage: Option<f64>,
    pub gsm_signal: Option<i32>,
}

impl From<&LocationRecord> for PositionUpdate {
    fn from(record: &LocationRecord) -> Self {
        // the poll path must not overwrite a good fix with the no-fix sentinel
        let placed = is_valid_coordinate(record.latitude, record.longitude);
        Self {
            latitude: placed.then_some(record.latitude),
            longitude: placed.then_some(record.longitude),
            accuracy: None,
            timestamp: record.timestamp,
            speed_kmh: record.reported_speed(),
            ignition_on: Some(record.ignition_on),
            battery_voltage: None,
            gsm_signal: None,
        }
    }
}

/// Derived flags for one vehicle at a given instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleStatus {
    #[serde(flatten)]
    pub state: VehicleState,
    pub is_online: bool,
    pub is_moving: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total: usize,
    pub online: usize,
    pub moving: usize,
    /// Online but not moving
    pub parked: usize,
    pub offline: usize,
}

/// Point-in-time view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub vehicles: BTreeMap<VehicleId, VehicleStatus>,
    pub summary: FleetSummary,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// The vehicle map owned by one reconciler.
///
/// Membership is fixed by the bootstrap snapshot: updates for unknown ids
/// are ignored and no entry is ever removed.
#[derive(Debug, Clone, Default)]
pub struct FleetMap {
    vehicles: BTreeMap<VehicleId, VehicleState>,
    last_refresh: Option<DateTime<Utc>>,
}

impl FleetMap {
    pub fn from_snapshot(snapshot: Vec<VehicleState>) -> Self {
        Self {
            vehicles: snapshot.into_iter().map(|v| (v.vehicle_id.clone(), v)).collect(),
            last_refresh: None,
        }
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    pub fn get(&self, id: &VehicleId) -> Option<&VehicleState> {
        self.vehicles.get(id)
    }

    /// Applies an update to a known vehicle. Returns false for unknown ids
    /// and for updates that change nothing.
    pub fn apply(&mut self, id: &VehicleId, update: &PositionUpdate) -> bool {
        match self.vehicles.get_mut(id) {
            Some(state) => state.merge(update),
            None => false,
        }
    }

    /// Replaces stored states with a fresh snapshot, keeping existing membership.
    pub fn refresh_from(&mut self, snapshot: Vec<VehicleState>) -> usize {
        let mut updated = 0;
        for fresh in snapshot {
            if let Some(state) = self.vehicles.get_mut(&fresh.vehicle_id) {
                if *state != fresh {
                    *state = fresh;
                    updated += 1;
                }
            }
        }
        updated
    }

    pub fn mark_refreshed(&mut self, at: DateTime<Utc>) {
        self.last_refresh = Some(at);
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    pub fn online_ids(&self, now: DateTime<Utc>, window: Duration) -> Vec<VehicleId> {
        self.vehicles
            .values()
            .filter(|v| v.is_online(now, window))
            .map(|v| v.vehicle_id.clone())
            .collect()
    }

    pub fn status(&self, id: &VehicleId, now: DateTime<Utc>, window: Duration) -> Option<VehicleStatus> {
        self.vehicles.get(id).map(|state| status_of(state, now, window))
    }

    pub fn snapshot(&self, now: DateTime<Utc>, window: Duration) -> FleetSnapshot {
        let vehicles: BTreeMap<VehicleId, VehicleStatus> = self
            .vehicles
            .iter()
            .map(|(id, state)| (id.clone(), status_of(state, now, window)))
            .collect();

        let mut summary = FleetSummary {
            total: vehicles.len(),
            ..FleetSummary::default()
        };
        for status in vehicles.values() {
            match (status.is_online, status.is_moving) {
                (true, true) => {
                    summary.online += 1;
                    summary.moving += 1;
                }
                (true, false) => {
                    summary.online += 1;
                    summary.parked += 1;
                }
                (false, _) => summary.offline += 1,
            }
        }

        FleetSnapshot {
            vehicles,
            summary,
            refreshed_at: self.last_refresh,
        }
    }
}

fn status_of(state: &VehicleState, now: DateTime<Utc>, window: Duration) -> VehicleStatus {
    VehicleStatus {
        state: state.clone(),
        is_online: state.is_online(now, window),
        is_moving: state.is_moving(now, window),
    }
}
