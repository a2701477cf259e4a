//! Raw telemetry records and the ordering/validity rules every engine shares.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPosition {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// True when the pair can be used for geometry (see [`is_valid_coordinate`]).
    pub fn is_valid(&self) -> bool {
        is_valid_coordinate(self.lat, self.lng)
    }
}

/// One raw positional + telemetry sample from a tracked vehicle.
///
/// Records are produced by the ingestion side and never mutated here.
/// Speed and timestamp are optional on the wire: a missing speed counts as
/// 0 km/h, a missing timestamp makes the record unusable for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(default)]
    pub ignition_on: bool,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LocationRecord {
    /// Creates a stationary, ignition-off record at the given time.
    pub fn new(device_id: impl Into<String>, latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            latitude,
            longitude,
            speed_kmh: None,
            ignition_on: false,
            timestamp: Some(timestamp),
        }
    }

    pub fn with_speed(mut self, speed_kmh: f64) -> Self {
        self.speed_kmh = Some(speed_kmh);
        self
    }

    pub fn with_ignition(mut self, ignition_on: bool) -> Self {
        self.ignition_on = ignition_on;
        self
    }

    /// Speed in km/h with absent or non-finite values read as 0.
    pub fn speed(&self) -> f64 {
        match self.speed_kmh {
            Some(speed) if speed.is_finite() => speed,
            _ => 0.0,
        }
    }

    /// Returns the reported speed only when it is present and finite.
    pub fn reported_speed(&self) -> Option<f64> {
        self.speed_kmh.filter(|s| s.is_finite())
    }

    pub fn position(&self) -> GeoPosition {
        GeoPosition::new(self.latitude, self.longitude)
    }

    pub fn has_valid_position(&self) -> bool {
        is_valid_coordinate(self.latitude, self.longitude)
    }

    /// A record is usable by the geometry engines when it is timed and placed.
    pub fn is_usable(&self) -> bool {
        self.timestamp.is_some() && self.has_valid_position()
    }
}

/// Finite, in range, and not the (0,0) "no fix" sentinel that trackers emit.
pub fn is_valid_coordinate(lat: f64, lng: f64) -> bool {
    lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng)
        && !(lat == 0.0 && lng == 0.0)
}

/// Drops untimed records and sorts the rest chronologically.
///
/// The sort is stable, so records sharing a timestamp keep their input order.
pub fn order_records(records: Vec<LocationRecord>) -> Vec<LocationRecord> {
    let mut timed: Vec<LocationRecord> = records
        .into_iter()
        .filter(|r| r.timestamp.is_some())
        .collect();
    timed.sort_by_key(|r| r.timestamp);
    timed
}

/// Records whose timestamp falls inside `[start, end]`, in input order.
///
/// Used for timeline scrubbing over an already processed route.
pub fn records_in_window(
    records: &[LocationRecord],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<LocationRecord> {
    records
        .iter()
        .filter(|r| matches!(r.timestamp, Some(ts) if ts >= start && ts <= end))
        .cloned()
        .collect()
}
