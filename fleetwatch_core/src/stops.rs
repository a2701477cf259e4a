//! Stop detector: single forward pass grouping stationary records into stops.
//!
//! ```text
//!            stationary record (becomes anchor)
//!   MOVING ─────────────────────────────────────▶ IN_STOP
//!     ▲                                            │  │
//!     │        non-stationary record               │  │ stationary, > radius from anchor:
//!     └──────── (close cluster) ◀──────────────────┘  │ close cluster, re-anchor here
//!                                                     ▼
//!                                                  IN_STOP
//! ```
//!
//! A closed cluster becomes a [`Stop`] only if it spans at least
//! `min_stop_duration`. End of input closes any open cluster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::geodesy;
use crate::records::{GeoPosition, LocationRecord};

/// Configuration for the stop detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDetectionConfig {
    /// Shortest dwell reported as a stop (default: 5 minutes)
    pub min_stop_duration: Duration,

    /// Records farther than this from the anchor start a new cluster (default: 50 m)
    pub max_stop_radius_m: f64,

    /// Below this speed, with ignition off, a record is stationary (default: 5 km/h)
    pub min_movement_speed_kmh: f64,
}

impl Default for StopDetectionConfig {
    fn default() -> Self {
        Self {
            min_stop_duration: Duration::from_secs(5 * 60),
            max_stop_radius_m: 50.0,
            min_movement_speed_kmh: 5.0,
        }
    }
}

impl StopDetectionConfig {
    /// `min_stop_duration` in milliseconds, saturating at `i64::MAX`.
    pub fn min_stop_ms(&self) -> i64 {
        i64::try_from(self.min_stop_duration.as_millis()).unwrap_or(i64::MAX)
    }
}

const LONG_STOP_MS: i64 = 2 * 60 * 60 * 1000;
const OVERNIGHT_STOP_MS: i64 = 8 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopType {
    Short,
    Long,
    Overnight,
}

impl StopType {
    /// `overnight` above 8 h, `long` above 2 h, otherwise `short`.
    pub fn from_duration_ms(duration_ms: i64) -> Self {
        if duration_ms > OVERNIGHT_STOP_MS {
            StopType::Overnight
        } else if duration_ms > LONG_STOP_MS {
            StopType::Long
        } else {
            StopType::Short
        }
    }
}

/// A detected stationary dwell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    /// Mean of the cluster's coordinates
    pub center_position: GeoPosition,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub stop_type: StopType,
    pub record_count: usize,
}

/// Records absorbed so far by the open stop.
#[derive(Debug, Clone)]
struct Cluster {
    anchor: GeoPosition,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    lat_sum: f64,
    lng_sum: f64,
    count: usize,
}

impl Cluster {
    fn open(position: GeoPosition, at: DateTime<Utc>) -> Self {
        Self {
            anchor: position,
            start: at,
            end: at,
            lat_sum: position.lat,
            lng_sum: position.lng,
            count: 1,
        }
    }

    fn absorb(&mut self, position: GeoPosition, at: DateTime<Utc>) {
        self.end = at;
        self.lat_sum += position.lat;
        self.lng_sum += position.lng;
        self.count += 1;
    }

    fn close(self, min_duration_ms: i64) -> Option<Stop> {
        let duration_ms = (self.end - self.start).num_milliseconds();
        if duration_ms < min_duration_ms {
            return None;
        }

        let n = self.count as f64;
        Some(Stop {
            center_position: GeoPosition::new(self.lat_sum / n, self.lng_sum / n),
            start_time: self.start,
            end_time: self.end,
            duration_ms,
            stop_type: StopType::from_duration_ms(duration_ms),
            record_count: self.count,
        })
    }
}

#[derive(Debug)]
enum DetectorState {
    Moving,
    InStop(Cluster),
}

/// Detects stops over chronologically ordered records.
///
/// Untimed records and records with invalid coordinates are skipped without
/// changing state. Inputs shorter than three records never produce stops.
pub fn detect_stops(records: &[LocationRecord], config: &StopDetectionConfig) -> Vec<Stop> {
    if records.len() < 3 {
        return Vec::new();
    }

    let min_duration_ms = config.min_stop_ms();
    let mut stops = Vec::new();
    let mut state = DetectorState::Moving;

    for record in records {
        let Some(at) = record.timestamp else { continue };
        if !record.has_valid_position() {
            continue;
        }

        let stationary = record.speed() < config.min_movement_speed_kmh && !record.ignition_on;
        let position = record.position();

        state = match (state, stationary) {
            (DetectorState::Moving, true) => DetectorState::InStop(Cluster::open(position, at)),
            (DetectorState::Moving, false) => DetectorState::Moving,
            (DetectorState::InStop(mut cluster), true) => {
                let from_anchor_m =
                    geodesy::distance_m(cluster.anchor.lat, cluster.anchor.lng, position.lat, position.lng);
                if from_anchor_m <= config.max_stop_radius_m {
                    cluster.absorb(position, at);
                    DetectorState::InStop(cluster)
                } else {
                    stops.extend(cluster.close(min_duration_ms));
                    DetectorState::InStop(Cluster::open(position, at))
                }
            }
            (DetectorState::InStop(cluster), false) => {
                stops.extend(cluster.close(min_duration_ms));
                DetectorState::Moving
            }
        };
    }

    if let DetectorState::InStop(cluster) = state {
        stops.extend(cluster.close(min_duration_ms));
    }

    stops
}
