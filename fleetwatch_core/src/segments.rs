//! Segment builder: consecutive record pairs -> classified path segments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geodesy;
use crate::records::{GeoPosition, LocationRecord};
use crate::speed_class::{SpeedBands, SpeedCategory};

/// The path between two consecutive records, classified by the start record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub start_point: GeoPosition,
    pub end_point: GeoPosition,
    /// Two-point polyline, start then end
    pub polyline: [GeoPosition; 2],
    pub speed_kmh: f64,
    pub ignition_on: bool,
    pub category: SpeedCategory,
    pub color: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    /// Great-circle length, unrounded
    pub distance_km: f64,
    pub bearing_deg: f64,
}

/// Builds one segment per consecutive pair of usable records.
///
/// A pair is skipped (not errored) when either end is untimed or has an
/// invalid coordinate. The output keeps input order and never has more than
/// `records.len() - 1` entries; callers pass chronologically ordered input.
pub fn build_segments(records: &[LocationRecord], bands: &SpeedBands) -> Vec<Segment> {
    if records.len() < 2 {
        return Vec::new();
    }

    records
        .windows(2)
        .filter_map(|pair| build_segment(&pair[0], &pair[1], bands))
        .collect()
}

fn build_segment(current: &LocationRecord, next: &LocationRecord, bands: &SpeedBands) -> Option<Segment> {
    let (Some(start_time), Some(end_time)) = (current.timestamp, next.timestamp) else {
        return None;
    };
    if !current.has_valid_position() || !next.has_valid_position() {
        return None;
    }

    let start = current.position();
    let end = next.position();
    let class = bands.classify(current.speed_kmh, current.ignition_on);

    Some(Segment {
        start_point: start,
        end_point: end,
        polyline: [start, end],
        speed_kmh: current.speed(),
        ignition_on: current.ignition_on,
        category: class.category,
        color: class.color,
        start_time,
        end_time,
        duration_ms: (end_time - start_time).num_milliseconds(),
        distance_km: geodesy::distance(start.lat, start.lng, end.lat, end.lng),
        bearing_deg: geodesy::bearing(start.lat, start.lng, end.lat, end.lng),
    })
}
