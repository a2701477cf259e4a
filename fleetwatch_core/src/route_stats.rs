//! Route aggregator: trip totals, speed summary, bounds and consumption.
//!
//! Precision of reported figures:
//! - distances: km, 2 decimals
//! - speeds: km/h, 1 decimal
//! - fuel: litres, 1 decimal
//! - CO2: kg, 1 decimal
//! - data quality: ratio in `[0, 1]`, 4 decimals
//!
//! Per-segment distances are never rounded; only the totals here are.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::records::{GeoPosition, LocationRecord};
use crate::route::RouteConfig;
use crate::segments::Segment;
use crate::speed_class::SpeedCategory;
use crate::stops::Stop;

// ============================================================================
// FUEL MODEL
// ============================================================================

/// A fuel rate applying to average speeds strictly below `below_kmh`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FuelBand {
    pub below_kmh: f64,
    pub liters_per_100km: f64,
}

/// Speed-banded L/100km table modelling city, mixed, highway and high-speed driving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuelModel {
    /// Bands checked in order; the first whose bound exceeds the speed wins
    pub bands: Vec<FuelBand>,

    /// Rate above every band (default: 9 L/100km)
    pub above_liters_per_100km: f64,
}

impl Default for FuelModel {
    fn default() -> Self {
        Self {
            bands: vec![
                FuelBand { below_kmh: 30.0, liters_per_100km: 12.0 },
                FuelBand { below_kmh: 60.0, liters_per_100km: 8.0 },
                FuelBand { below_kmh: 90.0, liters_per_100km: 7.0 },
            ],
            above_liters_per_100km: 9.0,
        }
    }
}

impl FuelModel {
    pub fn rate_for(&self, average_speed_kmh: f64) -> f64 {
        self.bands
            .iter()
            .find(|band| average_speed_kmh < band.below_kmh)
            .map(|band| band.liters_per_100km)
            .unwrap_or(self.above_liters_per_100km)
    }

    /// Litres for `distance_km` at the rate of `average_speed_kmh`, 1 decimal.
    pub fn estimate_liters(&self, distance_km: f64, average_speed_kmh: Option<f64>) -> f64 {
        match average_speed_kmh {
            Some(speed) if distance_km > 0.0 => round_to(distance_km * self.rate_for(speed) / 100.0, 1),
            _ => 0.0,
        }
    }
}

// ============================================================================
// OUTPUT TYPES
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeTotals {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_ms: i64,
    pub moving_ms: i64,
    pub stopped_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceTotals {
    pub total_km: f64,
    pub moving_km: f64,
}

/// A segment driven above the violation threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedViolation {
    pub timestamp: DateTime<Utc>,
    pub speed_kmh: f64,
    pub location: GeoPosition,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedStats {
    pub min_kmh: f64,
    pub max_kmh: f64,
    pub mean_kmh: f64,
    pub p50_kmh: f64,
    pub p90_kmh: f64,
    pub p95_kmh: f64,
    /// Total distance over total elapsed hours
    pub average_speed_kmh: f64,
    /// Moving distance over moving hours
    pub moving_average_speed_kmh: f64,
    pub time_by_category_ms: BTreeMap<SpeedCategory, i64>,
    pub distance_by_category_km: BTreeMap<SpeedCategory, f64>,
    pub violations: Vec<SpeedViolation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
    pub center: GeoPosition,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuality {
    pub record_count: usize,
    pub valid_record_count: usize,
    /// `valid_record_count / record_count`, 0 for an empty input
    pub ratio: f64,
}

/// Statistics for one (vehicle, time window) query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStats {
    pub time: TimeTotals,
    pub distance: DistanceTotals,
    pub speed: SpeedStats,
    pub stops: Vec<Stop>,
    pub stop_count: usize,
    pub bounds: Option<RouteBounds>,
    pub data_quality: DataQuality,
    pub fuel_estimate_liters: f64,
    pub co2_estimate_kg: f64,
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Combines ordered records, their segments and stops into [`RouteStats`].
///
/// `record_count` is the size of the raw input before untimed records were
/// dropped, so that they count against data quality.
pub fn aggregate(
    records: &[LocationRecord],
    record_count: usize,
    segments: &[Segment],
    stops: &[Stop],
    config: &RouteConfig,
) -> RouteStats {
    let start_time = records.first().and_then(|r| r.timestamp);
    let end_time = records.last().and_then(|r| r.timestamp);
    let total_ms = match (start_time, end_time) {
        (Some(start), Some(end)) => (end - start).num_milliseconds().max(0),
        _ => 0,
    };

    let mut total_km = 0.0;
    let mut moving_km = 0.0;
    let mut moving_ms = 0_i64;
    let mut time_by_category_ms: BTreeMap<SpeedCategory, i64> =
        SpeedCategory::ALL.iter().map(|c| (*c, 0)).collect();
    let mut distance_by_category_km: BTreeMap<SpeedCategory, f64> =
        SpeedCategory::ALL.iter().map(|c| (*c, 0.0)).collect();
    let mut violations = Vec::new();

    for segment in segments {
        total_km += segment.distance_km;

        // Deliberately not the stop detector's stationary threshold
        if segment.speed_kmh > config.moving_speed_threshold_kmh {
            moving_km += segment.distance_km;
            moving_ms += segment.duration_ms;
        }

        *time_by_category_ms.entry(segment.category).or_insert(0) += segment.duration_ms;
        *distance_by_category_km.entry(segment.category).or_insert(0.0) += segment.distance_km;

        if segment.speed_kmh > config.speed_violation_threshold_kmh {
            violations.push(SpeedViolation {
                timestamp: segment.start_time,
                speed_kmh: segment.speed_kmh,
                location: segment.start_point,
                duration_ms: segment.duration_ms,
            });
        }
    }

    for km in distance_by_category_km.values_mut() {
        *km = round_to(*km, 2);
    }

    // Only the record opening a usable pair reports a speed for the route.
    let speeds: Vec<f64> = records
        .windows(2)
        .filter(|pair| pair[0].is_usable() && pair[1].is_usable())
        .filter_map(|pair| pair[0].reported_speed())
        .collect();
    let mean_speed = mean(&speeds);

    let speed = SpeedStats {
        average_speed_kmh: round_to(per_hour(total_km, total_ms), 1),
        moving_average_speed_kmh: round_to(per_hour(moving_km, moving_ms), 1),
        time_by_category_ms,
        distance_by_category_km,
        violations,
        ..summarize_speeds(&speeds)
    };

    let valid_record_count = records.iter().filter(|r| r.is_usable()).count();
    let data_quality = DataQuality {
        record_count,
        valid_record_count,
        ratio: if record_count == 0 {
            0.0
        } else {
            round_to(valid_record_count as f64 / record_count as f64, 4)
        },
    };

    RouteStats {
        time: TimeTotals {
            start_time,
            end_time,
            total_ms,
            moving_ms,
            stopped_ms: (total_ms - moving_ms).max(0),
        },
        distance: DistanceTotals {
            total_km: round_to(total_km, 2),
            moving_km: round_to(moving_km, 2),
        },
        speed,
        stops: stops.to_vec(),
        stop_count: stops.len(),
        bounds: route_bounds(records),
        data_quality,
        fuel_estimate_liters: config.fuel.estimate_liters(total_km, mean_speed),
        co2_estimate_kg: round_to(total_km * config.co2_kg_per_km, 1),
    }
}

/// Bounding box over records with valid coordinates; `None` if there are none.
pub fn route_bounds(records: &[LocationRecord]) -> Option<RouteBounds> {
    let mut valid = records.iter().filter(|r| r.has_valid_position());
    let first = valid.next()?;

    let (mut north, mut south) = (first.latitude, first.latitude);
    let (mut east, mut west) = (first.longitude, first.longitude);
    for record in valid {
        north = north.max(record.latitude);
        south = south.min(record.latitude);
        east = east.max(record.longitude);
        west = west.min(record.longitude);
    }

    Some(RouteBounds {
        north,
        south,
        east,
        west,
        center: GeoPosition::new((north + south) / 2.0, (east + west) / 2.0),
    })
}

fn summarize_speeds(speeds: &[f64]) -> SpeedStats {
    if speeds.is_empty() {
        return SpeedStats::default();
    }

    let mut sorted = speeds.to_vec();
    sorted.sort_by(f64::total_cmp);

    SpeedStats {
        min_kmh: round_to(sorted[0], 1),
        max_kmh: round_to(sorted[sorted.len() - 1], 1),
        mean_kmh: round_to(mean(&sorted).unwrap_or(0.0), 1),
        p50_kmh: round_to(percentile(&sorted, 50.0), 1),
        p90_kmh: round_to(percentile(&sorted, 90.0), 1),
        p95_kmh: round_to(percentile(&sorted, 95.0), 1),
        ..SpeedStats::default()
    }
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn per_hour(km: f64, ms: i64) -> f64 {
    if ms <= 0 {
        0.0
    } else {
        km / (ms as f64 / 3_600_000.0)
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Human readable duration: `1d 2h 3m`, `2h 5m`, `4m 10s` or `12s`.
pub fn format_duration(duration_ms: i64) -> String {
    let seconds = duration_ms.max(0) / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {}h {}m", days, hours % 24, minutes % 60)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::build_segments;
    use crate::stops::detect_stops;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn stats_for(records: &[LocationRecord]) -> RouteStats {
        let config = RouteConfig::default();
        let segments = build_segments(records, &config.speed_bands);
        let stops = detect_stops(records, &config.stops);
        aggregate(records, records.len(), &segments, &stops, &config)
    }

    fn trip() -> Vec<LocationRecord> {
        // north along a meridian, ~1.11 km per step, one step per minute
        (0..6)
            .map(|i| {
                LocationRecord::new("dev", 48.0 + i as f64 * 0.01, 2.0, t0() + Duration::minutes(i))
                    .with_speed(if i == 2 { 0.0 } else { 66.0 })
                    .with_ignition(true)
            })
            .collect()
    }

    #[test]
    fn test_empty_input_is_a_valid_zero_result() {
        let stats = stats_for(&[]);
        assert_eq!(stats.distance.total_km, 0.0);
        assert_eq!(stats.data_quality.ratio, 0.0);
        assert!(stats.bounds.is_none());
        assert_eq!(stats.fuel_estimate_liters, 0.0);
    }

    #[test]
    fn test_totals_match_segment_sum() {
        let records = trip();
        let segments = build_segments(&records, &RouteConfig::default().speed_bands);
        let stats = stats_for(&records);

        let sum: f64 = segments.iter().map(|s| s.distance_km).sum();
        assert_relative_eq!(stats.distance.total_km, sum, epsilon = 0.005);
        assert_eq!(stats.time.total_ms, 5 * 60 * 1000);
    }

    #[test]
    fn test_moving_excludes_slow_segments() {
        let stats = stats_for(&trip());
        // segment starting at the 0 km/h record is not moving
        assert_eq!(stats.time.moving_ms, 4 * 60 * 1000);
        assert_eq!(stats.time.stopped_ms, 60 * 1000);
        assert!(stats.distance.moving_km < stats.distance.total_km);
        assert!(stats.speed.moving_average_speed_kmh >= stats.speed.average_speed_kmh);
    }

    #[test]
    fn test_moving_threshold_is_independent_of_stop_threshold() {
        let mut config = RouteConfig::default();
        config.moving_speed_threshold_kmh = 70.0;
        let records = trip();
        let segments = build_segments(&records, &config.speed_bands);
        let stats = aggregate(&records, records.len(), &segments, &[], &config);

        assert_eq!(stats.time.moving_ms, 0);
        assert_eq!(config.stops.min_movement_speed_kmh, 5.0);
    }

    #[test]
    fn test_average_speed_uses_elapsed_hours() {
        let stats = stats_for(&trip());
        let expected = stats.distance.total_km / (5.0 / 60.0);
        assert_relative_eq!(stats.speed.average_speed_kmh, expected, epsilon = 0.2);
    }

    #[test]
    fn test_speed_summary_and_percentiles() {
        let speeds = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0];
        let summary = summarize_speeds(&speeds);
        assert_eq!(summary.min_kmh, 10.0);
        assert_eq!(summary.max_kmh, 100.0);
        assert_eq!(summary.mean_kmh, 55.0);
        assert_eq!(summary.p50_kmh, 50.0);
        assert_eq!(summary.p90_kmh, 90.0);
        assert_eq!(summary.p95_kmh, 100.0);
    }

    #[test]
    fn test_bounds_ignore_invalid_coordinates() {
        let mut records = trip();
        records.push(LocationRecord::new("dev", 0.0, 0.0, t0() + Duration::minutes(9)));
        records.push(LocationRecord::new("dev", 95.0, 2.0, t0() + Duration::minutes(10)));

        let bounds = route_bounds(&records).unwrap();
        assert_relative_eq!(bounds.north, 48.05);
        assert_relative_eq!(bounds.south, 48.0);
        assert_relative_eq!(bounds.center.lat, 48.025);
        assert_relative_eq!(bounds.east, 2.0);
    }

    #[test]
    fn test_data_quality_counts_dropped_records() {
        let mut records = trip();
        records.push(LocationRecord::new("dev", 0.0, 0.0, t0() + Duration::minutes(9)));
        let config = RouteConfig::default();
        let segments = build_segments(&records, &config.speed_bands);
        // two more raw records were dropped upstream for lacking timestamps
        let stats = aggregate(&records, records.len() + 2, &segments, &[], &config);

        assert_eq!(stats.data_quality.record_count, 9);
        assert_eq!(stats.data_quality.valid_record_count, 6);
        assert_relative_eq!(stats.data_quality.ratio, 0.6667);
    }

    #[test]
    fn test_fuel_bands() {
        let model = FuelModel::default();
        assert_eq!(model.rate_for(10.0), 12.0);
        assert_eq!(model.rate_for(30.0), 8.0);
        assert_eq!(model.rate_for(89.9), 7.0);
        assert_eq!(model.rate_for(90.0), 9.0);
        assert_eq!(model.estimate_liters(100.0, Some(70.0)), 7.0);
        assert_eq!(model.estimate_liters(0.0, Some(70.0)), 0.0);
        assert_eq!(model.estimate_liters(50.0, None), 0.0);
    }

    #[test]
    fn test_consumption_estimates() {
        let stats = stats_for(&trip());
        let km = stats.distance.total_km;
        // pair-opening speeds average 52.8 km/h -> 8 L/100km
        assert_relative_eq!(stats.fuel_estimate_liters, round_to(km * 0.08, 1));
        assert_relative_eq!(stats.co2_estimate_kg, round_to(km * 0.2, 1));
    }

    #[test]
    fn test_speed_summary_ignores_records_outside_usable_pairs() {
        let mut records: Vec<LocationRecord> = (0..4)
            .map(|i| {
                LocationRecord::new("dev", 48.0 + i as f64 * 0.01, 2.0, t0() + Duration::minutes(i))
                    .with_speed(20.0)
                    .with_ignition(true)
            })
            .collect();
        records.push(LocationRecord::new("dev", 0.0, 0.0, t0() + Duration::minutes(4)).with_speed(180.0));

        let stats = stats_for(&records);
        let km = stats.distance.total_km;

        assert_eq!(stats.speed.max_kmh, 20.0);
        assert_eq!(stats.speed.min_kmh, 20.0);
        assert_eq!(stats.speed.mean_kmh, 20.0);
        // 20 km/h falls in the 12 L/100km band
        assert_relative_eq!(stats.fuel_estimate_liters, round_to(km * 0.12, 1));
    }

    #[test]
    fn test_speed_violations_and_category_time() {
        let records = vec![
            LocationRecord::new("dev", 48.0, 2.0, t0()).with_speed(120.0).with_ignition(true),
            LocationRecord::new("dev", 48.05, 2.0, t0() + Duration::minutes(3))
                .with_speed(60.0)
                .with_ignition(true),
            LocationRecord::new("dev", 48.08, 2.0, t0() + Duration::minutes(6)),
        ];
        let stats = stats_for(&records);

        assert_eq!(stats.speed.violations.len(), 1);
        assert_eq!(stats.speed.violations[0].speed_kmh, 120.0);
        assert_eq!(stats.speed.time_by_category_ms[&SpeedCategory::VeryHigh], 180_000);
        assert_eq!(stats.speed.time_by_category_ms[&SpeedCategory::High], 180_000);
        assert_eq!(stats.speed.time_by_category_ms[&SpeedCategory::Stopped], 0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(12_000), "12s");
        assert_eq!(format_duration(250_000), "4m 10s");
        assert_eq!(format_duration((2 * 3600 + 5 * 60) * 1000), "2h 5m");
        assert_eq!(format_duration((26 * 3600 + 3 * 60) * 1000), "1d 2h 3m");
        assert_eq!(format_duration(-5), "0s");
    }
}
