//! Route pipeline: order -> segments -> stops -> statistics.
//!
//! Everything here is synchronous and holds no shared state, so independent
//! route requests may run concurrently.

use chrono::{DateTime, Utc};
use fleetwatch_env::VehicleId;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::records::{order_records, LocationRecord};
use crate::route_stats::{aggregate, FuelModel, RouteBounds, RouteStats};
use crate::segments::{build_segments, Segment};
use crate::source::TelemetrySource;
use crate::speed_class::SpeedBands;
use crate::stops::{detect_stops, Stop, StopDetectionConfig};

/// Configuration for route processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub speed_bands: SpeedBands,
    pub stops: StopDetectionConfig,

    /// Segments faster than this count as moving (default: 5.0 km/h).
    /// Kept apart from `stops.min_movement_speed_kmh` on purpose.
    pub moving_speed_threshold_kmh: f64,

    pub fuel: FuelModel,

    /// Default: 0.2 kg/km
    pub co2_kg_per_km: f64,

    /// Segments above this are reported as violations (default: 90.0 km/h)
    pub speed_violation_threshold_kmh: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            speed_bands: SpeedBands::default(),
            stops: StopDetectionConfig::default(),
            moving_speed_threshold_kmh: 5.0,
            fuel: FuelModel::default(),
            co2_kg_per_km: 0.2,
            speed_violation_threshold_kmh: 90.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRoute {
    pub segments: Vec<Segment>,
    pub stops: Vec<Stop>,
    pub bounds: Option<RouteBounds>,
    pub stats: RouteStats,
}

impl ProcessedRoute {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.stops.is_empty()
    }
}

/// Runs the whole pipeline over raw, possibly unordered records.
pub fn process_route(records: Vec<LocationRecord>, config: &RouteConfig) -> ProcessedRoute {
    let record_count = records.len();
    let ordered = order_records(records);

    let segments = build_segments(&ordered, &config.speed_bands);
    let stops = detect_stops(&ordered, &config.stops);
    let stats = aggregate(&ordered, record_count, &segments, &stops, config);

    ProcessedRoute {
        bounds: stats.bounds,
        segments,
        stops,
        stats,
    }
}

/// Fetches a vehicle's history for `[start, end]` and processes it.
///
/// A failed fetch fails the whole request. An empty history is a valid,
/// empty route.
pub async fn fetch_route(
    source: &dyn TelemetrySource,
    vehicle: &VehicleId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    config: &RouteConfig,
) -> Result<ProcessedRoute, FleetError> {
    if end < start {
        return Err(FleetError::route(vehicle.as_str(), format!("window ends before it starts ({start} > {end})")));
    }

    let records = source
        .fetch_records_in_range(vehicle, start, end)
        .await
        .map_err(|e| FleetError::route(vehicle.as_str(), e))?;

    tracing::debug!("Route for {}: {} records", vehicle, records.len());
    Ok(process_route(records, config))
}

/// Fetches every record of a device and processes it.
pub async fn fetch_device_route(
    source: &dyn TelemetrySource,
    device_serial: &str,
    config: &RouteConfig,
) -> Result<ProcessedRoute, FleetError> {
    let records = source
        .fetch_records_for_device(device_serial)
        .await
        .map_err(|e| FleetError::route(device_serial, e))?;

    Ok(process_route(records, config))
}
