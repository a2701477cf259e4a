//! FleetWatch Core - Route analytics and live fleet state for vehicle telemetry
//!
//! Two independent products are built from raw positional telemetry:
//! 1. **Route analytics**: speed-classified segments, detected stops and trip
//!    statistics, computed by pure synchronous functions ([`process_route`])
//! 2. **Live fleet state**: per-vehicle online/moving status reconciled from a
//!    push channel with a polling fallback ([`FleetReconciler`])
//!
//! ```text
//! geodesy ─▶ speed_class ─▶ segments ─▶ stops ─▶ route_stats
//!                                                     │
//!                                     route::process_route
//!
//! TelemetrySource + LiveTransport ─▶ reconciler ─▶ FleetSnapshot
//! ```

pub mod config;
pub mod error;
pub mod fleet_state;
pub mod geodesy;
pub mod live_event;
pub mod reconciler;
pub mod records;
pub mod route;
pub mod route_stats;
pub mod segments;
pub mod source;
pub mod speed_class;
pub mod stops;

// Re-export key types for convenience
pub use config::{ReconcilerConfig, ReconnectPolicy};
pub use error::FleetError;
pub use fleet_state::{
    BatteryStatus, FleetSnapshot, FleetSummary, PositionUpdate, SignalStrength, VehicleState, VehicleStatus,
};
pub use live_event::{LiveEvent, VehicleAlert};
pub use reconciler::{FleetChange, FleetReconciler, FleetServices, ListenerId, TransportMode};
pub use records::{GeoPosition, LocationRecord};
pub use route::{fetch_device_route, fetch_route, process_route, ProcessedRoute, RouteConfig};
pub use route_stats::{format_duration, RouteStats};
pub use segments::Segment;
pub use source::{AlertSink, LogAlertSink, TelemetrySource};
pub use speed_class::{SpeedBands, SpeedCategory};
pub use stops::{Stop, StopDetectionConfig, StopType};
