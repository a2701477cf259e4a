//! Collaborator interfaces consumed by the core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetwatch_env::{AgencyId, EnvError, VehicleId};

use crate::fleet_state::VehicleState;
use crate::live_event::VehicleAlert;
use crate::records::LocationRecord;

/// Data-access collaborator for historical and latest telemetry.
///
/// # Implementations
///
/// - **Production**: REST client against the fleet backend
/// - **Simulation**: `SimFleet`, scripted tracks with fault injection
///
/// Returned record sequences may be unordered; the core sorts them.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    async fn fetch_records_for_device(&self, device_serial: &str) -> Result<Vec<LocationRecord>, EnvError>;

    async fn fetch_records_in_range(
        &self,
        vehicle: &VehicleId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LocationRecord>, EnvError>;

    /// Latest known position of one vehicle. Used by poll mode.
    async fn fetch_latest_position(&self, vehicle: &VehicleId) -> Result<LocationRecord, EnvError>;

    /// Every vehicle of the agency. Used once, to bootstrap a reconciler.
    async fn fetch_fleet_snapshot(&self, agency: &AgencyId) -> Result<Vec<VehicleState>, EnvError>;
}

/// External alerting collaborator. Alerts are handed over once and never retried.
pub trait AlertSink: Send + Sync + 'static {
    fn forward(&self, vehicle: &VehicleId, alert: &VehicleAlert);
}

/// Sink that only logs the alert.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn forward(&self, vehicle: &VehicleId, alert: &VehicleAlert) {
        tracing::info!(
            "Alert for {}: {} {}",
            vehicle,
            alert.alert_type.as_deref().unwrap_or("unknown"),
            alert.message.as_deref().unwrap_or("")
        );
    }
}
