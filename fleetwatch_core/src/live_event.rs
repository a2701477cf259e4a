//! Typed push-channel events, decoded once at the channel boundary.
//!
//! Wire shape (JSON):
//!
//! ```text
//! {"type": "position-update", "vehicleId": "veh-1", "payload": {"latitude": 48.8, ...}}
//! {"type": "alert",           "vehicleId": "veh-1", "payload": {"alertType": "geofence", ...}}
//! ```

use chrono::{DateTime, Utc};
use fleetwatch_env::{LiveFrame, VehicleId};
use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::fleet_state::PositionUpdate;

/// An alert raised by the backend for one vehicle.
///
/// Only the common fields are typed; everything else is kept verbatim and
/// handed to the alert sink untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleAlert {
    #[serde(default)]
    pub alert_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LiveEvent {
    #[serde(rename_all = "camelCase")]
    PositionUpdate {
        vehicle_id: VehicleId,
        payload: PositionUpdate,
    },
    #[serde(rename_all = "camelCase")]
    Alert {
        vehicle_id: VehicleId,
        payload: VehicleAlert,
    },
}

impl LiveEvent {
    pub fn decode(frame: &LiveFrame) -> Result<Self, FleetError> {
        serde_json::from_slice(&frame.payload).map_err(|e| FleetError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<LiveFrame, FleetError> {
        serde_json::to_vec(self)
            .map(LiveFrame::new)
            .map_err(|e| FleetError::Decode(e.to_string()))
    }

    pub fn vehicle_id(&self) -> &VehicleId {
        match self {
            LiveEvent::PositionUpdate { vehicle_id, .. } | LiveEvent::Alert { vehicle_id, .. } => vehicle_id,
        }
    }
}
