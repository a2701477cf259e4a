//! Error types for the fleet core.

use fleetwatch_env::{AgencyId, EnvError};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FleetError {
    /// A collaborator call failed
    #[error("Source error: {0}")]
    Source(#[from] EnvError),

    /// A live frame could not be decoded into an event
    #[error("Decode error: {0}")]
    Decode(String),

    /// The initial fleet snapshot could not be fetched
    #[error("Bootstrap failed for agency {agency}: {source}")]
    Bootstrap { agency: AgencyId, source: EnvError },

    /// A route query failed as a whole; no partial route is returned
    #[error("Route query for {vehicle} failed: {reason}")]
    Route { vehicle: String, reason: String },
}

impl FleetError {
    pub fn route(vehicle: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Route {
            vehicle: vehicle.into(),
            reason: reason.to_string(),
        }
    }
}
