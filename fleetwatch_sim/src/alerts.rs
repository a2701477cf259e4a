//! Alert sink that records what it was handed.

use fleetwatch_core::{AlertSink, VehicleAlert};
use fleetwatch_env::VehicleId;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    received: Mutex<Vec<(VehicleId, VehicleAlert)>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<(VehicleId, VehicleAlert)> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl AlertSink for RecordingAlertSink {
    fn forward(&self, vehicle: &VehicleId, alert: &VehicleAlert) {
        tracing::debug!("Alert recorded for {}", vehicle);
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((vehicle.clone(), alert.clone()));
    }
}
