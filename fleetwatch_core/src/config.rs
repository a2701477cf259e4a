//! Reconciler configuration and `FLEETWATCH_*` environment overlays.
//!
//! Absent or unparseable variables fall back to the defaults, as does a
//! zero poll interval.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::fleet_state::DEFAULT_ONLINE_WINDOW;
use crate::route::RouteConfig;

/// Push-channel reconnect schedule.
///
/// The default is a single attempt after 5 s. Raising `max_attempts` and
/// `multiplier` turns it into exponential backoff capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: 1,
            multiplier: 1.0,
            max_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based), or `None` once
    /// the attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let secs = (self.delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Some(Duration::from_secs_f64(secs))
    }
}

/// Configuration for one fleet reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Poll tick period (default: 30 s)
    pub poll_interval: Duration,

    /// Freshness window for `is_online` (default: 5 min)
    pub online_window: Duration,

    pub reconnect: ReconnectPolicy,

    /// Switch to polling once reconnect attempts are exhausted (default: true)
    pub fall_back_to_polling: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            online_window: DEFAULT_ONLINE_WINDOW,
            reconnect: ReconnectPolicy::default(),
            fall_back_to_polling: true,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: nonzero_secs(&lookup, "FLEETWATCH_POLL_INTERVAL_SECS", defaults.poll_interval),
            online_window: secs(&lookup, "FLEETWATCH_ONLINE_WINDOW_SECS", defaults.online_window),
            reconnect: ReconnectPolicy {
                delay: secs(&lookup, "FLEETWATCH_RECONNECT_DELAY_SECS", defaults.reconnect.delay),
                max_attempts: parsed(&lookup, "FLEETWATCH_RECONNECT_MAX_ATTEMPTS", defaults.reconnect.max_attempts),
                multiplier: parsed(&lookup, "FLEETWATCH_RECONNECT_MULTIPLIER", defaults.reconnect.multiplier),
                max_delay: secs(&lookup, "FLEETWATCH_RECONNECT_MAX_DELAY_SECS", defaults.reconnect.max_delay),
            },
            fall_back_to_polling: flag(&lookup, "FLEETWATCH_FALLBACK_TO_POLLING", defaults.fall_back_to_polling),
        }
    }
}

impl RouteConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.stops.min_stop_duration = secs(&lookup, "FLEETWATCH_MIN_STOP_SECS", config.stops.min_stop_duration);
        config.stops.max_stop_radius_m = parsed(&lookup, "FLEETWATCH_MAX_STOP_RADIUS_M", config.stops.max_stop_radius_m);
        config.stops.min_movement_speed_kmh =
            parsed(&lookup, "FLEETWATCH_MIN_MOVEMENT_KMH", config.stops.min_movement_speed_kmh);
        config.moving_speed_threshold_kmh =
            parsed(&lookup, "FLEETWATCH_MOVING_THRESHOLD_KMH", config.moving_speed_threshold_kmh);
        config.co2_kg_per_km = parsed(&lookup, "FLEETWATCH_CO2_KG_PER_KM", config.co2_kg_per_km);
        config.speed_violation_threshold_kmh =
            parsed(&lookup, "FLEETWATCH_SPEED_VIOLATION_KMH", config.speed_violation_threshold_kmh);
        config
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Like `secs`, but a zero value is ignored.
fn nonzero_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Some(secs(lookup, key, default))
        .filter(|d| !d.is_zero())
        .unwrap_or(default)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
