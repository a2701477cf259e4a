//! Seeded synthetic trips with known ground truth.
//!
//! A trip alternates driving legs and parked dwells. Every dwell is long
//! enough to be reported as a stop and stays within a few metres of where
//! the vehicle parked, so the expected stops are known exactly.

use chrono::{DateTime, Duration, Utc};
use fleetwatch_core::geodesy;
use fleetwatch_core::{GeoPosition, LocationRecord};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::ops::RangeInclusive;

const KM_PER_DEGREE: f64 = 111.195;

#[derive(Debug, Clone)]
pub struct TripConfig {
    /// Seconds between samples (default: 30)
    pub sample_interval_secs: i64,

    /// Driving legs, each followed by a dwell except the last (default: 4)
    pub legs: usize,

    pub drive_samples: RangeInclusive<usize>,

    /// 13 samples at 30 s already span six minutes
    pub dwell_samples: RangeInclusive<usize>,

    pub speed_kmh: RangeInclusive<f64>,

    /// Max GPS scatter while parked, metres
    pub jitter_m: f64,
}

impl Default for TripConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 30,
            legs: 4,
            drive_samples: 6..=20,
            dwell_samples: 13..=40,
            speed_kmh: 20.0..=110.0,
            jitter_m: 4.0,
        }
    }
}

/// A parked interval the generator put into the trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Dwell {
    pub position: GeoPosition,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct GeneratedTrip {
    pub records: Vec<LocationRecord>,
    pub dwells: Vec<Dwell>,
}

/// Corrupted records added by [`TripGenerator::inject_noise`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct NoiseCounts {
    pub sentinel: usize,
    pub non_finite: usize,
    pub out_of_range: usize,
    pub untimed: usize,
}

impl NoiseCounts {
    pub fn total(&self) -> usize {
        self.sentinel + self.non_finite + self.out_of_range + self.untimed
    }
}

pub struct TripGenerator {
    rng: ChaCha8Rng,
    config: TripConfig,
}

impl TripGenerator {
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self::with_config(rng, TripConfig::default())
    }

    pub fn with_config(rng: ChaCha8Rng, config: TripConfig) -> Self {
        Self { rng, config }
    }

    pub fn generate(&mut self, device_id: &str, origin: GeoPosition, start: DateTime<Utc>) -> GeneratedTrip {
        let step = Duration::seconds(self.config.sample_interval_secs);
        let step_hours = self.config.sample_interval_secs as f64 / 3600.0;

        let mut records = Vec::new();
        let mut dwells = Vec::new();
        let mut at = start;
        let mut position = origin;
        let mut heading: f64 = self.rng.gen_range(0.0..360.0);

        for leg in 0..self.config.legs {
            let drive = self.rng.gen_range(self.config.drive_samples.clone());
            for _ in 0..drive {
                let speed = self.rng.gen_range(self.config.speed_kmh.clone());
                records.push(
                    LocationRecord::new(device_id, position.lat, position.lng, at)
                        .with_speed(round1(speed))
                        .with_ignition(true),
                );
                heading = (heading + self.rng.gen_range(-20.0..20.0)).rem_euclid(360.0);
                position = offset(position, speed * step_hours, heading);
                at += step;
            }

            if leg + 1 == self.config.legs {
                break;
            }

            let samples = self.rng.gen_range(self.config.dwell_samples.clone());
            let dwell_start = at;
            for _ in 0..samples {
                let scatter = self.rng.gen_range(0.0..=self.config.jitter_m) / 1000.0;
                let bearing = self.rng.gen_range(0.0..360.0);
                let fix = offset(position, scatter, bearing);
                records.push(LocationRecord::new(device_id, fix.lat, fix.lng, at).with_speed(0.0));
                at += step;
            }
            dwells.push(Dwell {
                position,
                start: dwell_start,
                end: at - step,
                samples,
            });
        }

        GeneratedTrip { records, dwells }
    }

    /// Adds corrupted copies of roughly `rate` of the records, each sharing
    /// its neighbour's timestamp.
    pub fn inject_noise(&mut self, records: &mut Vec<LocationRecord>, rate: f64) -> NoiseCounts {
        let mut counts = NoiseCounts::default();
        let mut noisy = Vec::with_capacity(records.len());

        for record in records.drain(..) {
            let corrupt = self.rng.gen_bool(rate.clamp(0.0, 1.0));
            let mut copy = record.clone();
            noisy.push(record);
            if !corrupt {
                continue;
            }

            match self.rng.gen_range(0..4) {
                0 => {
                    copy.latitude = 0.0;
                    copy.longitude = 0.0;
                    counts.sentinel += 1;
                }
                1 => {
                    copy.latitude = f64::NAN;
                    counts.non_finite += 1;
                }
                2 => {
                    copy.latitude = 123.0;
                    counts.out_of_range += 1;
                }
                _ => {
                    copy.timestamp = None;
                    counts.untimed += 1;
                }
            }
            noisy.push(copy);
        }

        *records = noisy;
        counts
    }

    pub fn shuffle(&mut self, records: &mut [LocationRecord]) {
        records.shuffle(&mut self.rng);
    }
}

/// Moves `from` by `km` along `bearing_deg` on a local flat approximation.
fn offset(from: GeoPosition, km: f64, bearing_deg: f64) -> GeoPosition {
    let theta = bearing_deg.to_radians();
    let d_lat = km * theta.cos() / KM_PER_DEGREE;
    let d_lng = km * theta.sin() / (KM_PER_DEGREE * from.lat.to_radians().cos());
    GeoPosition::new(from.lat + d_lat, from.lng + d_lng)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Largest distance of any dwell record from the dwell's parking spot, metres.
pub fn max_scatter_m(trip: &GeneratedTrip) -> f64 {
    trip.dwells
        .iter()
        .flat_map(|dwell| {
            trip.records
                .iter()
                .filter(move |r| matches!(r.timestamp, Some(ts) if ts >= dwell.start && ts <= dwell.end))
                .map(move |r| geodesy::distance_m(dwell.position.lat, dwell.position.lng, r.latitude, r.longitude))
        })
        .fold(0.0, f64::max)
}
