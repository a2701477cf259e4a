//! Scenario runner - executes simulation scenarios on a paused clock.

use crate::alerts::RecordingAlertSink;
use crate::context::SimContext;
use crate::fleet::SimFleet;
use crate::network::SimLiveTransport;
use crate::scenarios::ScenarioId;
use crate::trips::{GeneratedTrip, TripGenerator};

use chrono::{DateTime, Utc};
use fleetwatch_core::fleet_state::LastLocation;
use fleetwatch_core::{
    fetch_route, process_route, FleetChange, FleetReconciler, FleetServices, GeoPosition, LiveEvent, LocationRecord,
    PositionUpdate, ProcessedRoute, ReconcilerConfig, RouteConfig, TransportMode, VehicleAlert, VehicleState,
};
use fleetwatch_env::{AgencyId, EnvError, FleetContext, LiveFrame, LiveTransport, SubscriptionId, VehicleId};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Virtual time elapsed, seconds
    pub final_time_secs: f64,

    /// Vehicles simulated
    pub vehicles: usize,

    /// First failed check, if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub records: usize,
    pub segments: usize,
    pub stops: usize,
    pub expected_stops: usize,
    pub total_km: f64,
    pub data_quality: f64,
    pub channel_opens: u32,
    pub latest_calls: u64,
    pub latest_failures: u64,
    pub max_in_flight: u64,
    pub vehicle_updates: u64,
    pub alerts_forwarded: usize,
}

/// Failed expectations, in the order they were checked.
#[derive(Debug, Default)]
struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn check(&mut self, ok: bool, message: impl FnOnce() -> String) {
        if !ok {
            let message = message();
            warn!("Check failed: {}", message);
            self.failures.push(message);
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.check(false, || message.into());
    }
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of vehicles per scenario
    num_vehicles: usize,

    reconciler_config: ReconcilerConfig,
    route_config: RouteConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_vehicles: usize) -> Self {
        Self {
            seed,
            num_vehicles: num_vehicles.max(1),
            reconciler_config: ReconcilerConfig::default(),
            route_config: RouteConfig::default(),
        }
    }

    pub fn with_reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler_config = config;
        self
    }

    pub fn with_route_config(mut self, config: RouteConfig) -> Self {
        self.route_config = config;
        self
    }

    /// Runs a scenario on a fresh single-threaded runtime with a paused clock.
    pub fn run_blocking(&self, scenario: ScenarioId) -> ScenarioResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build();

        match runtime {
            Ok(runtime) => runtime.block_on(self.run(scenario)),
            Err(e) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                final_time_secs: 0.0,
                vehicles: self.num_vehicles,
                failure_reason: Some(format!("Failed to build runtime: {}", e)),
                metrics: ScenarioMetrics::default(),
            },
        }
    }

    /// Runs a scenario. Must be called on a runtime whose clock is paused.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let ctx = SimContext::shared(self.seed);
        let mut checks = Checks::default();
        let mut metrics = ScenarioMetrics::default();

        match scenario {
            ScenarioId::StopAndGo => self.run_stop_and_go(&ctx, &mut checks, &mut metrics).await,
            ScenarioId::SentinelNoise => self.run_sentinel_noise(&ctx, &mut checks, &mut metrics),
            ScenarioId::PollFailover => self.run_poll_failover(&ctx, &mut checks, &mut metrics).await,
            ScenarioId::ChannelDrop => self.run_channel_drop(&ctx, &mut checks, &mut metrics).await,
            ScenarioId::OverlappingTicks => self.run_overlapping_ticks(&ctx, &mut checks, &mut metrics).await,
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: checks.failures.is_empty(),
            final_time_secs: ctx.now().as_secs_f64(),
            vehicles: self.num_vehicles,
            failure_reason: checks.failures.first().cloned(),
            metrics,
        }
    }

    // ========================================================================
    // ROUTE SCENARIOS
    // ========================================================================

    /// FW-001: stops found in generated trips must match the parked dwells.
    async fn run_stop_and_go(&self, ctx: &Arc<SimContext>, checks: &mut Checks, metrics: &mut ScenarioMetrics) {
        let mut generator = TripGenerator::new(ctx.rng(1));
        let fleet = SimFleet::new(ctx.clone());
        let start = wall_clock(ctx.as_ref());
        let mut first_track = Vec::new();

        for v in 0..self.num_vehicles {
            let device = format!("dev-{v:03}");
            let trip = generator.generate(&device, origin(v), start);
            if v == 0 {
                first_track = trip.records.clone();
            }

            let mut shuffled = trip.records.clone();
            generator.shuffle(&mut shuffled);
            let route = process_route(shuffled, &self.route_config);

            self.check_route(&device, &trip, &route, checks);
            metrics.records += trip.records.len();
            metrics.segments += route.segments.len();
            metrics.stops += route.stops.len();
            metrics.expected_stops += trip.dwells.len();
            metrics.total_km += route.stats.distance.total_km;

            fleet.set_track(&VehicleId::new(device.clone()), trip.records.clone());
        }

        // the fetch path must produce the same route as direct processing
        let vehicle = VehicleId::new("dev-000");
        let window_end = start + chrono::Duration::days(1);
        match fetch_route(&fleet, &vehicle, start, window_end, &self.route_config).await {
            Ok(route) => {
                let direct = process_route(first_track, &self.route_config);
                checks.check(route == direct, || "fetched route differs from direct processing".to_string());
            }
            Err(e) => checks.fail(format!("fetch_route failed: {e}")),
        }

        fleet.fail_history(Some(EnvError::network("history service unavailable")));
        let failed = fetch_route(&fleet, &vehicle, start, window_end, &self.route_config).await;
        checks.check(failed.is_err(), || "failed history fetch returned a route".to_string());

        metrics.data_quality = 1.0;
    }

    /// FW-002: corrupted records are filtered without disturbing stops.
    fn run_sentinel_noise(&self, ctx: &Arc<SimContext>, checks: &mut Checks, metrics: &mut ScenarioMetrics) {
        let mut generator = TripGenerator::new(ctx.rng(2));
        let start = wall_clock(ctx.as_ref());
        let mut worst_quality: f64 = 1.0;

        for v in 0..self.num_vehicles {
            let device = format!("dev-{v:03}");
            let trip = generator.generate(&device, origin(v), start);
            let clean = trip.records.len();

            let mut noisy = trip.records.clone();
            let noise = generator.inject_noise(&mut noisy, 0.2);
            generator.shuffle(&mut noisy);
            let route = process_route(noisy, &self.route_config);

            checks.check(
                route.segments.iter().all(|s| s.start_point.is_valid() && s.end_point.is_valid()),
                || format!("{device}: segment touches an invalid coordinate"),
            );
            checks.check(route.stops.len() == trip.dwells.len(), || {
                format!("{device}: {} stops for {} dwells", route.stops.len(), trip.dwells.len())
            });

            let quality = &route.stats.data_quality;
            checks.check(quality.record_count == clean + noise.total(), || {
                format!("{device}: record count {} != {}", quality.record_count, clean + noise.total())
            });
            checks.check(quality.valid_record_count == clean, || {
                format!("{device}: {} valid records, expected {}", quality.valid_record_count, clean)
            });
            checks.check(noise.total() == 0 || quality.ratio < 1.0, || {
                format!("{device}: data quality {} despite {} bad records", quality.ratio, noise.total())
            });

            debug!("{}: {:?}, quality {:.4}", device, noise, quality.ratio);
            worst_quality = worst_quality.min(quality.ratio);
            metrics.records += clean + noise.total();
            metrics.segments += route.segments.len();
            metrics.stops += route.stops.len();
            metrics.expected_stops += trip.dwells.len();
            metrics.total_km += route.stats.distance.total_km;
        }

        metrics.data_quality = worst_quality;
    }

    fn check_route(&self, device: &str, trip: &GeneratedTrip, route: &ProcessedRoute, checks: &mut Checks) {
        let min_stop_ms = self.route_config.stops.min_stop_ms();

        checks.check(route.segments.len() < trip.records.len(), || {
            format!("{device}: {} segments from {} records", route.segments.len(), trip.records.len())
        });
        checks.check(
            route.segments.windows(2).all(|w| w[0].start_time <= w[1].start_time),
            || format!("{device}: segments out of order"),
        );

        let segment_km: f64 = route.segments.iter().map(|s| s.distance_km).sum();
        checks.check((segment_km - route.stats.distance.total_km).abs() <= 0.006, || {
            format!("{device}: segment sum {segment_km:.4} vs total {}", route.stats.distance.total_km)
        });

        checks.check(route.stops.len() == trip.dwells.len(), || {
            format!("{device}: {} stops for {} dwells", route.stops.len(), trip.dwells.len())
        });
        for (stop, dwell) in route.stops.iter().zip(&trip.dwells) {
            checks.check(stop.duration_ms >= min_stop_ms, || {
                format!("{device}: stop of {} ms below the floor", stop.duration_ms)
            });
            checks.check(stop.start_time == dwell.start && stop.end_time == dwell.end, || {
                format!("{device}: stop {}..{} vs dwell {}..{}", stop.start_time, stop.end_time, dwell.start, dwell.end)
            });
            checks.check(stop.record_count == dwell.samples, || {
                format!("{device}: stop has {} records, dwell {}", stop.record_count, dwell.samples)
            });
        }
    }

    // ========================================================================
    // LIVE SCENARIOS
    // ========================================================================

    /// FW-003: connect fails, the single reconnect fails, polling takes over.
    async fn run_poll_failover(&self, ctx: &Arc<SimContext>, checks: &mut Checks, metrics: &mut ScenarioMetrics) {
        let fleet = Arc::new(SimFleet::new(ctx.clone()));
        let ids = self.seed_fleet(ctx, &fleet);
        let flaky = ids[0].clone();
        fleet.fail_latest(&flaky, true);

        let transport = Arc::new(SimLiveTransport::new(64));
        transport.refuse_all(true);

        let Some(reconciler) = self.start(ctx, &fleet, Some(transport.clone()), Arc::new(RecordingAlertSink::new()), checks).await else {
            return;
        };
        let updates = count_vehicle_updates(&reconciler);

        ctx.sleep(Duration::from_secs(1)).await;
        checks.check(reconciler.transport_mode() == TransportMode::Reconnecting, || {
            format!("expected reconnecting, got {:?}", reconciler.transport_mode())
        });

        ctx.sleep(Duration::from_secs(5)).await;
        checks.check(transport.open_count() == 2, || {
            format!("expected exactly one reconnect, saw {} opens", transport.open_count())
        });
        checks.check(reconciler.transport_mode() == TransportMode::Poll, || {
            format!("expected poll fallback, got {:?}", reconciler.transport_mode())
        });

        // first tick at t=35s
        ctx.sleep(Duration::from_secs(30)).await;
        let n = ids.len() as u64;
        let stats = fleet.stats();
        checks.check(stats.latest_calls == n, || format!("tick fetched {} of {} vehicles", stats.latest_calls, n));
        checks.check(updates.load(Ordering::SeqCst) == n - 1, || {
            format!("{} vehicles updated, expected {}", updates.load(Ordering::SeqCst), n - 1)
        });

        // the flaky vehicle ages out; everyone else keeps reporting
        ctx.sleep(Duration::from_secs(300)).await;
        let state = reconciler.get_fleet_state();
        checks.check(state.summary.offline == 1, || format!("{} offline, expected 1", state.summary.offline));
        checks.check(
            reconciler.vehicle(&flaky).map_or(false, |v| !v.is_online && !v.is_moving),
            || format!("{flaky} should be offline"),
        );
        checks.check(transport.open_count() == 2, || "reconnect retried after fallback".to_string());

        let stats = fleet.stats();
        metrics.channel_opens = transport.open_count();
        metrics.latest_calls = stats.latest_calls;
        metrics.latest_failures = stats.latest_failures;
        metrics.max_in_flight = stats.max_in_flight;
        metrics.vehicle_updates = updates.load(Ordering::SeqCst);

        reconciler.shutdown().await;
    }

    /// FW-004: push updates apply in order; a dropped channel is reopened once.
    async fn run_channel_drop(&self, ctx: &Arc<SimContext>, checks: &mut Checks, metrics: &mut ScenarioMetrics) {
        let fleet = Arc::new(SimFleet::new(ctx.clone()));
        let ids = self.seed_fleet(ctx, &fleet);
        let transport = Arc::new(SimLiveTransport::new(256));
        let alerts = Arc::new(RecordingAlertSink::new());

        let Some(reconciler) = self.start(ctx, &fleet, Some(transport.clone()), alerts.clone(), checks).await else {
            return;
        };
        let updates = count_vehicle_updates(&reconciler);

        ctx.sleep(Duration::from_secs(1)).await;
        checks.check(reconciler.transport_mode() == TransportMode::Push, || {
            format!("expected push, got {:?}", reconciler.transport_mode())
        });

        let now = wall_clock(ctx.as_ref());
        for id in &ids {
            self.send(&transport, id, moving_update(48.80, 2.30, now), checks).await;
        }
        // two updates for one vehicle: the later one wins
        self.send(&transport, &ids[0], moving_update(48.90, 2.40, now), checks).await;
        self.send(&transport, &VehicleId::new("ghost"), moving_update(1.0, 1.0, now), checks).await;
        let alert = LiveEvent::Alert {
            vehicle_id: ids[0].clone(),
            payload: VehicleAlert {
                alert_type: Some("speeding".to_string()),
                ..VehicleAlert::default()
            },
        };
        if let Err(e) = transport.push(&alert).await {
            checks.fail(format!("alert push failed: {e}"));
        }
        if let Err(e) = transport.push_frame(LiveFrame::new(b"{\"type\":\"heartbeat\"}".to_vec())).await {
            checks.fail(format!("raw push failed: {e}"));
        }
        ctx.sleep(Duration::from_secs(1)).await;

        let state = reconciler.get_fleet_state();
        checks.check(state.summary.total == ids.len(), || "unknown vehicle joined the fleet".to_string());
        checks.check(state.summary.moving == ids.len(), || {
            format!("{} of {} moving after push updates", state.summary.moving, ids.len())
        });
        let lead = reconciler.vehicle(&ids[0]).and_then(|v| v.state.last_location);
        checks.check(lead.map_or(false, |l| l.latitude == 48.90), || {
            format!("last write did not win for {}: {:?}", ids[0], lead)
        });
        checks.check(alerts.count() == 1, || format!("{} alerts forwarded, expected 1", alerts.count()));

        // server closes the channel; one reconnect after 5 s restores push
        transport.drop_channel();
        ctx.sleep(Duration::from_secs(1)).await;
        checks.check(reconciler.transport_mode() == TransportMode::Reconnecting, || {
            format!("expected reconnecting, got {:?}", reconciler.transport_mode())
        });
        ctx.sleep(Duration::from_secs(5)).await;
        checks.check(reconciler.transport_mode() == TransportMode::Push, || {
            format!("expected push after reconnect, got {:?}", reconciler.transport_mode())
        });
        checks.check(transport.open_count() == 2, || format!("{} opens, expected 2", transport.open_count()));

        let parked = PositionUpdate {
            speed_kmh: Some(0.0),
            ignition_on: Some(false),
            timestamp: Some(wall_clock(ctx.as_ref())),
            ..PositionUpdate::default()
        };
        self.send(&transport, &ids[0], parked, checks).await;
        ctx.sleep(Duration::from_secs(1)).await;
        let moving = reconciler.moving_vehicles().len();
        checks.check(moving == ids.len() - 1, || format!("{moving} moving after parking one"));

        // channel errors and the hub stays down: fall back to polling
        transport.refuse_all(true);
        if let Err(e) = transport.fail_channel(EnvError::channel_closed("hub restarting")).await {
            checks.fail(format!("fail_channel failed: {e}"));
        }
        ctx.sleep(Duration::from_secs(6)).await;
        checks.check(reconciler.transport_mode() == TransportMode::Poll, || {
            format!("expected poll fallback, got {:?}", reconciler.transport_mode())
        });
        checks.check(transport.open_count() == 3, || format!("{} opens, expected 3", transport.open_count()));

        metrics.channel_opens = transport.open_count();
        metrics.alerts_forwarded = alerts.count();
        metrics.vehicle_updates = updates.load(Ordering::SeqCst);

        reconciler.shutdown().await;
        ctx.sleep(Duration::from_millis(1)).await;
        checks.check(!transport.is_connected(), || "channel still open after shutdown".to_string());
    }

    /// FW-005: ticks overlap under latency; teardown discards late results.
    async fn run_overlapping_ticks(&self, ctx: &Arc<SimContext>, checks: &mut Checks, metrics: &mut ScenarioMetrics) {
        let fleet = Arc::new(SimFleet::new(ctx.clone()));
        let ids = self.seed_fleet(ctx, &fleet);
        fleet.set_latency(Duration::from_secs(45));
        let n = ids.len() as u64;

        let Some(reconciler) = self.start(ctx, &fleet, None, Arc::new(RecordingAlertSink::new()), checks).await else {
            return;
        };
        let updates = count_vehicle_updates(&reconciler);

        // ticks at 30 s and 60 s; the first completes at 75 s
        ctx.sleep(Duration::from_secs(80)).await;
        let stats = fleet.stats();
        checks.check(stats.max_in_flight >= 2 * n, || {
            format!("max {} fetches in flight, expected overlap of {}", stats.max_in_flight, 2 * n)
        });
        checks.check(updates.load(Ordering::SeqCst) == n, || {
            format!("{} updates by 80 s, expected {}", updates.load(Ordering::SeqCst), n)
        });

        let at_shutdown = updates.load(Ordering::SeqCst);
        reconciler.shutdown().await;

        // the 60 s tick lands at 105 s, after teardown
        ctx.sleep(Duration::from_secs(60)).await;
        checks.check(updates.load(Ordering::SeqCst) == at_shutdown, || {
            "results applied after teardown".to_string()
        });
        let stats = fleet.stats();
        checks.check(stats.latest_calls == 2 * n, || {
            format!("{} fetches, expected {} (no ticks after teardown)", stats.latest_calls, 2 * n)
        });

        metrics.latest_calls = stats.latest_calls;
        metrics.max_in_flight = stats.max_in_flight;
        metrics.vehicle_updates = updates.load(Ordering::SeqCst);
    }

    async fn start(
        &self,
        ctx: &Arc<SimContext>,
        fleet: &Arc<SimFleet>,
        live: Option<Arc<SimLiveTransport>>,
        alerts: Arc<RecordingAlertSink>,
        checks: &mut Checks,
    ) -> Option<FleetReconciler<SimContext>> {
        let services = FleetServices {
            source: fleet.clone(),
            live: live.map(|t| t as Arc<dyn LiveTransport>),
            alerts,
        };
        match FleetReconciler::start_with_id(
            ctx.clone(),
            SubscriptionId::from_seed(self.seed),
            AgencyId::new("sim-agency"),
            services,
            self.reconciler_config.clone(),
        )
        .await
        {
            Ok(reconciler) => Some(reconciler),
            Err(e) => {
                checks.fail(format!("start failed: {e}"));
                None
            }
        }
    }

    /// Registers vehicles that reported just now and keep reporting.
    fn seed_fleet(&self, ctx: &Arc<SimContext>, fleet: &SimFleet) -> Vec<VehicleId> {
        let mut rng = ctx.rng(3);
        let now = wall_clock(ctx.as_ref());

        (0..self.num_vehicles)
            .map(|i| {
                let id = VehicleId::new(format!("veh-{i:03}"));
                let home = origin(i);
                let speed = rng.gen_range(10.0..80.0);
                fleet.add_vehicle(VehicleState {
                    last_location: Some(LastLocation {
                        latitude: home.lat,
                        longitude: home.lng,
                        accuracy: None,
                    }),
                    speed_kmh: Some(0.0),
                    ignition_on: false,
                    last_update: Some(now),
                    ..VehicleState::new(id.clone())
                });
                fleet.set_latest(
                    &id,
                    LocationRecord::new(id.as_str(), home.lat + 0.001, home.lng, now)
                        .with_speed(speed)
                        .with_ignition(true),
                );
                id
            })
            .collect()
    }

    async fn send(&self, transport: &SimLiveTransport, vehicle: &VehicleId, update: PositionUpdate, checks: &mut Checks) {
        let event = LiveEvent::PositionUpdate {
            vehicle_id: vehicle.clone(),
            payload: update,
        };
        if let Err(e) = transport.push(&event).await {
            checks.fail(format!("push to {vehicle} failed: {e}"));
        }
    }
}

fn wall_clock(ctx: &SimContext) -> DateTime<Utc> {
    DateTime::<Utc>::from(ctx.system_time())
}

/// Spreads vehicles around central Paris.
fn origin(index: usize) -> GeoPosition {
    GeoPosition::new(48.80 + 0.01 * (index % 10) as f64, 2.25 + 0.01 * (index / 10) as f64)
}

fn moving_update(latitude: f64, longitude: f64, at: DateTime<Utc>) -> PositionUpdate {
    PositionUpdate {
        latitude: Some(latitude),
        longitude: Some(longitude),
        timestamp: Some(at),
        speed_kmh: Some(42.0),
        ignition_on: Some(true),
        ..PositionUpdate::default()
    }
}

fn count_vehicle_updates(reconciler: &FleetReconciler<SimContext>) -> Arc<AtomicU64> {
    let counter = Arc::new(AtomicU64::new(0));
    let seen = counter.clone();
    reconciler.subscribe(move |change| {
        if matches!(change, FleetChange::VehicleUpdated(_)) {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });
    counter
}
