use approx::assert_relative_eq;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use fleetwatch_core::fleet_state::LastLocation;
use fleetwatch_core::stops::detect_stops;
use fleetwatch_core::{
    fetch_device_route, process_route, FleetChange, FleetError, FleetReconciler, FleetServices, LocationRecord,
    ReconcilerConfig, RouteConfig, SpeedCategory, StopDetectionConfig, StopType, TransportMode, VehicleState,
};
use fleetwatch_env::{AgencyId, EnvError, FleetContext, LiveTransport, VehicleId};
use fleetwatch_sim::scenarios::ScenarioId;
use fleetwatch_sim::{RecordingAlertSink, ScenarioRunner, SimContext, SimFleet, SimLiveTransport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

fn parked(lat: f64, lng: f64, secs: i64) -> LocationRecord {
    LocationRecord::new("dev-1", lat, lng, t0() + ChronoDuration::seconds(secs)).with_speed(0.0)
}

fn driving(lat: f64, lng: f64, secs: i64, speed: f64) -> LocationRecord {
    LocationRecord::new("dev-1", lat, lng, t0() + ChronoDuration::seconds(secs))
        .with_speed(speed)
        .with_ignition(true)
}

fn wall_clock(ctx: &SimContext) -> DateTime<Utc> {
    DateTime::<Utc>::from(ctx.system_time())
}

fn vehicle_at(id: &str, seen: DateTime<Utc>, speed: f64) -> VehicleState {
    VehicleState {
        last_location: Some(LastLocation {
            latitude: 48.85,
            longitude: 2.35,
            accuracy: None,
        }),
        speed_kmh: Some(speed),
        ignition_on: speed > 0.0,
        last_update: Some(seen),
        ..VehicleState::new(id)
    }
}

fn services(fleet: &Arc<SimFleet>, live: Option<Arc<SimLiveTransport>>) -> FleetServices {
    FleetServices {
        source: fleet.clone(),
        live: live.map(|t| t as Arc<dyn LiveTransport>),
        alerts: Arc::new(RecordingAlertSink::new()),
    }
}

// ============================================================================
// ROUTE SCENARIOS
// ============================================================================

#[test]
fn test_two_parked_records_are_not_a_stop() {
    let records = vec![parked(48.85, 2.35, 0), parked(48.85, 2.35, 60)];
    assert!(detect_stops(&records, &StopDetectionConfig::default()).is_empty());
    assert!(process_route(records, &RouteConfig::default()).stops.is_empty());
}

#[test]
fn test_six_minute_dwell_is_one_short_stop() {
    // within ~7 m of each other
    let records: Vec<_> = (0..10)
        .map(|i| parked(48.85 + (i % 2) as f64 * 0.00006, 2.35, i * 40))
        .collect();

    let route = process_route(records, &RouteConfig::default());
    assert_eq!(route.stops.len(), 1);
    assert_eq!(route.stops[0].duration_ms, 6 * 60 * 1000);
    assert_eq!(route.stops[0].stop_type, StopType::Short);
    assert_eq!(route.stats.stop_count, 1);
}

#[test]
fn test_sentinel_record_only_costs_its_segments() {
    let records = vec![
        driving(48.850, 2.350, 0, 40.0),
        driving(48.851, 2.351, 30, 40.0),
        driving(0.0, 0.0, 60, 40.0),
        driving(48.853, 2.353, 90, 40.0),
        driving(48.854, 2.354, 120, 40.0),
    ];

    let route = process_route(records, &RouteConfig::default());
    assert_eq!(route.segments.len(), 2);
    assert!(route.segments.iter().all(|s| s.start_point.is_valid() && s.end_point.is_valid()));
    assert_eq!(route.stats.data_quality.valid_record_count, 4);
    assert_relative_eq!(route.stats.data_quality.ratio, 0.8);

    // bounds ignore the sentinel
    let bounds = route.bounds.unwrap();
    assert!(bounds.south > 48.0);
}

#[test]
fn test_paris_pair_is_one_medium_segment() {
    let records = vec![
        driving(48.8566, 2.3522, 0, 50.0),
        driving(48.8606, 2.3376, 300, 40.0),
    ];

    let route = process_route(records, &RouteConfig::default());
    assert_eq!(route.segments.len(), 1);
    assert_relative_eq!(route.segments[0].distance_km, 1.16, epsilon = 0.1);
    assert_eq!(route.segments[0].category, SpeedCategory::Medium);
    assert_relative_eq!(route.stats.distance.total_km, 1.16, epsilon = 0.1);
}

#[tokio::test(start_paused = true)]
async fn test_device_route_goes_through_the_source() {
    let ctx = SimContext::shared(7);
    let fleet = SimFleet::new(ctx);
    fleet.set_track(
        &VehicleId::new("veh-1"),
        vec![driving(48.8606, 2.3376, 300, 40.0), driving(48.8566, 2.3522, 0, 50.0)],
    );

    let route = fetch_device_route(&fleet, "dev-1", &RouteConfig::default()).await.unwrap();
    assert_eq!(route.segments.len(), 1);

    let empty = fetch_device_route(&fleet, "dev-unknown", &RouteConfig::default()).await.unwrap();
    assert!(empty.is_empty());

    fleet.fail_history(Some(EnvError::network("history down")));
    let err = fetch_device_route(&fleet, "dev-1", &RouteConfig::default()).await.unwrap_err();
    assert!(matches!(err, FleetError::Route { .. }));
}

// ============================================================================
// RECONCILER
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stale_vehicle_is_offline_and_not_moving() {
    let ctx = SimContext::shared(1);
    let fleet = Arc::new(SimFleet::new(ctx.clone()));
    let id = VehicleId::new("veh-1");
    fleet.add_vehicle(vehicle_at("veh-1", wall_clock(&ctx), 60.0));

    let reconciler = FleetReconciler::start(ctx.clone(), AgencyId::new("a"), services(&fleet, None), ReconcilerConfig::default())
        .await
        .unwrap();

    let status = reconciler.vehicle(&id).unwrap();
    assert!(status.is_online && status.is_moving);

    // age the telemetry without letting any poll tick run
    ctx.advance_time(Duration::from_secs(600));
    let status = reconciler.vehicle(&id).unwrap();
    assert!(!status.is_online);
    assert!(!status.is_moving);
    assert_eq!(status.state.speed_kmh, Some(60.0));

    let summary = reconciler.get_fleet_state().summary;
    assert_eq!(summary.offline, 1);
    assert_eq!(summary.moving, 0);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_failure_is_reported() {
    let ctx = SimContext::shared(1);
    let fleet = Arc::new(SimFleet::new(ctx.clone()));
    fleet.fail_snapshot(Some(EnvError::network("503")));

    let result =
        FleetReconciler::start(ctx, AgencyId::new("agency-9"), services(&fleet, None), ReconcilerConfig::default())
            .await;
    match result {
        Err(FleetError::Bootstrap { agency, .. }) => assert_eq!(agency, AgencyId::new("agency-9")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("bootstrap should fail"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_poll_ticks_skip_offline_vehicles() {
    let ctx = SimContext::shared(2);
    let fleet = Arc::new(SimFleet::new(ctx.clone()));
    let now = wall_clock(&ctx);
    fleet.add_vehicle(vehicle_at("fresh", now, 0.0));
    fleet.add_vehicle(vehicle_at("stale", now - ChronoDuration::minutes(30), 0.0));
    for id in ["fresh", "stale"] {
        fleet.set_latest(&VehicleId::new(id), driving(48.86, 2.36, 0, 35.0));
    }

    let reconciler = FleetReconciler::start(ctx.clone(), AgencyId::new("a"), services(&fleet, None), ReconcilerConfig::default())
        .await
        .unwrap();
    assert_eq!(reconciler.transport_mode(), TransportMode::Idle);

    ctx.sleep(Duration::from_secs(31)).await;
    assert_eq!(reconciler.transport_mode(), TransportMode::Poll);
    assert_eq!(fleet.stats().latest_calls, 1);

    let fresh = reconciler.vehicle(&VehicleId::new("fresh")).unwrap();
    assert!(fresh.is_moving);
    assert_eq!(fresh.state.last_location.unwrap().latitude, 48.86);
    assert!(!reconciler.vehicle(&VehicleId::new("stale")).unwrap().is_online);
    assert!(reconciler.last_refresh().unwrap() > now);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_leaves_only_that_vehicle_stale() {
    let ctx = SimContext::shared(6);
    let fleet = Arc::new(SimFleet::new(ctx.clone()));
    let now = wall_clock(&ctx);
    for id in ["veh-1", "veh-2", "veh-3"] {
        fleet.add_vehicle(vehicle_at(id, now, 0.0));
        fleet.set_latest(&VehicleId::new(id), driving(48.87, 2.37, 0, 50.0));
    }
    fleet.fail_latest(&VehicleId::new("veh-2"), true);

    let reconciler = FleetReconciler::start(ctx.clone(), AgencyId::new("a"), services(&fleet, None), ReconcilerConfig::default())
        .await
        .unwrap();
    ctx.advance_time(Duration::from_secs(10));

    assert_eq!(reconciler.poll_now().await, 2);
    let stale = reconciler.vehicle(&VehicleId::new("veh-2")).unwrap();
    assert_eq!(stale.state.last_update, Some(now));
    assert!(!stale.is_moving);
    assert_eq!(reconciler.moving_vehicles().len(), 2);
    assert_eq!(fleet.stats().latest_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_snapshot_keeps_membership() {
    let ctx = SimContext::shared(3);
    let fleet = Arc::new(SimFleet::new(ctx.clone()));
    let now = wall_clock(&ctx);
    fleet.add_vehicle(vehicle_at("veh-1", now, 0.0));

    let reconciler = FleetReconciler::start(ctx.clone(), AgencyId::new("a"), services(&fleet, None), ReconcilerConfig::default())
        .await
        .unwrap();
    let refreshes = Arc::new(AtomicUsize::new(0));
    let seen = refreshes.clone();
    let listener = reconciler.subscribe(move |change| {
        if matches!(change, FleetChange::Refreshed { .. }) {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    fleet.add_vehicle(vehicle_at("veh-1", now, 25.0));
    fleet.add_vehicle(vehicle_at("veh-2", now, 25.0));
    assert_eq!(reconciler.refresh_snapshot().await.unwrap(), 1);
    assert_eq!(reconciler.get_fleet_state().summary.total, 1);
    assert_eq!(reconciler.vehicle(&VehicleId::new("veh-1")).unwrap().state.speed_kmh, Some(25.0));
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    assert!(reconciler.unsubscribe(listener));
    assert!(!reconciler.unsubscribe(listener));
    reconciler.refresh_snapshot().await.unwrap();
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnect_without_fallback_stops() {
    let ctx = SimContext::shared(4);
    let fleet = Arc::new(SimFleet::new(ctx.clone()));
    fleet.add_vehicle(vehicle_at("veh-1", wall_clock(&ctx), 0.0));
    let transport = Arc::new(SimLiveTransport::new(8));
    transport.refuse_all(true);

    let config = ReconcilerConfig {
        fall_back_to_polling: false,
        ..ReconcilerConfig::default()
    };
    let reconciler = FleetReconciler::start(ctx.clone(), AgencyId::new("a"), services(&fleet, Some(transport.clone())), config)
        .await
        .unwrap();

    ctx.sleep(Duration::from_secs(60)).await;
    assert_eq!(reconciler.transport_mode(), TransportMode::Stopped);
    assert_eq!(transport.open_count(), 2);
    assert_eq!(fleet.stats().latest_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_the_reconciler_closes_the_channel() {
    let ctx = SimContext::shared(5);
    let fleet = Arc::new(SimFleet::new(ctx.clone()));
    fleet.add_vehicle(vehicle_at("veh-1", wall_clock(&ctx), 0.0));
    let transport = Arc::new(SimLiveTransport::new(8));

    let reconciler = FleetReconciler::start(ctx.clone(), AgencyId::new("a"), services(&fleet, Some(transport.clone())), ReconcilerConfig::default())
        .await
        .unwrap();
    ctx.sleep(Duration::from_secs(1)).await;
    assert!(transport.is_connected());

    drop(reconciler);
    ctx.sleep(Duration::from_millis(1)).await;
    assert!(!transport.is_connected());
}

// ============================================================================
// RUNNER
// ============================================================================

#[test]
fn test_every_scenario_passes_across_seeds() {
    for seed in [1, 42, 9001] {
        let runner = ScenarioRunner::new(seed, 4);
        for scenario in ScenarioId::all() {
            let result = runner.run_blocking(scenario);
            assert!(
                result.passed,
                "{} seed={} failed: {:?}",
                scenario,
                seed,
                result.failure_reason
            );
        }
    }
}

#[test]
fn test_runs_are_deterministic() {
    let a = ScenarioRunner::new(77, 3).run_blocking(ScenarioId::SentinelNoise);
    let b = ScenarioRunner::new(77, 3).run_blocking(ScenarioId::SentinelNoise);
    assert_eq!(a.metrics.records, b.metrics.records);
    assert_eq!(a.metrics.total_km, b.metrics.total_km);
    assert_eq!(a.metrics.data_quality, b.metrics.data_quality);
}

#[test]
fn test_runner_applies_custom_configs() {
    let no_fallback = ReconcilerConfig {
        fall_back_to_polling: false,
        ..ReconcilerConfig::default()
    };
    let result = ScenarioRunner::new(5, 3)
        .with_reconciler_config(no_fallback)
        .run_blocking(ScenarioId::PollFailover);
    assert!(!result.passed);
    let reason = result.failure_reason.unwrap_or_default();
    assert!(reason.contains("Stopped"), "unexpected failure: {reason}");

    let mut hour_floor = RouteConfig::default();
    hour_floor.stops.min_stop_duration = Duration::from_secs(60 * 60);
    let result = ScenarioRunner::new(5, 3)
        .with_route_config(hour_floor)
        .run_blocking(ScenarioId::StopAndGo);
    assert!(!result.passed);
    assert_eq!(result.metrics.stops, 0);
    assert!(result.metrics.expected_stops > 0);
}

#[test]
fn test_scenario_catalogue() {
    let live: Vec<ScenarioId> = ScenarioId::all().into_iter().filter(ScenarioId::is_live).collect();
    assert_eq!(
        live,
        vec![ScenarioId::PollFailover, ScenarioId::ChannelDrop, ScenarioId::OverlappingTicks]
    );
    for scenario in ScenarioId::all() {
        assert!(!scenario.description().is_empty());
    }
}
