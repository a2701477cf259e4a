//! Fleet State Reconciler - live per-vehicle status for one subscription.
//!
//! # Lifecycle
//!
//! ```text
//!  start()
//!    │ fetch_fleet_snapshot (awaited, fails the start)
//!    ▼
//!  ┌──────────┐  channel closed/error   ┌──────────────┐
//!  │   PUSH   │ ──────────────────────▶ │ RECONNECTING │
//!  └──────────┘ ◀────────────────────── └──────────────┘
//!                     reopened                 │ attempts exhausted
//!                                              ▼
//!  no live transport ───────────────────▶ ┌──────────┐
//!                                         │   POLL   │ (or STOPPED without fallback)
//!                                         └──────────┘
//! ```
//!
//! Exactly one transport task runs per reconciler. It is owned through a
//! [`TaskHandle`] and aborted by [`FleetReconciler::shutdown`] or on drop,
//! which also drops (and thereby closes) any open push channel.
//!
//! Poll ticks are spawned detached so a slow tick never delays or cancels
//! the next one. A tick only holds a `Weak` reference to the state and
//! discards its results if the reconciler is gone or closed by the time the
//! fetches return.

use chrono::{DateTime, Utc};
use fleetwatch_env::{
    AgencyId, FleetContext, LiveChannel, LiveFrame, LiveTransport, SubscriptionId, TaskHandle, VehicleId,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReconcilerConfig;
use crate::error::FleetError;
use crate::fleet_state::{FleetMap, FleetSnapshot, PositionUpdate, VehicleStatus};
use crate::live_event::LiveEvent;
use crate::source::{AlertSink, TelemetrySource};

/// Floor for the poll tick period.
const MIN_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Which transport currently feeds the state map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Idle,
    Push,
    Reconnecting,
    Poll,
    Stopped,
}

/// Notification delivered to subscribers after the state lock is released.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetChange {
    VehicleUpdated(VehicleId),
    /// A poll tick or snapshot refresh finished
    Refreshed { updated: usize },
    TransportChanged(TransportMode),
    AlertForwarded(VehicleId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

type Listener = Arc<dyn Fn(&FleetChange) + Send + Sync>;

/// External collaborators of a reconciler.
#[derive(Clone)]
pub struct FleetServices {
    pub source: Arc<dyn TelemetrySource>,
    /// `None` runs the reconciler in poll mode from the start
    pub live: Option<Arc<dyn LiveTransport>>,
    pub alerts: Arc<dyn AlertSink>,
}

/// State shared between the reconciler handle and its tasks.
struct Shared {
    subscription: SubscriptionId,
    agency: AgencyId,
    config: ReconcilerConfig,
    fleet: Mutex<FleetMap>,
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    mode: Mutex<TransportMode>,
    closed: AtomicBool,
}

impl Shared {
    fn fleet(&self) -> MutexGuard<'_, FleetMap> {
        self.fleet.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mode(&self) -> TransportMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: &FleetChange) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(change);
        }
    }

    fn set_mode(&self, mode: TransportMode) {
        let previous = {
            let mut current = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, mode)
        };
        if previous != mode {
            info!("[{}] Transport {:?} -> {:?}", self.subscription, previous, mode);
            self.notify(&FleetChange::TransportChanged(mode));
        }
    }

    /// Merges one update; notifies only if the vehicle is known and changed.
    fn apply(&self, vehicle: &VehicleId, update: &PositionUpdate) -> bool {
        let changed = self.fleet().apply(vehicle, update);
        if changed {
            self.notify(&FleetChange::VehicleUpdated(vehicle.clone()));
        }
        changed
    }

    fn handle_frame(&self, frame: &LiveFrame, alerts: &dyn AlertSink) {
        match LiveEvent::decode(frame) {
            Ok(LiveEvent::PositionUpdate { vehicle_id, payload }) => {
                if !self.apply(&vehicle_id, &payload) {
                    debug!("[{}] Position update for {} changed nothing", self.subscription, vehicle_id);
                }
            }
            Ok(LiveEvent::Alert { vehicle_id, payload }) => {
                alerts.forward(&vehicle_id, &payload);
                self.notify(&FleetChange::AlertForwarded(vehicle_id));
            }
            Err(e) => {
                warn!("[{}] Dropping undecodable frame ({} bytes): {}", self.subscription, frame.size(), e);
            }
        }
    }
}

/// Live fleet state for one agency subscription.
pub struct FleetReconciler<Ctx: FleetContext> {
    ctx: Arc<Ctx>,
    shared: Arc<Shared>,
    services: FleetServices,
    transport: Option<TaskHandle>,
}

impl<Ctx: FleetContext> FleetReconciler<Ctx> {
    /// Bootstraps from a full snapshot, then starts push (or poll) mode.
    pub async fn start(
        ctx: Arc<Ctx>,
        agency: AgencyId,
        services: FleetServices,
        config: ReconcilerConfig,
    ) -> Result<Self, FleetError> {
        Self::start_with_id(ctx, SubscriptionId::new(), agency, services, config).await
    }

    /// Like [`FleetReconciler::start`] with a caller-chosen subscription id.
    pub async fn start_with_id(
        ctx: Arc<Ctx>,
        subscription: SubscriptionId,
        agency: AgencyId,
        services: FleetServices,
        config: ReconcilerConfig,
    ) -> Result<Self, FleetError> {
        let snapshot = services
            .source
            .fetch_fleet_snapshot(&agency)
            .await
            .map_err(|source| FleetError::Bootstrap {
                agency: agency.clone(),
                source,
            })?;

        info!("[{}] Bootstrapped {} vehicles for agency {}", subscription, snapshot.len(), agency);

        let mut fleet = FleetMap::from_snapshot(snapshot);
        fleet.mark_refreshed(utc_now(ctx.as_ref()));

        let shared = Arc::new(Shared {
            subscription,
            agency,
            config,
            fleet: Mutex::new(fleet),
            listeners: Mutex::new(HashMap::new()),
            mode: Mutex::new(TransportMode::Idle),
            closed: AtomicBool::new(false),
        });

        let transport = match services.live.clone() {
            Some(live) => ctx.spawn(
                "fleet-push",
                run_push(ctx.clone(), shared.clone(), live, services.source.clone(), services.alerts.clone()),
            ),
            None => ctx.spawn("fleet-poll", run_poll(ctx.clone(), shared.clone(), services.source.clone())),
        };

        Ok(Self {
            ctx,
            shared,
            services,
            transport: Some(transport),
        })
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.shared.subscription
    }

    pub fn agency(&self) -> &AgencyId {
        &self.shared.agency
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.shared.mode()
    }

    /// All vehicles with flags derived at the context's current time.
    pub fn get_fleet_state(&self) -> FleetSnapshot {
        let now = utc_now(self.ctx.as_ref());
        self.shared.fleet().snapshot(now, self.shared.config.online_window)
    }

    pub fn vehicle(&self, id: &VehicleId) -> Option<VehicleStatus> {
        let now = utc_now(self.ctx.as_ref());
        self.shared.fleet().status(id, now, self.shared.config.online_window)
    }

    pub fn online_vehicles(&self) -> Vec<VehicleStatus> {
        self.get_fleet_state()
            .vehicles
            .into_values()
            .filter(|v| v.is_online)
            .collect()
    }

    pub fn moving_vehicles(&self) -> Vec<VehicleStatus> {
        self.get_fleet_state()
            .vehicles
            .into_values()
            .filter(|v| v.is_moving)
            .collect()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.shared.fleet().last_refresh()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&FleetChange) + Send + Sync + 'static,
    {
        let id = ListenerId(Uuid::new_v4());
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        id
    }

    /// Returns false if the listener was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Re-fetches the full snapshot and overwrites known vehicles with it.
    ///
    /// Membership is unchanged: new vehicles in the snapshot are ignored.
    pub async fn refresh_snapshot(&self) -> Result<usize, FleetError> {
        let snapshot = self.services.source.fetch_fleet_snapshot(&self.shared.agency).await?;
        if self.shared.is_closed() {
            return Ok(0);
        }

        let updated = {
            let mut fleet = self.shared.fleet();
            let updated = fleet.refresh_from(snapshot);
            fleet.mark_refreshed(utc_now(self.ctx.as_ref()));
            updated
        };
        self.shared.notify(&FleetChange::Refreshed { updated });
        Ok(updated)
    }

    /// Runs one poll tick inline, regardless of the active transport.
    pub async fn poll_now(&self) -> usize {
        poll_tick(self.ctx.clone(), Arc::downgrade(&self.shared), self.services.source.clone()).await
    }

    /// Tears the subscription down: cancels the transport task and closes
    /// the push channel. In-flight poll fetches finish but are discarded.
    pub async fn shutdown(mut self) {
        self.close();
        info!("[{}] Subscription closed", self.shared.subscription);
    }

    fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(task) = self.transport.take() {
            task.abort();
            self.shared.set_mode(TransportMode::Stopped);
        }
    }
}

impl<Ctx: FleetContext> Drop for FleetReconciler<Ctx> {
    fn drop(&mut self) {
        self.close();
    }
}

fn utc_now<Ctx: FleetContext + ?Sized>(ctx: &Ctx) -> DateTime<Utc> {
    DateTime::<Utc>::from(ctx.system_time())
}

async fn run_push<Ctx: FleetContext>(
    ctx: Arc<Ctx>,
    shared: Arc<Shared>,
    live: Arc<dyn LiveTransport>,
    source: Arc<dyn TelemetrySource>,
    alerts: Arc<dyn AlertSink>,
) {
    let mut attempt = 0u32;

    loop {
        match live.open_live_channel(&shared.agency).await {
            Ok(mut channel) => {
                attempt = 0;
                shared.set_mode(TransportMode::Push);
                let reason = pump(&shared, &mut channel, alerts.as_ref()).await;
                warn!("[{}] Live channel dropped: {}", shared.subscription, reason);
            }
            Err(e) => {
                warn!("[{}] Live channel connect failed: {}", shared.subscription, e);
            }
        }

        if shared.is_closed() {
            return;
        }

        match shared.config.reconnect.delay_for(attempt) {
            Some(delay) => {
                attempt += 1;
                shared.set_mode(TransportMode::Reconnecting);
                info!("[{}] Reconnect attempt {} in {:?}", shared.subscription, attempt, delay);
                ctx.sleep(delay).await;
            }
            None => break,
        }
    }

    if shared.config.fall_back_to_polling {
        warn!("[{}] Reconnect attempts exhausted, falling back to polling", shared.subscription);
        run_poll(ctx, shared, source).await;
    } else {
        warn!("[{}] Reconnect attempts exhausted, live updates stopped", shared.subscription);
        shared.set_mode(TransportMode::Stopped);
    }
}

/// Applies frames in delivery order until the channel closes or errors.
async fn pump(shared: &Shared, channel: &mut LiveChannel, alerts: &dyn AlertSink) -> String {
    loop {
        match channel.recv().await {
            Some(Ok(frame)) => shared.handle_frame(&frame, alerts),
            Some(Err(e)) => {
                channel.close();
                return e.to_string();
            }
            None => return "closed by server".to_string(),
        }
    }
}

async fn run_poll<Ctx: FleetContext>(ctx: Arc<Ctx>, shared: Arc<Shared>, source: Arc<dyn TelemetrySource>) {
    shared.set_mode(TransportMode::Poll);
    let interval = shared.config.poll_interval.max(MIN_POLL_INTERVAL);
    let mut tick = 0u64;

    loop {
        ctx.sleep(interval).await;
        if shared.is_closed() {
            return;
        }

        tick += 1;
        let tick_ctx = ctx.clone();
        let weak = Arc::downgrade(&shared);
        let tick_source = source.clone();
        // detached: a slow tick may overlap the next one
        let _ = ctx.spawn(&format!("fleet-poll-tick-{tick}"), async move {
            poll_tick(tick_ctx, weak, tick_source).await;
        });
    }
}

/// Fetches the latest position of every currently online vehicle,
/// concurrently. Returns how many vehicles changed.
async fn poll_tick<Ctx: FleetContext>(
    ctx: Arc<Ctx>,
    shared: Weak<Shared>,
    source: Arc<dyn TelemetrySource>,
) -> usize {
    let (subscription, targets) = match shared.upgrade() {
        Some(state) if !state.is_closed() => {
            let now = utc_now(ctx.as_ref());
            let targets = state.fleet().online_ids(now, state.config.online_window);
            (state.subscription, targets)
        }
        _ => return 0,
    };

    let source = source.as_ref();
    let results = join_all(targets.iter().map(|vehicle| async move {
        (vehicle, source.fetch_latest_position(vehicle).await)
    }))
    .await;

    let Some(state) = shared.upgrade() else {
        debug!("[{}] Poll results discarded, subscription gone", subscription);
        return 0;
    };
    if state.is_closed() {
        debug!("[{}] Poll results discarded, subscription closed", subscription);
        return 0;
    }

    let mut updated = 0;
    for (vehicle, result) in results {
        match result {
            Ok(record) => {
                if state.apply(vehicle, &PositionUpdate::from(&record)) {
                    updated += 1;
                }
            }
            Err(e) => warn!("[{}] Latest position for {} failed: {}", subscription, vehicle, e),
        }
    }

    state.fleet().mark_refreshed(utc_now(ctx.as_ref()));
    debug!("[{}] Poll tick: {} of {} vehicles updated", subscription, updated, targets.len());
    state.notify(&FleetChange::Refreshed { updated });
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet_state::VehicleState;
    use crate::live_event::VehicleAlert;
    use crate::records::LocationRecord;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use fleetwatch_env::{EnvError, LiveSender, TokioContext};
    use std::time::Duration;

    struct FakeSource {
        fleet: Result<Vec<VehicleState>, EnvError>,
        latest: HashMap<VehicleId, LocationRecord>,
    }

    #[async_trait]
    impl TelemetrySource for FakeSource {
        async fn fetch_records_for_device(&self, _serial: &str) -> Result<Vec<LocationRecord>, EnvError> {
            Ok(Vec::new())
        }

        async fn fetch_records_in_range(
            &self,
            _vehicle: &VehicleId,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<LocationRecord>, EnvError> {
            Ok(Vec::new())
        }

        async fn fetch_latest_position(&self, vehicle: &VehicleId) -> Result<LocationRecord, EnvError> {
            self.latest.get(vehicle).cloned().ok_or_else(|| EnvError::not_found(vehicle))
        }

        async fn fetch_fleet_snapshot(&self, _agency: &AgencyId) -> Result<Vec<VehicleState>, EnvError> {
            self.fleet.clone()
        }
    }

    struct OneShotTransport {
        channel: Mutex<Option<LiveChannel>>,
    }

    #[async_trait]
    impl LiveTransport for OneShotTransport {
        async fn open_live_channel(&self, _agency: &AgencyId) -> Result<LiveChannel, EnvError> {
            self.channel
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| EnvError::network("refused"))
        }
    }

    #[derive(Default)]
    struct CountingSink(Mutex<Vec<VehicleId>>);

    impl AlertSink for CountingSink {
        fn forward(&self, vehicle: &VehicleId, _alert: &VehicleAlert) {
            self.0.lock().unwrap().push(vehicle.clone());
        }
    }

    fn online(id: &str) -> VehicleState {
        VehicleState {
            last_update: Some(Utc::now() - ChronoDuration::seconds(30)),
            ..VehicleState::new(id)
        }
    }

    fn services(source: FakeSource, live: Option<Arc<dyn LiveTransport>>, alerts: Arc<CountingSink>) -> FleetServices {
        FleetServices {
            source: Arc::new(source),
            live,
            alerts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_failure_fails_start() {
        let source = FakeSource {
            fleet: Err(EnvError::network("down")),
            latest: HashMap::new(),
        };
        let result = FleetReconciler::start(
            TokioContext::shared(),
            AgencyId::new("agency-1"),
            services(source, None, Arc::default()),
            ReconcilerConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(FleetError::Bootstrap { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_mode_updates_online_vehicles() {
        let latest = LocationRecord::new("veh-1", 48.85, 2.35, Utc::now())
            .with_speed(30.0)
            .with_ignition(true);
        let source = FakeSource {
            fleet: Ok(vec![online("veh-1"), online("veh-2"), VehicleState::new("veh-3")]),
            latest: HashMap::from([(VehicleId::from("veh-1"), latest)]),
        };

        let reconciler = FleetReconciler::start(
            TokioContext::shared(),
            AgencyId::new("agency-1"),
            services(source, None, Arc::default()),
            ReconcilerConfig::default(),
        )
        .await
        .unwrap();

        let refreshes = Arc::new(Mutex::new(Vec::new()));
        let seen = refreshes.clone();
        reconciler.subscribe(move |change| {
            if let FleetChange::Refreshed { updated } = change {
                seen.lock().unwrap().push(*updated);
            }
        });

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(reconciler.transport_mode(), TransportMode::Poll);
        // veh-2 failed its fetch and stays stale; veh-3 was never polled
        assert_eq!(*refreshes.lock().unwrap(), vec![1]);
        let veh1 = reconciler.vehicle(&VehicleId::from("veh-1")).unwrap();
        assert!(veh1.is_moving);
        assert_eq!(reconciler.moving_vehicles().len(), 1);
        assert_eq!(reconciler.get_fleet_state().summary.total, 3);

        reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_mode_applies_updates_and_forwards_alerts() {
        let (tx, channel): (LiveSender, LiveChannel) = LiveChannel::pair(8);
        let transport: Arc<dyn LiveTransport> = Arc::new(OneShotTransport {
            channel: Mutex::new(Some(channel)),
        });
        let alerts = Arc::new(CountingSink::default());
        let source = FakeSource {
            fleet: Ok(vec![VehicleState::new("veh-1")]),
            latest: HashMap::new(),
        };

        let reconciler = FleetReconciler::start(
            TokioContext::shared(),
            AgencyId::new("agency-1"),
            services(source, Some(transport), alerts.clone()),
            ReconcilerConfig::default(),
        )
        .await
        .unwrap();

        let update = LiveEvent::PositionUpdate {
            vehicle_id: VehicleId::from("veh-1"),
            payload: PositionUpdate {
                latitude: Some(48.85),
                longitude: Some(2.35),
                timestamp: Some(Utc::now()),
                speed_kmh: Some(55.0),
                ignition_on: Some(true),
                ..PositionUpdate::default()
            },
        };
        let alert = LiveEvent::Alert {
            vehicle_id: VehicleId::from("veh-1"),
            payload: VehicleAlert::default(),
        };
        tx.send(update.encode().unwrap()).await.unwrap();
        tx.send(LiveFrame::new(b"{}".to_vec())).await.unwrap();
        tx.send(alert.encode().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(reconciler.transport_mode(), TransportMode::Push);
        assert!(reconciler.vehicle(&VehicleId::from("veh-1")).unwrap().is_moving);
        assert_eq!(alerts.0.lock().unwrap().len(), 1);

        reconciler.shutdown().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(tx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_for_unknown_vehicle_is_forwarded_without_joining_fleet() {
        let (tx, channel) = LiveChannel::pair(8);
        let transport: Arc<dyn LiveTransport> = Arc::new(OneShotTransport {
            channel: Mutex::new(Some(channel)),
        });
        let alerts = Arc::new(CountingSink::default());
        let source = FakeSource {
            fleet: Ok(vec![online("veh-1")]),
            latest: HashMap::new(),
        };

        let reconciler = FleetReconciler::start(
            TokioContext::shared(),
            AgencyId::new("agency-1"),
            services(source, Some(transport), alerts.clone()),
            ReconcilerConfig::default(),
        )
        .await
        .unwrap();

        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let seen = forwarded.clone();
        reconciler.subscribe(move |change| {
            if let FleetChange::AlertForwarded(vehicle) = change {
                seen.lock().unwrap().push(vehicle.clone());
            }
        });
        let before = reconciler.get_fleet_state();

        let alert = LiveEvent::Alert {
            vehicle_id: VehicleId::from("veh-unknown"),
            payload: VehicleAlert {
                alert_type: Some("geofence".to_string()),
                ..VehicleAlert::default()
            },
        };
        tx.send(alert.encode().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*alerts.0.lock().unwrap(), vec![VehicleId::from("veh-unknown")]);
        assert_eq!(*forwarded.lock().unwrap(), vec![VehicleId::from("veh-unknown")]);

        let after = reconciler.get_fleet_state();
        assert_eq!(after.summary.total, 1);
        assert!(reconciler.vehicle(&VehicleId::from("veh-unknown")).is_none());
        let known = VehicleId::from("veh-1");
        assert_eq!(after.vehicles[&known].state, before.vehicles[&known].state);

        reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe() {
        let source = FakeSource {
            fleet: Ok(Vec::new()),
            latest: HashMap::new(),
        };
        let reconciler = FleetReconciler::start(
            TokioContext::shared(),
            AgencyId::new("agency-1"),
            services(source, None, Arc::default()),
            ReconcilerConfig::default(),
        )
        .await
        .unwrap();

        let id = reconciler.subscribe(|_| {});
        assert!(reconciler.unsubscribe(id));
        assert!(!reconciler.unsubscribe(id));
        assert_eq!(reconciler.get_fleet_state().summary.total, 0);
    }
}
