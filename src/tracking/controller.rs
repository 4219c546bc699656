use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::feeds::{ArrivalFeed, VehiclePositionFeed};
use crate::models::{ArrivalEstimate, SessionState, StopReason, TrackingSession};
use crate::notifications::{NotificationCoordinator, NotificationSink, PermissionGate};
use crate::polling::{ArrivalBoard, ArrivalPoller, VehicleTrack, VehicleTracker};
use crate::settings::EngineConfig;

use super::{ProgressSnapshot, TrackingState, TrackingStatus};

/// The outside world a session talks to.
#[derive(Clone)]
pub struct TrackingServices {
    pub arrivals: Arc<dyn ArrivalFeed>,
    pub vehicles: Arc<dyn VehiclePositionFeed>,
    pub sink: Arc<dyn NotificationSink>,
    pub permission: Arc<dyn PermissionGate>,
    pub clock: Arc<dyn Clock>,
}

struct Driver {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

struct SessionInner {
    services: TrackingServices,
    config: EngineConfig,
    state: Mutex<TrackingState>,
    progress: watch::Sender<ProgressSnapshot>,
    poller: ArrivalPoller,
    tracker: VehicleTracker,
    driver: Mutex<Option<Driver>>,
}

/// Runs one committed tracking session from start to stop.
///
/// A controller is single-use: `Idle -> Active -> Stopped`. The session ends
/// either when the rider stops it or on its own once the tracked arrival's
/// effective time has passed.
#[derive(Clone)]
pub struct TrackingSessionController {
    inner: Arc<SessionInner>,
}

impl TrackingSessionController {
    pub fn new(services: TrackingServices, config: EngineConfig) -> Self {
        let config = config.normalized();
        let poller = ArrivalPoller::new(services.arrivals.clone(), config.fetch_timeout());
        let tracker = VehicleTracker::new(services.vehicles.clone(), config.fetch_timeout());
        let (progress, _) = watch::channel(ProgressSnapshot::default());

        Self {
            inner: Arc::new(SessionInner {
                services,
                config,
                state: Mutex::new(TrackingState::new()),
                progress,
                poller,
                tracker,
                driver: Mutex::new(None),
            }),
        }
    }

    /// Commits to `estimate`. Polling, position tracking and alert scheduling
    /// all begin before this returns.
    pub fn start(
        &self,
        estimate: ArrivalEstimate,
        stop_name: Option<String>,
    ) -> Result<TrackingSession> {
        let now = self.inner.services.clock.now();

        let session = {
            let mut state = self.inner.lock_state();
            if state.status != TrackingStatus::Idle {
                bail!("tracking session already started");
            }

            let session = TrackingSession {
                id: Uuid::new_v4().to_string(),
                stop_id: estimate.stop_id.clone(),
                stop_name,
                route_id: estimate.route_id.clone(),
                vehicle_id: estimate.vehicle_id.clone(),
                started_at: now,
                stopped_at: None,
                state: SessionState::Active,
                stop_reason: None,
            };
            state.begin(session.clone(), estimate.clone());
            session
        };

        info!(
            "Tracking session {} started: route {} vehicle {} to {} at {}",
            session.id,
            estimate.display_route(),
            session.vehicle_id,
            session.display_stop(),
            estimate.effective_time()
        );

        let mut coordinator = NotificationCoordinator::new(
            self.inner.services.sink.clone(),
            self.inner.services.permission.as_ref(),
            &self.inner.config,
            session.display_stop(),
        );
        coordinator.on_estimate_changed(Some(&estimate), now);

        let board_rx = self.inner.poller.subscribe();
        if let Err(err) = self.inner.start_feeds(&session) {
            self.inner.finish(StopReason::Cancelled);
            coordinator.on_session_stopped(now);
            return Err(err);
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(drive(
            self.inner.clone(),
            coordinator,
            board_rx,
            cancel_token.clone(),
        ));
        *self.inner.lock_driver() = Some(Driver {
            cancel_token,
            handle,
        });

        self.inner.publish_progress();
        Ok(session)
    }

    /// Rider-initiated stop.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with(StopReason::Cancelled).await
    }

    /// Stops the session and waits until cancellation of outstanding alerts
    /// has been queued for the sink. Calling it again is a no-op.
    pub async fn stop_with(&self, reason: StopReason) -> Result<()> {
        self.inner.finish(reason);

        let driver = self.inner.lock_driver().take();
        if let Some(driver) = driver {
            driver.cancel_token.cancel();
            driver
                .handle
                .await
                .map_err(|err| anyhow!("tracking driver failed: {err}"))?;
        }
        Ok(())
    }

    /// Resolves once the session has stopped, for whatever reason. Never
    /// resolves for a controller that was never started.
    pub async fn wait_stopped(&self) -> ProgressSnapshot {
        let mut rx = self.inner.progress.subscribe();
        let stopped = rx
            .wait_for(|snapshot| snapshot.status == TrackingStatus::Stopped)
            .await
            .map(|snapshot| snapshot.clone());
        stopped.unwrap_or_else(|_| self.progress())
    }

    pub fn status(&self) -> TrackingStatus {
        self.inner.lock_state().status
    }

    pub fn session(&self) -> Option<TrackingSession> {
        self.inner.lock_state().session.clone()
    }

    /// The arrival the progress bar currently measures against.
    pub fn tracked_estimate(&self) -> Option<ArrivalEstimate> {
        self.inner.lock_state().tracked.clone()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let now = self.inner.services.clock.now();
        self.inner.lock_state().snapshot(now)
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.inner.progress.subscribe()
    }

    pub fn board(&self) -> ArrivalBoard {
        self.inner.poller.board()
    }

    pub fn vehicle_track(&self) -> VehicleTrack {
        self.inner.tracker.track()
    }

    pub fn subscribe_vehicle(&self) -> watch::Receiver<VehicleTrack> {
        self.inner.tracker.subscribe()
    }

    pub fn refresh_now(&self) {
        self.inner.poller.refresh_now();
    }

    pub fn poller(&self) -> &ArrivalPoller {
        &self.inner.poller
    }

    pub fn tracker(&self) -> &VehicleTracker {
        &self.inner.tracker
    }
}

impl SessionInner {
    fn start_feeds(&self, session: &TrackingSession) -> Result<()> {
        self.poller.start(
            session.stop_id.clone(),
            session.route_id.clone(),
            self.config.arrival_poll_interval(),
        )?;
        self.tracker.start(
            session.stop_id.clone(),
            session.route_id.clone(),
            session.vehicle_id.clone(),
            self.config.vehicle_poll_interval(),
        )?;
        Ok(())
    }

    fn apply_board(&self, board: &ArrivalBoard, coordinator: &mut NotificationCoordinator) {
        let now = self.services.clock.now();

        let latest = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.status != TrackingStatus::Active {
                return;
            }
            state.last_error = board.last_error.clone();
            let Some(session) = state.session.as_ref() else {
                return;
            };

            let latest = select_tracked(&board.estimates, session, now).cloned();
            if let Some(estimate) = latest.clone() {
                let session_id = session.id.clone();
                let identity = estimate.identity();
                if state.retarget(estimate) {
                    debug!("Session {session_id} now measures against {identity}");
                }
            }
            latest
        };

        coordinator.on_estimate_changed(latest.as_ref(), now);
    }

    fn arrival_due(&self, now: DateTime<Utc>) -> bool {
        self.lock_state().is_due(now)
    }

    /// Moves the session to `Stopped` and halts both feeds. Safe to call
    /// repeatedly.
    fn finish(&self, reason: StopReason) {
        let now = self.services.clock.now();
        let stopped_session = {
            let mut state = self.lock_state();
            if state.stop(reason, now) {
                state.session.as_ref().map(|session| session.id.clone())
            } else {
                None
            }
        };

        self.poller.stop();
        self.tracker.stop();

        if let Some(session_id) = stopped_session {
            info!("Tracking session {session_id} stopped: {}", reason.as_str());
        }
        self.publish_progress();
    }

    fn publish_progress(&self) {
        let now = self.services.clock.now();
        let snapshot = self.lock_state().snapshot(now);
        self.progress.send_replace(snapshot);
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<Driver>> {
        match self.driver.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Reacts to fresh boards and ticks the progress bar until the session stops.
/// The coordinator lives here so every sink call for a session comes from
/// one task.
async fn drive(
    inner: Arc<SessionInner>,
    mut coordinator: NotificationCoordinator,
    mut board_rx: watch::Receiver<ArrivalBoard>,
    cancel_token: CancellationToken,
) {
    let mut ticker = time::interval(inner.config.progress_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            changed = board_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let board = board_rx.borrow_and_update().clone();
                inner.apply_board(&board, &mut coordinator);
            }
            _ = ticker.tick() => {}
        }

        let now = inner.services.clock.now();
        if inner.arrival_due(now) {
            inner.finish(StopReason::Arrived);
            break;
        }
        inner.publish_progress();
    }

    coordinator.on_session_stopped(inner.services.clock.now());
}

/// The session's own vehicle when the board still lists it, otherwise the
/// soonest upcoming arrival on the same route.
fn select_tracked<'a>(
    estimates: &'a [ArrivalEstimate],
    session: &TrackingSession,
    now: DateTime<Utc>,
) -> Option<&'a ArrivalEstimate> {
    let on_route = || {
        estimates
            .iter()
            .filter(move |estimate| estimate.route_id == session.route_id)
    };

    on_route()
        .find(|estimate| estimate.vehicle_id == session.vehicle_id)
        .or_else(|| {
            on_route()
                .filter(|estimate| estimate.effective_time() > now)
                .min_by_key(|estimate| estimate.effective_time())
        })
}
