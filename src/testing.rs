//! Fakes shared by the in-crate tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::oneshot;

use crate::feeds::{ArrivalFeed, FeedError, VehiclePositionFeed};
use crate::models::{ArrivalEstimate, RouteId, StopId, VehicleId, VehiclePosition};
use crate::notifications::{
    NotificationError, NotificationKey, NotificationKind, NotificationPayload, NotificationSink,
    PermissionGate,
};

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 7, 8, 0, 0).unwrap()
}

/// Stop 258, route 12, effective time `at`.
pub(crate) fn estimate_at(vehicle: &str, at: DateTime<Utc>) -> ArrivalEstimate {
    ArrivalEstimate::new("12", "258", vehicle, at, None)
}

/// Lets spawned tasks run until they block again.
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

type ArrivalResult = Result<Vec<ArrivalEstimate>, FeedError>;

/// Answers from `fallback` unless a test parked the next call with
/// [`hold_next`](ScriptedArrivalFeed::hold_next).
pub(crate) struct ScriptedArrivalFeed {
    held: Mutex<VecDeque<oneshot::Receiver<ArrivalResult>>>,
    fallback: Mutex<ArrivalResult>,
    calls: AtomicUsize,
}

impl ScriptedArrivalFeed {
    pub fn new(fallback: ArrivalResult) -> Self {
        Self {
            held: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn hold_next(&self) -> oneshot::Sender<ArrivalResult> {
        let (tx, rx) = oneshot::channel();
        self.held.lock().unwrap().push_back(rx);
        tx
    }

    pub fn set_fallback(&self, fallback: ArrivalResult) {
        *self.fallback.lock().unwrap() = fallback;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArrivalFeed for ScriptedArrivalFeed {
    async fn fetch(
        &self,
        _stop_id: &StopId,
        _route_filter: Option<&RouteId>,
    ) -> Result<Vec<ArrivalEstimate>, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let held = self.held.lock().unwrap().pop_front();
        match held {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(FeedError::transient("test dropped the response"))),
            None => self.fallback.lock().unwrap().clone(),
        }
    }
}

type PositionResult = Result<VehiclePosition, FeedError>;

/// Pops scripted results in order; once the script runs out every call
/// reports a fix a little further north than the last.
pub(crate) struct ScriptedVehicleFeed {
    script: Mutex<VecDeque<PositionResult>>,
    held: Mutex<VecDeque<oneshot::Receiver<PositionResult>>>,
    calls: AtomicUsize,
}

impl ScriptedVehicleFeed {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            held: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, result: PositionResult) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn hold_next(&self) -> oneshot::Sender<PositionResult> {
        let (tx, rx) = oneshot::channel();
        self.held.lock().unwrap().push_back(rx);
        tx
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn fix(vehicle: &str, latitude: f64) -> VehiclePosition {
    VehiclePosition {
        vehicle_id: VehicleId::new(vehicle),
        latitude,
        longitude: -122.68,
        observed_at: t0(),
    }
}

#[async_trait]
impl VehiclePositionFeed for ScriptedVehicleFeed {
    async fn fetch(&self, vehicle_id: &VehicleId) -> Result<VehiclePosition, FeedError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let held = self.held.lock().unwrap().pop_front();
        if let Some(rx) = held {
            return rx
                .await
                .unwrap_or_else(|_| Err(FeedError::transient("test dropped the response")));
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(fix(vehicle_id.as_str(), 45.5 + call as f64 * 0.001)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkEvent {
    Scheduled {
        key: NotificationKey,
        fire_at: DateTime<Utc>,
        payload: NotificationPayload,
    },
    Cancelled(Vec<NotificationKey>),
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn scheduled_count(&self, kind: NotificationKind) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, SinkEvent::Scheduled { key, .. } if key.kind == kind))
            .count()
    }

    pub fn fire_time(&self, kind: NotificationKind) -> Option<DateTime<Utc>> {
        self.events().into_iter().find_map(|event| match event {
            SinkEvent::Scheduled { key, fire_at, .. } if key.kind == kind => Some(fire_at),
            _ => None,
        })
    }

    pub fn cancel_calls(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, SinkEvent::Cancelled(_)))
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn schedule(
        &self,
        key: &NotificationKey,
        fire_at: DateTime<Utc>,
        payload: &NotificationPayload,
    ) -> Result<(), NotificationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NotificationError::SchedulingFailure("simulated".into()));
        }
        self.events.lock().unwrap().push(SinkEvent::Scheduled {
            key: key.clone(),
            fire_at,
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn cancel(&self, keys: &[NotificationKey]) -> Result<(), NotificationError> {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Cancelled(keys.to_vec()));
        Ok(())
    }
}

pub(crate) struct FixedPermission(pub bool);

impl PermissionGate for FixedPermission {
    fn is_notification_granted(&self) -> bool {
        self.0
    }
}
