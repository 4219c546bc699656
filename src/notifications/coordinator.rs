use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use log::info;

use crate::models::{ArrivalEstimate, ArrivalIdentity};
use crate::settings::EngineConfig;

use super::dispatcher::NotificationDispatcher;
use super::{NotificationKey, NotificationKind, NotificationPayload, NotificationSink, PermissionGate};

/// Schedules the "three minutes out" and "arrived" alerts for whatever
/// arrival the session is currently following.
///
/// Each kind is scheduled at most once per arrival identity. When the
/// identity changes (another vehicle, or a shifted estimate) the previous
/// identity's alerts are cancelled and the new identity starts fresh. An
/// empty read changes nothing; only [`on_session_stopped`] clears alerts.
/// Alerts whose fire time has already passed count as delivered and are
/// never cancelled. A kind that was delivered is never scheduled again in the
/// same session, whatever the identity.
///
/// Owned exclusively by one session's controller.
///
/// [`on_session_stopped`]: NotificationCoordinator::on_session_stopped
pub struct NotificationCoordinator {
    dispatcher: NotificationDispatcher,
    enabled: bool,
    lead: TimeDelta,
    minimum_fire_delay: TimeDelta,
    stop_label: String,
    current: Option<ArrivalIdentity>,
    scheduled: HashMap<NotificationKey, DateTime<Utc>>,
    delivered: HashSet<NotificationKind>,
}

impl NotificationCoordinator {
    /// Checks notification permission once; when denied the coordinator
    /// silently ignores every estimate for its whole lifetime.
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        permission: &dyn PermissionGate,
        config: &EngineConfig,
        stop_label: impl Into<String>,
    ) -> Self {
        let enabled = permission.is_notification_granted();
        if !enabled {
            info!("Notifications not authorized; tracking continues without alerts");
        }

        Self {
            dispatcher: NotificationDispatcher::new(sink),
            enabled,
            lead: config.three_minute_lead(),
            minimum_fire_delay: config.minimum_fire_delay(),
            stop_label: stop_label.into(),
            current: None,
            scheduled: HashMap::new(),
            delivered: HashSet::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current_identity(&self) -> Option<&ArrivalIdentity> {
        self.current.as_ref()
    }

    pub fn is_scheduled(&self, kind: NotificationKind) -> bool {
        self.scheduled.keys().any(|key| key.kind == kind)
    }

    pub fn was_delivered(&self, kind: NotificationKind) -> bool {
        self.delivered.contains(&kind)
    }

    pub fn on_estimate_changed(&mut self, latest: Option<&ArrivalEstimate>, now: DateTime<Utc>) {
        if !self.enabled {
            return;
        }
        let Some(estimate) = latest else {
            return;
        };

        let identity = estimate.identity();
        if self.current.as_ref() != Some(&identity) {
            self.cancel_outstanding(now);
            self.current = Some(identity.clone());
        }

        let effective = identity.effective_time;
        let until_arrival = effective - now;
        if until_arrival <= TimeDelta::zero() {
            return;
        }

        self.schedule_once(NotificationKind::ArrivalImminent, &identity, effective, estimate);

        let warn_at = if until_arrival > self.lead {
            effective - self.lead
        } else {
            // Already inside the lead window and not yet warned; warn right away.
            now + self.minimum_fire_delay
        };
        self.schedule_once(NotificationKind::ThreeMinutesOut, &identity, warn_at, estimate);
    }

    pub fn on_session_stopped(&mut self, now: DateTime<Utc>) {
        self.cancel_outstanding(now);
        self.current = None;
        self.delivered.clear();
    }

    fn schedule_once(
        &mut self,
        kind: NotificationKind,
        identity: &ArrivalIdentity,
        fire_at: DateTime<Utc>,
        estimate: &ArrivalEstimate,
    ) {
        let key = NotificationKey::new(kind, identity.clone());
        if self.delivered.contains(&kind) || self.scheduled.contains_key(&key) {
            return;
        }

        let payload = NotificationPayload::for_kind(kind, estimate.display_route(), &self.stop_label);
        self.dispatcher.schedule(key.clone(), fire_at, payload);
        self.scheduled.insert(key, fire_at);
    }

    fn cancel_outstanding(&mut self, now: DateTime<Utc>) {
        let mut keys = Vec::new();
        for (key, fire_at) in self.scheduled.drain() {
            if fire_at > now {
                keys.push(key);
            } else {
                self.delivered.insert(key.kind);
            }
        }
        self.dispatcher.cancel(keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{estimate_at, settle, t0, FixedPermission, RecordingSink, SinkEvent};

    fn coordinator(sink: &Arc<RecordingSink>, granted: bool) -> NotificationCoordinator {
        NotificationCoordinator::new(
            sink.clone(),
            &FixedPermission(granted),
            &EngineConfig::default(),
            "SW 6th & Madison",
        )
    }

    #[tokio::test]
    async fn same_identity_schedules_each_kind_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, true);
        let arrival = estimate_at("3120", t0() + TimeDelta::minutes(10));

        coordinator.on_estimate_changed(Some(&arrival), t0());
        coordinator.on_estimate_changed(Some(&arrival.clone()), t0() + TimeDelta::seconds(15));
        settle().await;

        assert_eq!(sink.scheduled_count(NotificationKind::ArrivalImminent), 1);
        assert_eq!(sink.scheduled_count(NotificationKind::ThreeMinutesOut), 1);
        assert_eq!(
            sink.fire_time(NotificationKind::ThreeMinutesOut),
            Some(t0() + TimeDelta::minutes(7))
        );
        assert_eq!(
            sink.fire_time(NotificationKind::ArrivalImminent),
            Some(t0() + TimeDelta::minutes(10))
        );
    }

    #[tokio::test]
    async fn identity_change_cancels_then_reschedules() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, true);
        let x = estimate_at("3120", t0() + TimeDelta::minutes(10));
        let y = estimate_at("3188", t0() + TimeDelta::minutes(10));

        coordinator.on_estimate_changed(Some(&x), t0());
        coordinator.on_estimate_changed(Some(&y), t0() + TimeDelta::seconds(15));
        settle().await;

        let events = sink.events();
        let cancels: Vec<&Vec<NotificationKey>> = events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Cancelled(keys) => Some(keys),
                _ => None,
            })
            .collect();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].len(), 2);
        assert!(cancels[0].iter().all(|key| key.identity == x.identity()));

        let y_schedules = events
            .iter()
            .filter(|event| matches!(event, SinkEvent::Scheduled { key, .. } if key.identity == y.identity()))
            .count();
        assert_eq!(y_schedules, 2);
        assert_eq!(coordinator.current_identity(), Some(&y.identity()));
    }

    #[tokio::test]
    async fn near_arrival_warns_after_minimum_delay() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, true);
        let arrival = estimate_at("3120", t0() + TimeDelta::seconds(90));

        coordinator.on_estimate_changed(Some(&arrival), t0());
        settle().await;

        assert_eq!(
            sink.fire_time(NotificationKind::ThreeMinutesOut),
            Some(t0() + TimeDelta::seconds(1))
        );
        assert_eq!(sink.scheduled_count(NotificationKind::ArrivalImminent), 1);
    }

    #[tokio::test]
    async fn missing_estimate_leaves_alerts_alone() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, true);
        let arrival = estimate_at("3120", t0() + TimeDelta::minutes(10));

        coordinator.on_estimate_changed(Some(&arrival), t0());
        coordinator.on_estimate_changed(None, t0() + TimeDelta::seconds(15));
        settle().await;

        assert_eq!(sink.cancel_calls(), 0);
        assert!(coordinator.is_scheduled(NotificationKind::ThreeMinutesOut));
    }

    #[tokio::test]
    async fn past_arrival_schedules_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, true);
        let arrival = estimate_at("3120", t0() - TimeDelta::seconds(5));

        coordinator.on_estimate_changed(Some(&arrival), t0());
        settle().await;

        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn session_stop_cancels_current_identity() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, true);
        let arrival = estimate_at("3120", t0() + TimeDelta::minutes(10));

        coordinator.on_estimate_changed(Some(&arrival), t0());
        coordinator.on_session_stopped(t0());
        coordinator.on_session_stopped(t0());
        settle().await;

        assert_eq!(sink.cancel_calls(), 1);
        assert!(!coordinator.is_scheduled(NotificationKind::ArrivalImminent));
        assert!(coordinator.current_identity().is_none());
    }

    #[tokio::test]
    async fn alerts_already_due_are_not_cancelled() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, true);
        let arrival = estimate_at("3120", t0() + TimeDelta::minutes(10));

        coordinator.on_estimate_changed(Some(&arrival), t0());
        coordinator.on_session_stopped(t0() + TimeDelta::minutes(8));
        settle().await;

        let events = sink.events();
        let cancelled = events.iter().find_map(|event| match event {
            SinkEvent::Cancelled(keys) => Some(keys.clone()),
            _ => None,
        });
        let cancelled = cancelled.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].kind, NotificationKind::ArrivalImminent);

        coordinator.on_estimate_changed(Some(&arrival), t0() + TimeDelta::minutes(11));
        coordinator.on_session_stopped(t0() + TimeDelta::minutes(11));
        settle().await;
        assert_eq!(sink.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn three_minute_warning_is_not_repeated_after_estimate_shifts() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, true);
        let arrival = t0() + TimeDelta::minutes(10);

        coordinator.on_estimate_changed(Some(&estimate_at("3120", arrival)), t0());
        for shift in 1..=4 {
            let now = t0() + TimeDelta::minutes(7) + TimeDelta::seconds(5 + 15 * shift);
            let shifted = estimate_at("3120", arrival + TimeDelta::seconds(5 * shift));
            coordinator.on_estimate_changed(Some(&shifted), now);
        }
        settle().await;

        assert_eq!(sink.scheduled_count(NotificationKind::ThreeMinutesOut), 1);
        assert_eq!(sink.scheduled_count(NotificationKind::ArrivalImminent), 5);
        assert!(coordinator.was_delivered(NotificationKind::ThreeMinutesOut));
        assert!(!coordinator.is_scheduled(NotificationKind::ThreeMinutesOut));
    }

    #[tokio::test]
    async fn shift_before_warning_is_due_still_warns_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, true);

        coordinator.on_estimate_changed(Some(&estimate_at("3120", t0() + TimeDelta::minutes(10))), t0());
        // Bus gains a minute before the warning went out: the new identity
        // is already inside the lead window.
        let now = t0() + TimeDelta::seconds(6 * 60 + 50);
        let earlier = estimate_at("3120", t0() + TimeDelta::minutes(9));
        coordinator.on_estimate_changed(Some(&earlier), now);
        settle().await;

        assert_eq!(sink.scheduled_count(NotificationKind::ThreeMinutesOut), 2);
        assert_eq!(sink.cancel_calls(), 1);
        let rescheduled = sink.events().into_iter().find_map(|event| match event {
            SinkEvent::Scheduled { key, fire_at, .. }
                if key.kind == NotificationKind::ThreeMinutesOut
                    && key.identity == earlier.identity() =>
            {
                Some(fire_at)
            }
            _ => None,
        });
        assert_eq!(rescheduled, Some(now + TimeDelta::seconds(1)));
    }

    #[tokio::test]
    async fn denied_permission_never_touches_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let mut coordinator = coordinator(&sink, false);
        let arrival = estimate_at("3120", t0() + TimeDelta::minutes(10));

        coordinator.on_estimate_changed(Some(&arrival), t0());
        coordinator.on_session_stopped(t0());
        settle().await;

        assert!(!coordinator.is_enabled());
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn sink_failures_are_not_retried() {
        let sink = Arc::new(RecordingSink::failing());
        let mut coordinator = coordinator(&sink, true);
        let arrival = estimate_at("3120", t0() + TimeDelta::minutes(10));

        coordinator.on_estimate_changed(Some(&arrival), t0());
        coordinator.on_estimate_changed(Some(&arrival), t0() + TimeDelta::seconds(15));
        settle().await;

        assert_eq!(sink.attempts(), 2);
        assert!(coordinator.is_scheduled(NotificationKind::ArrivalImminent));
    }
}
