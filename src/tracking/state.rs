use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::feeds::FeedError;
use crate::models::{ArrivalEstimate, SessionState, StopReason, TrackingSession};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TrackingStatus {
    #[default]
    Idle,
    Active,
    Stopped,
}

/// What a progress bar needs, computed for one instant.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub status: TrackingStatus,
    pub elapsed_secs: i64,
    pub total_secs: i64,
    pub remaining_secs: i64,
    pub fraction: f64,
    pub eta: Option<DateTime<Utc>>,
    pub minutes_remaining: i64,
    /// The last refresh failed and the figures come from older data.
    pub data_stale: bool,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone)]
pub struct TrackingState {
    pub status: TrackingStatus,
    pub session: Option<TrackingSession>,
    pub tracked: Option<ArrivalEstimate>,
    /// Denominator of the progress bar: effective time minus session start.
    pub total: TimeDelta,
    pub last_error: Option<FeedError>,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self {
            status: TrackingStatus::Idle,
            session: None,
            tracked: None,
            total: TimeDelta::zero(),
            last_error: None,
        }
    }
}

impl TrackingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, session: TrackingSession, estimate: ArrivalEstimate) {
        let total = total_for(&session, &estimate);
        *self = Self {
            status: TrackingStatus::Active,
            session: Some(session),
            tracked: Some(estimate),
            total,
            last_error: None,
        };
    }

    /// Swaps in the latest estimate. Returns `true` when it is a different
    /// arrival, in which case the progress denominator is recomputed.
    pub fn retarget(&mut self, estimate: ArrivalEstimate) -> bool {
        let changed = self
            .tracked
            .as_ref()
            .map_or(true, |current| current.identity() != estimate.identity());

        if changed {
            if let Some(session) = self.session.as_ref() {
                self.total = total_for(session, &estimate);
            }
        }
        self.tracked = Some(estimate);
        changed
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> TimeDelta {
        let Some(session) = self.session.as_ref() else {
            return TimeDelta::zero();
        };
        let upper = match (self.status, session.stopped_at) {
            (TrackingStatus::Stopped, Some(stopped_at)) => stopped_at.min(now),
            _ => now,
        };
        (upper - session.started_at).clamp(TimeDelta::zero(), self.total)
    }

    pub fn eta(&self) -> Option<DateTime<Utc>> {
        self.tracked.as_ref().map(ArrivalEstimate::effective_time)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TrackingStatus::Active && self.eta().is_some_and(|eta| now >= eta)
    }

    /// Returns `false` when the session was not running.
    pub fn stop(&mut self, reason: StopReason, now: DateTime<Utc>) -> bool {
        match self.status {
            TrackingStatus::Stopped => false,
            TrackingStatus::Idle => {
                self.status = TrackingStatus::Stopped;
                false
            }
            TrackingStatus::Active => {
                self.status = TrackingStatus::Stopped;
                if let Some(session) = self.session.as_mut() {
                    session.state = SessionState::Stopped;
                    session.stopped_at = Some(now);
                    session.stop_reason = Some(reason);
                }
                true
            }
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ProgressSnapshot {
        let elapsed = self.elapsed(now);
        let total_secs = self.total.num_seconds();
        let elapsed_secs = elapsed.num_seconds();
        let fraction = if self.total > TimeDelta::zero() {
            (elapsed.num_milliseconds() as f64 / self.total.num_milliseconds() as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };

        ProgressSnapshot {
            status: self.status,
            elapsed_secs,
            total_secs,
            remaining_secs: (total_secs - elapsed_secs).max(0),
            fraction,
            eta: self.eta(),
            minutes_remaining: match (self.status, self.tracked.as_ref()) {
                (TrackingStatus::Active, Some(tracked)) => tracked.minutes_until(now),
                _ => 0,
            },
            data_stale: self.last_error.is_some(),
            stop_reason: self.session.as_ref().and_then(|session| session.stop_reason),
        }
    }
}

/// Never below one second, so the bar always has a denominator.
fn total_for(session: &TrackingSession, estimate: &ArrivalEstimate) -> TimeDelta {
    (estimate.effective_time() - session.started_at).max(TimeDelta::seconds(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{estimate_at, t0};

    fn session() -> TrackingSession {
        TrackingSession {
            id: "session".into(),
            stop_id: "258".into(),
            stop_name: None,
            route_id: "12".into(),
            vehicle_id: "3120".into(),
            started_at: t0(),
            stopped_at: None,
            state: SessionState::Active,
            stop_reason: None,
        }
    }

    fn active(minutes_out: i64) -> TrackingState {
        let mut state = TrackingState::new();
        state.begin(session(), estimate_at("3120", t0() + TimeDelta::minutes(minutes_out)));
        state
    }

    #[test]
    fn progress_is_clamped_to_total() {
        let state = active(10);

        assert_eq!(state.elapsed(t0() - TimeDelta::seconds(5)), TimeDelta::zero());
        assert_eq!(state.elapsed(t0() + TimeDelta::minutes(4)), TimeDelta::minutes(4));
        assert_eq!(state.elapsed(t0() + TimeDelta::minutes(30)), TimeDelta::minutes(10));

        let snapshot = state.snapshot(t0() + TimeDelta::minutes(4));
        assert_eq!(snapshot.total_secs, 600);
        assert_eq!(snapshot.remaining_secs, 360);
        assert!((snapshot.fraction - 0.4).abs() < 1e-9);
        assert_eq!(snapshot.minutes_remaining, 6);
    }

    #[test]
    fn identity_change_recomputes_total() {
        let mut state = active(10);

        assert!(!state.retarget(estimate_at("3120", t0() + TimeDelta::minutes(10))));
        assert_eq!(state.total, TimeDelta::minutes(10));

        assert!(state.retarget(estimate_at("3120", t0() + TimeDelta::minutes(12))));
        assert_eq!(state.total, TimeDelta::minutes(12));
    }

    #[test]
    fn total_never_below_one_second() {
        let state = active(-2);
        assert_eq!(state.total, TimeDelta::seconds(1));
        assert!(state.is_due(t0()));
    }

    #[test]
    fn stop_is_terminal_and_idempotent() {
        let mut state = active(10);
        let now = t0() + TimeDelta::minutes(3);

        assert!(state.stop(StopReason::Cancelled, now));
        assert!(!state.stop(StopReason::Arrived, now));

        let session = state.session.as_ref().unwrap();
        assert_eq!(session.state, SessionState::Stopped);
        assert_eq!(session.stop_reason, Some(StopReason::Cancelled));
        assert!(!state.is_due(t0() + TimeDelta::hours(1)));

        // Elapsed freezes at the moment of stopping.
        assert_eq!(state.elapsed(t0() + TimeDelta::minutes(8)), TimeDelta::minutes(3));
    }
}
