//! Local alerts for a tracked arrival.
//!
//! The engine only decides *when* an alert should fire; delivering it is the
//! job of a [`NotificationSink`]. [`TimerNotificationSink`] is an in-process
//! sink that fires on tokio timers.

pub mod coordinator;
mod dispatcher;
pub mod timer_sink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::ArrivalIdentity;

pub use coordinator::NotificationCoordinator;
pub use timer_sink::{DeliveredNotification, TimerNotificationSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    ThreeMinutesOut,
    ArrivalImminent,
}

impl NotificationKind {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            NotificationKind::ThreeMinutesOut => "three_min",
            NotificationKind::ArrivalImminent => "arrival",
        }
    }
}

/// Stable identifier for one alert: the same kind for the same arrival always
/// maps to the same key, so sinks can replace or cancel it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationKey {
    pub kind: NotificationKind,
    pub identity: ArrivalIdentity,
}

impl NotificationKey {
    pub fn new(kind: NotificationKind, identity: ArrivalIdentity) -> Self {
        Self { kind, identity }
    }
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.key_prefix(), self.identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
}

impl NotificationPayload {
    pub fn for_kind(kind: NotificationKind, route: &str, stop: &str) -> Self {
        match kind {
            NotificationKind::ThreeMinutesOut => Self {
                title: "Ride arriving soon!".into(),
                body: format!("Route {route} will arrive at {stop} in 3 minutes"),
            },
            NotificationKind::ArrivalImminent => Self {
                title: "Your ride has arrived!".into(),
                body: format!("Route {route} has arrived at {stop}"),
            },
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notifications are not authorized")]
    PermissionDenied,
    #[error("failed to schedule notification: {0}")]
    SchedulingFailure(String),
}

/// Where alerts go. Calls are fire-and-forget from the engine's side: a
/// returned error is logged and never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn schedule(
        &self,
        key: &NotificationKey,
        fire_at: DateTime<Utc>,
        payload: &NotificationPayload,
    ) -> Result<(), NotificationError>;

    /// Cancels every listed key in one request.
    async fn cancel(&self, keys: &[NotificationKey]) -> Result<(), NotificationError>;
}

pub trait PermissionGate: Send + Sync {
    fn is_notification_granted(&self) -> bool;
}

/// For hosts without an authorization prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

impl PermissionGate for AlwaysGranted {
    fn is_notification_granted(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn keys_render_with_kind_prefix() {
        let identity = ArrivalIdentity {
            route_id: "12".into(),
            vehicle_id: "3120".into(),
            effective_time: Utc.timestamp_opt(1_751_875_200, 0).unwrap(),
        };

        let three = NotificationKey::new(NotificationKind::ThreeMinutesOut, identity.clone());
        let arrival = NotificationKey::new(NotificationKind::ArrivalImminent, identity);

        assert_eq!(three.to_string(), "three_min_12_3120_1751875200");
        assert_eq!(arrival.to_string(), "arrival_12_3120_1751875200");
    }

    #[test]
    fn payload_text_names_route_and_stop() {
        let payload = NotificationPayload::for_kind(
            NotificationKind::ThreeMinutesOut,
            "12",
            "SW Barbur & Capitol",
        );
        assert_eq!(payload.title, "Ride arriving soon!");
        assert_eq!(
            payload.body,
            "Route 12 will arrive at SW Barbur & Capitol in 3 minutes"
        );
    }
}
