//! Live tracking engine for a single committed transit arrival.
//!
//! A rider picks an arrival at a stop; a [`TrackingSessionController`] then
//! keeps the arrival board and the vehicle's position fresh, drives a progress
//! bar toward the arrival, and schedules two local alerts: one three minutes
//! out and one on arrival. [`TrackingManager`] layers the tap-twice
//! confirmation and the one-session-at-a-time rule on top.

pub mod clock;
pub mod feeds;
pub mod models;
pub mod notifications;
pub mod polling;
pub mod settings;
pub mod tracking;
pub mod utils;

#[cfg(test)]
mod testing;

pub use clock::{Clock, RuntimeClock, SystemClock};
pub use feeds::{ArrivalFeed, FeedError, HttpTransitClient, VehiclePositionFeed};
pub use models::{
    ArrivalEstimate, ArrivalIdentity, ArrivalStatus, RouteId, StopId, StopReason,
    TrackingSession, VehicleId, VehiclePosition,
};
pub use notifications::{
    AlwaysGranted, NotificationKind, NotificationSink, PermissionGate, TimerNotificationSink,
};
pub use settings::EngineConfig;
pub use tracking::{
    ConfirmOutcome, ProgressSnapshot, TrackingManager, TrackingServices,
    TrackingSessionController, TrackingStatus,
};
pub use utils::init_logging;
