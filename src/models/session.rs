use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RouteId, StopId, VehicleId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Active,
    Stopped,
}

/// Why a session ended. Only the controller decides `Arrived`; the others come
/// from the rider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Cancelled,
    NavigatedAway,
    Arrived,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Cancelled => "Cancelled",
            StopReason::NavigatedAway => "NavigatedAway",
            StopReason::Arrived => "Arrived",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSession {
    pub id: String,
    pub stop_id: StopId,
    pub stop_name: Option<String>,
    pub route_id: RouteId,
    pub vehicle_id: VehicleId,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub state: SessionState,
    pub stop_reason: Option<StopReason>,
}

impl TrackingSession {
    pub fn display_stop(&self) -> &str {
        self.stop_name
            .as_deref()
            .unwrap_or_else(|| self.stop_id.as_str())
    }
}
