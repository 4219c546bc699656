use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{RouteId, StopId, VehicleId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ArrivalStatus {
    #[default]
    Scheduled,
    Estimated,
    Delayed,
    Canceled,
}

impl ArrivalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArrivalStatus::Scheduled => "scheduled",
            ArrivalStatus::Estimated => "estimated",
            ArrivalStatus::Delayed => "delayed",
            ArrivalStatus::Canceled => "canceled",
        }
    }
}

/// One predicted arrival of a vehicle at a stop.
///
/// Values are never mutated after they are received; every poll produces a
/// fresh list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalEstimate {
    pub route_id: RouteId,
    pub stop_id: StopId,
    pub vehicle_id: VehicleId,
    pub scheduled_time: DateTime<Utc>,
    pub estimated_time: Option<DateTime<Utc>>,
    pub status: ArrivalStatus,
    pub route_name: Option<String>,
}

impl ArrivalEstimate {
    pub fn new(
        route_id: impl Into<RouteId>,
        stop_id: impl Into<StopId>,
        vehicle_id: impl Into<VehicleId>,
        scheduled_time: DateTime<Utc>,
        estimated_time: Option<DateTime<Utc>>,
    ) -> Self {
        let status = if estimated_time.is_some() {
            ArrivalStatus::Estimated
        } else {
            ArrivalStatus::Scheduled
        };

        Self {
            route_id: route_id.into(),
            stop_id: stop_id.into(),
            vehicle_id: vehicle_id.into(),
            scheduled_time,
            estimated_time,
            status,
            route_name: None,
        }
    }

    pub fn with_route_name(mut self, name: impl Into<String>) -> Self {
        self.route_name = Some(name.into());
        self
    }

    /// The live estimate when the feed has one, otherwise the timetable.
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.estimated_time.unwrap_or(self.scheduled_time)
    }

    pub fn identity(&self) -> ArrivalIdentity {
        ArrivalIdentity {
            route_id: self.route_id.clone(),
            vehicle_id: self.vehicle_id.clone(),
            effective_time: self.effective_time(),
        }
    }

    /// Whole minutes until the effective time, floored at zero.
    pub fn minutes_until(&self, now: DateTime<Utc>) -> i64 {
        (self.effective_time() - now).num_minutes().max(0)
    }

    pub fn display_route(&self) -> &str {
        self.route_name
            .as_deref()
            .unwrap_or_else(|| self.route_id.as_str())
    }
}

/// What makes two estimates "the same arrival" for alert dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalIdentity {
    pub route_id: RouteId,
    pub vehicle_id: VehicleId,
    pub effective_time: DateTime<Utc>,
}

impl fmt::Display for ArrivalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.route_id,
            self.vehicle_id,
            self.effective_time.timestamp()
        )
    }
}
