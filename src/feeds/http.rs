use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::clock::{Clock, SystemClock};
use crate::models::{ArrivalEstimate, ArrivalStatus, RouteId, StopId, VehicleId, VehiclePosition};

use super::{ArrivalFeed, FeedError, VehiclePositionFeed};

/// Client for the TriLive backend's live endpoints.
///
/// * `GET {base}/stations/{stop}/arrivals`, 404 when the stop has no live
///   provider.
/// * `GET {base}/vehicles/{vehicle}`, newest fix last.
#[derive(Clone)]
pub struct HttpTransitClient {
    client: reqwest::Client,
    base_url: String,
    clock: Arc<dyn Clock>,
}

impl HttpTransitClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, FeedError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FeedError::transient)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FeedError::NotFound);
        }
        if !status.is_success() {
            return Err(FeedError::Transient(format!("HTTP {status} from {url}")));
        }

        response.json().await.map_err(FeedError::transient)
    }
}

#[async_trait]
impl ArrivalFeed for HttpTransitClient {
    async fn fetch(
        &self,
        stop_id: &StopId,
        route_filter: Option<&RouteId>,
    ) -> Result<Vec<ArrivalEstimate>, FeedError> {
        let url = format!("{}/stations/{}/arrivals", self.base_url, stop_id);
        let body = self.get_json(&url).await?;
        parse_arrivals(body, stop_id, route_filter)
    }
}

#[async_trait]
impl VehiclePositionFeed for HttpTransitClient {
    async fn fetch(&self, vehicle_id: &VehicleId) -> Result<VehiclePosition, FeedError> {
        let url = format!("{}/vehicles/{}", self.base_url, vehicle_id);
        let body = self.get_json(&url).await?;
        parse_vehicle_fixes(body, vehicle_id, self.clock.now())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(u64),
    Text(String),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Number(value) => value.to_string(),
            WireId::Text(value) => value,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireArrival {
    route: WireId,
    scheduled: i64,
    estimated: Option<i64>,
    vehicle: Option<WireId>,
    route_name: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireVehicleFix {
    lat: f64,
    lng: f64,
    time: Option<i64>,
}

fn parse_status(raw: Option<&str>, has_estimate: bool) -> ArrivalStatus {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("delayed") => ArrivalStatus::Delayed,
        Some("canceled") | Some("cancelled") => ArrivalStatus::Canceled,
        Some("estimated") => ArrivalStatus::Estimated,
        Some("scheduled") => ArrivalStatus::Scheduled,
        _ if has_estimate => ArrivalStatus::Estimated,
        _ => ArrivalStatus::Scheduled,
    }
}

fn parse_arrivals(
    body: serde_json::Value,
    stop_id: &StopId,
    route_filter: Option<&RouteId>,
) -> Result<Vec<ArrivalEstimate>, FeedError> {
    let wire: Vec<WireArrival> = serde_json::from_value(body)
        .map_err(|err| FeedError::Transient(format!("malformed arrivals payload: {err}")))?;

    let mut arrivals = Vec::with_capacity(wire.len());
    for entry in wire {
        let route_id = RouteId::from(entry.route.into_string());
        if route_filter.is_some_and(|wanted| *wanted != route_id) {
            continue;
        }

        let Some(vehicle) = entry.vehicle else {
            debug!("Skipping untrackable arrival on route {route_id}: no vehicle");
            continue;
        };

        let Some(scheduled_time) = DateTime::<Utc>::from_timestamp_millis(entry.scheduled) else {
            return Err(FeedError::Transient(format!(
                "scheduled time {} out of range",
                entry.scheduled
            )));
        };
        let estimated_time = entry.estimated.and_then(DateTime::<Utc>::from_timestamp_millis);

        arrivals.push(ArrivalEstimate {
            route_id,
            stop_id: stop_id.clone(),
            vehicle_id: VehicleId::from(vehicle.into_string()),
            scheduled_time,
            estimated_time,
            status: parse_status(entry.status.as_deref(), estimated_time.is_some()),
            route_name: entry.route_name,
        });
    }

    Ok(arrivals)
}

fn parse_vehicle_fixes(
    body: serde_json::Value,
    vehicle_id: &VehicleId,
    now: DateTime<Utc>,
) -> Result<VehiclePosition, FeedError> {
    let mut fixes: Vec<WireVehicleFix> = serde_json::from_value(body)
        .map_err(|err| FeedError::Transient(format!("malformed vehicle payload: {err}")))?;

    let last = fixes
        .pop()
        .ok_or_else(|| FeedError::Transient(format!("no position reported for vehicle {vehicle_id}")))?;

    Ok(VehiclePosition {
        vehicle_id: vehicle_id.clone(),
        latitude: last.lat,
        longitude: last.lng,
        observed_at: last
            .time
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(now),
    })
}
