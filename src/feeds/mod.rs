//! Request/response seams to the transit backend.
//!
//! The engine never talks HTTP itself; it only sees these traits. `http`
//! provides the implementation used against the TriLive backend.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ArrivalEstimate, RouteId, StopId, VehicleId, VehiclePosition};

pub use http::HttpTransitClient;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// The stop has no live-data provider. Callers treat this as "no arrivals".
    #[error("no live data for this stop")]
    NotFound,
    #[error("transient feed failure: {0}")]
    Transient(String),
    #[error("feed request timed out after {0}s")]
    Timeout(u64),
}

impl FeedError {
    pub fn transient(reason: impl std::fmt::Display) -> Self {
        FeedError::Transient(reason.to_string())
    }
}

#[async_trait]
pub trait ArrivalFeed: Send + Sync {
    async fn fetch(
        &self,
        stop_id: &StopId,
        route_filter: Option<&RouteId>,
    ) -> Result<Vec<ArrivalEstimate>, FeedError>;
}

#[async_trait]
pub trait VehiclePositionFeed: Send + Sync {
    async fn fetch(&self, vehicle_id: &VehicleId) -> Result<VehiclePosition, FeedError>;
}
