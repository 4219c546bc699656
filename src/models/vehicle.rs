use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::VehicleId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePosition {
    pub vehicle_id: VehicleId,
    pub latitude: f64,
    pub longitude: f64,
    pub observed_at: DateTime<Utc>,
}
