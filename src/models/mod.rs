pub mod arrival;
pub mod ids;
pub mod session;
pub mod vehicle;

pub use arrival::{ArrivalEstimate, ArrivalIdentity, ArrivalStatus};
pub use ids::{RouteId, StopId, VehicleId};
pub use session::{SessionState, StopReason, TrackingSession};
pub use vehicle::VehiclePosition;
