pub mod controller;
pub mod manager;
pub mod state;

pub use controller::{TrackingServices, TrackingSessionController};
pub use manager::{ConfirmOutcome, TrackingManager};
pub use state::{ProgressSnapshot, TrackingState, TrackingStatus};
