pub mod arrival_poller;
mod loop_worker;
pub mod vehicle_tracker;

pub use arrival_poller::{ArrivalBoard, ArrivalPoller};
pub use vehicle_tracker::{VehicleTrack, VehicleTracker};
