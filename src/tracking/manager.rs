use anyhow::Result;
use log::info;
use tokio::sync::Mutex;

use crate::models::{ArrivalEstimate, ArrivalIdentity, StopReason};
use crate::settings::EngineConfig;

use super::{TrackingServices, TrackingSessionController, TrackingStatus};

/// Result of a rider tapping an arrival.
pub enum ConfirmOutcome {
    /// First tap: the arrival is highlighted and waits for a second tap.
    Highlighted(ArrivalIdentity),
    /// Second tap on the highlighted arrival: a session is running.
    Started(TrackingSessionController),
}

#[derive(Default)]
struct ManagerState {
    highlighted: Option<ArrivalIdentity>,
    active: Option<TrackingSessionController>,
}

/// Owns the process-wide "at most one tracking session" rule and the
/// two-step confirmation that precedes a session.
pub struct TrackingManager {
    services: TrackingServices,
    config: EngineConfig,
    state: Mutex<ManagerState>,
}

impl TrackingManager {
    pub fn new(services: TrackingServices, config: EngineConfig) -> Self {
        Self {
            services,
            config: config.normalized(),
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Tapping a different arrival moves the highlight; tapping the
    /// highlighted one again commits to it.
    pub async fn confirm(
        &self,
        estimate: &ArrivalEstimate,
        stop_name: Option<String>,
    ) -> Result<ConfirmOutcome> {
        let identity = estimate.identity();
        let mut state = self.state.lock().await;

        if state.highlighted.as_ref() != Some(&identity) {
            state.highlighted = Some(identity.clone());
            return Ok(ConfirmOutcome::Highlighted(identity));
        }

        state.highlighted = None;
        let controller = self
            .replace_active(&mut state, estimate.clone(), stop_name)
            .await?;
        Ok(ConfirmOutcome::Started(controller))
    }

    /// Starts tracking without the confirmation step. Any running session is
    /// stopped first.
    pub async fn start_tracking(
        &self,
        estimate: ArrivalEstimate,
        stop_name: Option<String>,
    ) -> Result<TrackingSessionController> {
        let mut state = self.state.lock().await;
        state.highlighted = None;
        self.replace_active(&mut state, estimate, stop_name).await
    }

    pub async fn stop(&self) -> Result<()> {
        let active = self.state.lock().await.active.take();
        match active {
            Some(controller) => controller.stop().await,
            None => Ok(()),
        }
    }

    /// The rider left the arrivals screen: the highlight expires and any
    /// session stops.
    pub async fn leave_screen(&self) -> Result<()> {
        let active = {
            let mut state = self.state.lock().await;
            state.highlighted = None;
            state.active.take()
        };
        match active {
            Some(controller) => controller.stop_with(StopReason::NavigatedAway).await,
            None => Ok(()),
        }
    }

    /// The running session, if any. Sessions that ended on their own are not
    /// returned.
    pub async fn active(&self) -> Option<TrackingSessionController> {
        self.state
            .lock()
            .await
            .active
            .clone()
            .filter(|controller| controller.status() == TrackingStatus::Active)
    }

    pub async fn highlighted(&self) -> Option<ArrivalIdentity> {
        self.state.lock().await.highlighted.clone()
    }

    async fn replace_active(
        &self,
        state: &mut ManagerState,
        estimate: ArrivalEstimate,
        stop_name: Option<String>,
    ) -> Result<TrackingSessionController> {
        if let Some(previous) = state.active.take() {
            if previous.status() == TrackingStatus::Active {
                info!("Replacing the running tracking session");
            }
            previous.stop().await?;
        }

        let controller = TrackingSessionController::new(self.services.clone(), self.config.clone());
        controller.start(estimate, stop_name)?;
        state.active = Some(controller.clone());
        Ok(controller)
    }
}
