use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::feeds::{FeedError, VehiclePositionFeed};
use crate::models::{RouteId, StopId, VehicleId, VehiclePosition};

use super::loop_worker::{spawn_refresh_loop, Publisher, RefreshState};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// The tracked vehicle's breadcrumb trail. `path` only ever grows while a
/// session runs; windowing it is the display's business.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleTrack {
    pub current_position: Option<VehiclePosition>,
    pub path: Vec<VehiclePosition>,
    pub is_refreshing: bool,
    pub last_error: Option<FeedError>,
}

impl RefreshState for VehicleTrack {
    fn set_refreshing(&mut self, refreshing: bool) {
        self.is_refreshing = refreshing;
    }
}

struct TrackRun {
    fetcher: PositionFetcher,
    handle: JoinHandle<()>,
}

pub struct VehicleTracker {
    feed: Arc<dyn VehiclePositionFeed>,
    fetch_timeout: Duration,
    publisher: Arc<Publisher<VehicleTrack>>,
    run: Mutex<Option<TrackRun>>,
}

impl VehicleTracker {
    pub fn new(feed: Arc<dyn VehiclePositionFeed>, fetch_timeout: Duration) -> Self {
        Self {
            feed,
            fetch_timeout,
            publisher: Arc::new(Publisher::new(VehicleTrack::default())),
            run: Mutex::new(None),
        }
    }

    pub fn start(
        &self,
        stop_id: StopId,
        route_id: RouteId,
        vehicle_id: VehicleId,
        interval: Duration,
    ) -> Result<()> {
        let mut run = self.lock_run();
        if run.is_some() {
            bail!("vehicle tracking already active");
        }

        log_info!(
            "Tracking vehicle {vehicle_id} (route {route_id} toward stop {stop_id}) every {interval:?}"
        );

        self.publisher.open();
        let fetcher = PositionFetcher {
            feed: self.feed.clone(),
            publisher: self.publisher.clone(),
            cancel_token: CancellationToken::new(),
            vehicle_id,
            timeout: self.fetch_timeout,
        };

        let tick_fetcher = fetcher.clone();
        let handle = spawn_refresh_loop(interval, fetcher.cancel_token.clone(), move || {
            tick_fetcher.spawn_fetch();
        });

        *run = Some(TrackRun { fetcher, handle });
        Ok(())
    }

    /// Same guarantee as the arrival poller: nothing is appended after this
    /// returns.
    pub fn stop(&self) {
        let Some(run) = self.lock_run().take() else {
            return;
        };

        self.publisher.close();
        run.fetcher.cancel_token.cancel();
        run.handle.abort();
        log_info!("Stopped tracking vehicle {}", run.fetcher.vehicle_id);
    }

    pub fn is_running(&self) -> bool {
        self.lock_run().is_some()
    }

    pub fn track(&self) -> VehicleTrack {
        self.publisher.snapshot()
    }

    pub fn current_position(&self) -> Option<VehiclePosition> {
        self.publisher.snapshot().current_position
    }

    pub fn path(&self) -> Vec<VehiclePosition> {
        self.publisher.snapshot().path
    }

    pub fn subscribe(&self) -> watch::Receiver<VehicleTrack> {
        self.publisher.subscribe()
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<TrackRun>> {
        match self.run.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for VehicleTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct PositionFetcher {
    feed: Arc<dyn VehiclePositionFeed>,
    publisher: Arc<Publisher<VehicleTrack>>,
    cancel_token: CancellationToken,
    vehicle_id: VehicleId,
    timeout: Duration,
}

impl PositionFetcher {
    fn spawn_fetch(&self) {
        let Some(ticket) = self.publisher.begin() else {
            return;
        };
        let fetcher = self.clone();

        tokio::spawn(async move {
            let vehicle_id = &fetcher.vehicle_id;
            let outcome = tokio::select! {
                biased;
                _ = fetcher.cancel_token.cancelled() => return,
                result = time::timeout(fetcher.timeout, fetcher.feed.fetch(vehicle_id)) => {
                    result.unwrap_or(Err(FeedError::Timeout(fetcher.timeout.as_secs())))
                }
            };

            fetcher.publisher.finish(ticket, |track, fresh| {
                if !fresh {
                    // Appending an older fix after a newer one would zig-zag the path.
                    log_debug!("Discarding superseded position for vehicle {vehicle_id}");
                    return;
                }
                match outcome {
                    Ok(position) => {
                        track.current_position = Some(position.clone());
                        track.path.push(position);
                        track.last_error = None;
                    }
                    Err(err) => {
                        log_warn!("Position fetch failed for vehicle {vehicle_id}: {err}");
                        track.last_error = Some(err);
                    }
                }
            });
        });
    }
}
