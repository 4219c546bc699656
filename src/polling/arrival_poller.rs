use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::feeds::{ArrivalFeed, FeedError};
use crate::models::{ArrivalEstimate, RouteId, StopId};

use super::loop_worker::{spawn_refresh_loop, Publisher, RefreshState};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// What the poller publishes after every completed fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrivalBoard {
    pub estimates: Vec<ArrivalEstimate>,
    pub is_refreshing: bool,
    /// Set by the most recent fetch when it failed. The estimates from the
    /// last good fetch stay in place alongside it.
    pub last_error: Option<FeedError>,
    /// Number of fetch results applied so far.
    pub revision: u64,
}

impl RefreshState for ArrivalBoard {
    fn set_refreshing(&mut self, refreshing: bool) {
        self.is_refreshing = refreshing;
    }
}

#[derive(Debug, Clone)]
struct PollTarget {
    stop_id: StopId,
    route_id: RouteId,
}

struct PollRun {
    fetcher: ArrivalFetcher,
    handle: JoinHandle<()>,
}

/// Keeps a stop's arrival board fresh while a session is active.
pub struct ArrivalPoller {
    feed: Arc<dyn ArrivalFeed>,
    fetch_timeout: Duration,
    publisher: Arc<Publisher<ArrivalBoard>>,
    run: Mutex<Option<PollRun>>,
}

impl ArrivalPoller {
    pub fn new(feed: Arc<dyn ArrivalFeed>, fetch_timeout: Duration) -> Self {
        Self {
            feed,
            fetch_timeout,
            publisher: Arc::new(Publisher::new(ArrivalBoard::default())),
            run: Mutex::new(None),
        }
    }

    /// Fetches right away, then every `interval`.
    pub fn start(&self, stop_id: StopId, route_id: RouteId, interval: Duration) -> Result<()> {
        let mut run = self.lock_run();
        if run.is_some() {
            bail!("arrival polling already active");
        }

        log_info!("Polling arrivals for stop {stop_id} route {route_id} every {interval:?}");

        self.publisher.open();
        let fetcher = ArrivalFetcher {
            feed: self.feed.clone(),
            publisher: self.publisher.clone(),
            cancel_token: CancellationToken::new(),
            target: PollTarget { stop_id, route_id },
            timeout: self.fetch_timeout,
        };

        let tick_fetcher = fetcher.clone();
        let handle = spawn_refresh_loop(interval, fetcher.cancel_token.clone(), move || {
            tick_fetcher.spawn_fetch();
        });

        *run = Some(PollRun { fetcher, handle });
        Ok(())
    }

    /// Out-of-band refresh (pull to refresh). Ignored when not running.
    pub fn refresh_now(&self) {
        if let Some(run) = self.lock_run().as_ref() {
            run.fetcher.spawn_fetch();
        }
    }

    /// Halts polling. Once this returns the board no longer changes, even if
    /// a fetch that is already on the wire completes later.
    pub fn stop(&self) {
        let Some(run) = self.lock_run().take() else {
            return;
        };

        self.publisher.close();
        run.fetcher.cancel_token.cancel();
        run.handle.abort();
        log_info!(
            "Stopped arrival polling for stop {} route {}",
            run.fetcher.target.stop_id,
            run.fetcher.target.route_id
        );
    }

    pub fn is_running(&self) -> bool {
        self.lock_run().is_some()
    }

    pub fn board(&self) -> ArrivalBoard {
        self.publisher.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ArrivalBoard> {
        self.publisher.subscribe()
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<PollRun>> {
        match self.run.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ArrivalPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct ArrivalFetcher {
    feed: Arc<dyn ArrivalFeed>,
    publisher: Arc<Publisher<ArrivalBoard>>,
    cancel_token: CancellationToken,
    target: PollTarget,
    timeout: Duration,
}

impl ArrivalFetcher {
    fn spawn_fetch(&self) {
        let Some(ticket) = self.publisher.begin() else {
            return;
        };
        let fetcher = self.clone();

        tokio::spawn(async move {
            let target = &fetcher.target;
            let request = fetcher.feed.fetch(&target.stop_id, Some(&target.route_id));

            let outcome = tokio::select! {
                biased;
                _ = fetcher.cancel_token.cancelled() => return,
                result = time::timeout(fetcher.timeout, request) => {
                    result.unwrap_or(Err(FeedError::Timeout(fetcher.timeout.as_secs())))
                }
            };

            let applied = fetcher.publisher.finish(ticket, |board, fresh| {
                if !fresh {
                    log_debug!("Discarding superseded arrival fetch for stop {}", target.stop_id);
                    return;
                }
                board.revision += 1;
                match outcome {
                    Ok(estimates) => {
                        log_debug!("Stop {}: {} arrival(s)", target.stop_id, estimates.len());
                        board.estimates = estimates;
                        board.last_error = None;
                    }
                    Err(FeedError::NotFound) => {
                        log_debug!("Stop {} has no live data", target.stop_id);
                        board.estimates.clear();
                        board.last_error = None;
                    }
                    Err(err) => {
                        log_warn!("Arrival fetch failed for stop {}: {err}", target.stop_id);
                        board.last_error = Some(err);
                    }
                }
            });

            if !applied {
                log_debug!("Arrival fetch for stop {} finished after stop", target.stop_id);
            }
        });
    }
}
