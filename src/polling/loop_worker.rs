use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Published state that exposes an "a fetch is in flight" flag.
pub(crate) trait RefreshState: Clone + Send + Sync + 'static {
    fn set_refreshing(&mut self, refreshing: bool);
}

/// Handed out when a fetch starts; redeemed when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket {
    run: u64,
    seq: u64,
}

#[derive(Debug, Default)]
struct Gate {
    open: bool,
    run: u64,
    next_seq: u64,
    applied_seq: u64,
    in_flight: usize,
}

/// Single writer for a poller's published state.
///
/// Every write goes through the gate mutex, so once `close` returns no
/// in-flight fetch can publish anything. Results are applied in start order:
/// a fetch that finishes after a later-started one is reported as stale.
pub(crate) struct Publisher<T: RefreshState> {
    tx: watch::Sender<T>,
    gate: Mutex<Gate>,
}

impl<T: RefreshState> Publisher<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            gate: Mutex::new(Gate::default()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Starts a new run. Tickets from earlier runs are dead from here on.
    pub fn open(&self) {
        let mut gate = self.lock();
        gate.open = true;
        gate.run = gate.run.wrapping_add(1);
        gate.in_flight = 0;
    }

    /// Ends the run. Fetches still in flight will never land, so the
    /// published state stops reporting a refresh.
    pub fn close(&self) {
        let mut gate = self.lock();
        gate.open = false;
        gate.in_flight = 0;
        self.tx.send_modify(|state| state.set_refreshing(false));
    }

    pub fn begin(&self) -> Option<Ticket> {
        let mut gate = self.lock();
        if !gate.open {
            return None;
        }

        gate.next_seq += 1;
        gate.in_flight += 1;
        let ticket = Ticket {
            run: gate.run,
            seq: gate.next_seq,
        };

        self.tx.send_modify(|state| state.set_refreshing(true));
        Some(ticket)
    }

    /// Applies a completed fetch. `apply` receives `true` when the result is
    /// the newest one seen so far. Returns `false` when the run is over and
    /// nothing was written.
    pub fn finish(&self, ticket: Ticket, apply: impl FnOnce(&mut T, bool)) -> bool {
        let mut gate = self.lock();
        if !gate.open || gate.run != ticket.run {
            return false;
        }

        gate.in_flight = gate.in_flight.saturating_sub(1);
        let fresh = ticket.seq > gate.applied_seq;
        if fresh {
            gate.applied_seq = ticket.seq;
        }
        let still_refreshing = gate.in_flight > 0;

        self.tx.send_modify(|state| {
            apply(state, fresh);
            state.set_refreshing(still_refreshing);
        });
        true
    }

    /// Gate state is plain counters, so a panic mid-update leaves nothing
    /// half-written worth refusing.
    fn lock(&self) -> MutexGuard<'_, Gate> {
        match self.gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Calls `tick` immediately, then every `interval`, until `cancel_token` fires.
/// `tick` must not block; it is expected to spawn the actual fetch.
pub(crate) fn spawn_refresh_loop<F>(
    interval: Duration,
    cancel_token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => tick(),
            }
        }
    })
}
