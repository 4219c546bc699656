use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;

use super::{NotificationError, NotificationKey, NotificationPayload, NotificationSink};

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredNotification {
    pub key: NotificationKey,
    pub payload: NotificationPayload,
    pub fired_at: DateTime<Utc>,
}

/// In-process sink: each key becomes a tokio task that sleeps until its fire
/// time, logs the alert and hands it to the receiver returned by [`new`].
///
/// Scheduling a key that is already pending replaces it; timers that already
/// fired are dropped on the next schedule.
///
/// [`new`]: TimerNotificationSink::new
pub struct TimerNotificationSink {
    clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<NotificationKey, JoinHandle<()>>>,
    delivered: mpsc::UnboundedSender<DeliveredNotification>,
}

impl TimerNotificationSink {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<DeliveredNotification>) {
        let (delivered, rx) = mpsc::unbounded_channel();
        let sink = Self {
            clock,
            pending: Mutex::new(HashMap::new()),
            delivered,
        };
        (sink, rx)
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NotificationKey, JoinHandle<()>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl NotificationSink for TimerNotificationSink {
    async fn schedule(
        &self,
        key: &NotificationKey,
        fire_at: DateTime<Utc>,
        payload: &NotificationPayload,
    ) -> Result<(), NotificationError> {
        let delay = (fire_at - self.clock.now()).to_std().unwrap_or_default();
        let clock = self.clock.clone();
        let delivered = self.delivered.clone();
        let notification_key = key.clone();
        let payload = payload.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Notification {}: {} - {}", notification_key, payload.title, payload.body);
            let _ = delivered.send(DeliveredNotification {
                key: notification_key,
                payload,
                fired_at: clock.now(),
            });
        });

        let mut pending = self.lock();
        pending.retain(|_, timer| !timer.is_finished());
        if let Some(previous) = pending.insert(key.clone(), handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn cancel(&self, keys: &[NotificationKey]) -> Result<(), NotificationError> {
        let mut pending = self.lock();
        for key in keys {
            if let Some(handle) = pending.remove(key) {
                handle.abort();
            }
        }
        Ok(())
    }
}

impl Drop for TimerNotificationSink {
    fn drop(&mut self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }
}
