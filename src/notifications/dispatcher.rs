use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::{NotificationKey, NotificationPayload, NotificationSink};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

enum SinkCommand {
    Schedule {
        key: NotificationKey,
        fire_at: DateTime<Utc>,
        payload: NotificationPayload,
    },
    Cancel(Vec<NotificationKey>),
}

/// Forwards sink calls to a background task, one at a time, in the order
/// they were issued. Callers never wait on the sink.
///
/// Dropping the dispatcher lets the worker drain what is already queued and
/// exit.
pub(crate) struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl NotificationDispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(sink, rx));
        Self { tx }
    }

    pub fn schedule(&self, key: NotificationKey, fire_at: DateTime<Utc>, payload: NotificationPayload) {
        self.send(SinkCommand::Schedule {
            key,
            fire_at,
            payload,
        });
    }

    pub fn cancel(&self, keys: Vec<NotificationKey>) {
        if keys.is_empty() {
            return;
        }
        self.send(SinkCommand::Cancel(keys));
    }

    fn send(&self, command: SinkCommand) {
        if self.tx.send(command).is_err() {
            log_warn!("notification dispatcher is gone; dropping sink call");
        }
    }
}

async fn dispatch_loop(sink: Arc<dyn NotificationSink>, mut rx: mpsc::UnboundedReceiver<SinkCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            SinkCommand::Schedule {
                key,
                fire_at,
                payload,
            } => match sink.schedule(&key, fire_at, &payload).await {
                Ok(()) => log_debug!("scheduled {key} for {fire_at}"),
                Err(err) => log_warn!("could not schedule {key}: {err}"),
            },
            SinkCommand::Cancel(keys) => {
                if let Err(err) = sink.cancel(&keys).await {
                    log_warn!("could not cancel {} notification(s): {err}", keys.len());
                }
            }
        }
    }
}
