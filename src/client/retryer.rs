use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{record::LockTable, requeue_when_answered};
use crate::{protocol::Notification, util::runnable::QueueRunnable};

/// Wakes the task parked on a lock's retry point, once the acquire the retry
/// answers has returned.
pub(crate) struct RetryHandler {
    pub(crate) locks: Arc<LockTable>,
    pub(crate) requeue: mpsc::UnboundedSender<Notification>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

#[async_trait]
impl QueueRunnable for RetryHandler {
    type Item = Notification;

    async fn run_once(&self, notification: Notification) {
        let record = match self.locks.get(notification.lock) {
            Some(record) => record,
            None => {
                debug!(lock = notification.lock, "retry for a lock never requested");
                return;
            }
        };

        let state = record.state();
        if notification.is_deliverable(state.version) {
            debug!(
                lock = notification.lock,
                version = notification.version,
                "waking acquirer"
            );
            record.retry.notify_waiters();
        } else {
            debug!(
                lock = notification.lock,
                version = notification.version,
                outgoing = state.version,
                "retry overtook its acquire reply, deferring"
            );
            requeue_when_answered(
                record.clone(),
                notification,
                self.requeue.clone(),
                self.shutdown.clone(),
            );
        }
    }
}
