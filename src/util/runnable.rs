use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::stopped;

/// Drains `queue` one item at a time until the queue closes or `shutdown` fires.
pub(crate) async fn run_queue<T: QueueRunnable>(
    runnable: Arc<T>,
    mut queue: mpsc::UnboundedReceiver<T::Item>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let mut shutdown_signal = false;
        tokio::select! {
            _ = stopped(&mut shutdown) => { shutdown_signal = true }
            _ = runnable.run_once(item) => {}
        }

        if shutdown_signal {
            break;
        }
    }

    runnable.before_shutdown_complete().await;
}

#[async_trait]
pub(crate) trait QueueRunnable: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Handles a single queued item.
    async fn run_once(&self, item: Self::Item);

    async fn before_shutdown_complete(&self) {}
}
