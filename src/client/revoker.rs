use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{
    record::{ClientLockState, LockTable},
    requeue_when_answered,
};
use crate::{
    protocol::{LockId, Notification},
    util::runnable::QueueRunnable,
};

/// Applies server revokes: an idle lock goes straight to the releaser, a held
/// one is marked so its holder's release sends it home.
pub(crate) struct RevokeHandler {
    pub(crate) locks: Arc<LockTable>,
    pub(crate) releases: mpsc::UnboundedSender<LockId>,
    pub(crate) requeue: mpsc::UnboundedSender<Notification>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

#[async_trait]
impl QueueRunnable for RevokeHandler {
    type Item = Notification;

    async fn run_once(&self, notification: Notification) {
        let lock = notification.lock;
        let record = match self.locks.get(lock) {
            Some(record) => record,
            None => {
                debug!(lock, "revoke for a lock never requested");
                return;
            }
        };

        let mut state = record.state();
        if !notification.is_deliverable(state.version) {
            debug!(
                lock,
                version = notification.version,
                outgoing = state.version,
                "revoke overtook its acquire reply, deferring"
            );
            requeue_when_answered(
                record.clone(),
                notification,
                self.requeue.clone(),
                self.shutdown.clone(),
            );
            return;
        }

        match state.state {
            ClientLockState::Free => {
                debug!(lock, "idle lock revoked, releasing now");
                state.state = ClientLockState::Releasing;
                if self.releases.send(lock).is_err() {
                    warn!(lock, "releaser is gone, lock stays with this client");
                }
            }
            ClientLockState::Locked => {
                debug!(lock, holder = ?state.holder, "held lock revoked, release on unlock");
                state.pending_revoke = true;
            }
            ClientLockState::Releasing => {
                debug!(
                    lock,
                    version = notification.version,
                    "lock already on its way back, dropping revoke"
                );
            }
            // In None or Acquiring the server may still count this process as the
            // owner (a grant whose reply was lost). The server sends one revoke
            // per episode, so it is kept until the next grant is released.
            other => {
                debug!(lock, state = ?other, holder = ?state.holder, "revoke noted, release on unlock");
                state.pending_revoke = true;
            }
        }
    }
}
