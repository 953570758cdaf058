use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::record::{ClientLockState, LockTable};
use crate::{
    config::BackoffConfig,
    interface::release::ReleaseHook,
    protocol::{rpc::LockServerRpc, ClientId, LockId},
    util::{
        retry::{with_backoff, Backoff},
        runnable::QueueRunnable,
    },
};

/// Hands revoked locks back to the server once no local task holds them.
pub(crate) struct LockReleaser {
    pub(crate) client: ClientId,
    pub(crate) server: Arc<dyn LockServerRpc>,
    pub(crate) locks: Arc<LockTable>,
    pub(crate) release_hook: Arc<dyn ReleaseHook>,
    pub(crate) backoff: BackoffConfig,
}

#[async_trait]
impl QueueRunnable for LockReleaser {
    type Item = LockId;

    async fn run_once(&self, lock: LockId) {
        let record = match self.locks.get(lock) {
            Some(record) => record,
            None => return,
        };
        let version = {
            let state = record.state();
            if state.state != ClientLockState::Releasing {
                debug!(client = %self.client, lock, state = ?state.state, "nothing to release");
                return;
            }
            state.version
        };

        self.release_hook.on_release(lock).await;

        // The server ignores releases from a client it does not consider the
        // owner, so repeating this is harmless.
        let sent = with_backoff(Backoff::forever("release", &self.backoff), || {
            self.server.release(&self.client, lock, version)
        })
        .await;
        if let Err(e) = sent {
            warn!(client = %self.client, lock, version, error = %e, "giving up on release");
            return;
        }

        let mut state = record.state();
        state.state = ClientLockState::None;
        state.pending_revoke = false;
        record.released.notify_waiters();
        info!(client = %self.client, lock, version, "lock returned to server");
    }
}
