//! Client side of the caching lock protocol.
//!
//! A process that has been granted a lock keeps it after the local holder
//! releases it, so other tasks in the same process can take it without talking
//! to the server. The server asks for it back with a revoke; the lock then goes
//! home as soon as no local task holds it.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ClientConfig,
    error::{LockError, RpcError},
    interface::release::ReleaseHook,
    protocol::{
        rpc::{LockCallbackRpc, LockServerRpc},
        ClientId, LockId, LockStatus, Notification, Version,
    },
    util::{runnable::run_queue, stopped, Shutdown},
};

use self::{
    record::{ClientLockRecord, LockTable},
    releaser::LockReleaser,
    retryer::RetryHandler,
    revoker::RevokeHandler,
};

mod record;
mod releaser;
mod retryer;
mod revoker;

pub use record::ClientLockState;

pub struct ClientLockCache {
    id: ClientId,
    server: Arc<dyn LockServerRpc>,
    locks: Arc<LockTable>,

    releases: mpsc::UnboundedSender<LockId>,
    retries: mpsc::UnboundedSender<Notification>,
    revokes: mpsc::UnboundedSender<Notification>,

    acquisitions: AtomicU64,
    shutdown: Shutdown,
}

impl ClientLockCache {
    /// Builds the cache and starts its releaser, retryer and revoker on the
    /// current tokio runtime.
    pub fn new(
        id: ClientId,
        server: Arc<dyn LockServerRpc>,
        release_hook: Arc<dyn ReleaseHook>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let locks = Arc::new(LockTable::default());
        let shutdown = Shutdown::new();
        let (releases, release_rx) = mpsc::unbounded_channel();
        let (retries, retry_rx) = mpsc::unbounded_channel();
        let (revokes, revoke_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_queue(
            Arc::new(LockReleaser {
                client: id.clone(),
                server: server.clone(),
                locks: locks.clone(),
                release_hook,
                backoff: config.backoff.clone(),
            }),
            release_rx,
            shutdown.subscribe(),
        ));
        tokio::spawn(run_queue(
            Arc::new(RetryHandler {
                locks: locks.clone(),
                requeue: retries.clone(),
                shutdown: shutdown.subscribe(),
            }),
            retry_rx,
            shutdown.subscribe(),
        ));
        tokio::spawn(run_queue(
            Arc::new(RevokeHandler {
                locks: locks.clone(),
                releases: releases.clone(),
                requeue: revokes.clone(),
                shutdown: shutdown.subscribe(),
            }),
            revoke_rx,
            shutdown.subscribe(),
        ));

        Arc::new(Self {
            id,
            server,
            locks,
            releases,
            retries,
            revokes,
            acquisitions: AtomicU64::new(0),
            shutdown,
        })
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Waits until the calling task holds `lock` exclusively.
    ///
    /// Only a transport failure on an acquire call is reported; a `Retry` from
    /// the server just means waiting for the server's retry callback.
    #[instrument(skip(self), fields(client = %self.id))]
    pub async fn acquire(&self, lock: LockId) -> Result<(), LockError> {
        let record = self.locks.get_or_create(lock);

        loop {
            let version = {
                let mut state = record.state();
                if self.shutdown.is_triggered() {
                    return Err(LockError::ShutDown);
                }
                match state.state {
                    ClientLockState::Free => {
                        self.grant(&mut state);
                        debug!("granted from cache");
                        return Ok(());
                    }
                    ClientLockState::None => {
                        state.state = ClientLockState::Acquiring;
                        Some(state.version)
                    }
                    _ => None,
                }
            };

            match version {
                Some(version) => {
                    if self.call_server(&record, version).await? {
                        return Ok(());
                    }
                }
                None => self.wait_for_change(&record).await?,
            }
        }
    }

    /// Sends one acquire. Returns `true` once the lock is held, `false` after a
    /// retry callback has come in and the record is ready for another attempt.
    async fn call_server(
        &self,
        record: &ClientLockRecord,
        version: Version,
    ) -> Result<bool, LockError> {
        let reply = self.server.acquire(&self.id, record.lock, version).await;

        let retry = {
            let mut state = record.state();
            record.advance_version(&mut state);
            match reply {
                Ok(LockStatus::Ok) => {
                    debug!(version, "granted by server");
                    self.grant(&mut state);
                    return Ok(true);
                }
                Ok(LockStatus::Retry) if self.shutdown.is_triggered() => {
                    state.state = ClientLockState::None;
                    record.unlocked.notify_waiters();
                    return Err(LockError::ShutDown);
                }
                Ok(LockStatus::Retry) => {
                    debug!(version, "server asked us to retry");
                    record.retry.notified()
                }
                Err(e) => {
                    warn!(version, error = %e, "acquire call failed");
                    state.state = ClientLockState::None;
                    record.unlocked.notify_waiters();
                    return Err(e.into());
                }
            }
        };
        retry.await;

        let mut state = record.state();
        state.state = ClientLockState::None;
        if self.shutdown.is_triggered() {
            record.unlocked.notify_waiters();
            return Err(LockError::ShutDown);
        }
        Ok(false)
    }

    /// Parks until the record leaves an Acquiring, Locked or Releasing state, or
    /// the cache shuts down.
    async fn wait_for_change(&self, record: &ClientLockRecord) -> Result<(), LockError> {
        let changed = {
            let state = record.state();
            if self.shutdown.is_triggered() {
                return Err(LockError::ShutDown);
            }
            match state.state {
                ClientLockState::Acquiring | ClientLockState::Locked => record.unlocked.notified(),
                ClientLockState::Releasing => record.released.notified(),
                ClientLockState::None | ClientLockState::Free => return Ok(()),
            }
        };
        changed.await;
        Ok(())
    }

    fn grant(&self, state: &mut record::RecordState) {
        state.state = ClientLockState::Locked;
        state.holder = Some(self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1);
    }

    /// Gives `lock` up locally. Never waits: if the server has asked for the lock
    /// back, the hand-back is left to the releaser.
    #[instrument(skip(self), fields(client = %self.id))]
    pub fn release(&self, lock: LockId) -> Result<(), LockError> {
        let record = self.locks.get(lock).ok_or(LockError::NotHeld(lock))?;
        let mut state = record.state();
        if state.state != ClientLockState::Locked {
            return Err(LockError::NotHeld(lock));
        }

        state.holder = None;
        if state.pending_revoke {
            debug!("revoke pending, handing back to server");
            state.state = ClientLockState::Releasing;
            if self.releases.send(lock).is_err() {
                warn!("releaser is gone, lock stays with this client");
            }
        } else {
            state.state = ClientLockState::Free;
        }
        record.unlocked.notify_waiters();
        Ok(())
    }

    /// Acquires `lock` and releases it when the guard is dropped.
    pub async fn lock(self: &Arc<Self>, lock: LockId) -> Result<LockGuard, LockError> {
        self.acquire(lock).await?;
        Ok(LockGuard {
            cache: self.clone(),
            lock,
        })
    }

    /// Number of acquisitions the server has granted for `lock`.
    pub async fn stat(&self, lock: LockId) -> Result<u64, LockError> {
        Ok(self.server.stat(lock).await?)
    }

    pub fn state(&self, lock: LockId) -> Option<ClientLockState> {
        self.locks.get(lock).map(|record| record.state().state)
    }

    /// Acquisition number of the current local holder of `lock`, if any.
    pub fn holder(&self, lock: LockId) -> Option<u64> {
        self.locks.get(lock).and_then(|record| record.state().holder)
    }

    pub fn cached_locks(&self) -> usize {
        self.locks.len()
    }

    /// Stops the background workers. Tasks parked in `acquire` return
    /// `LockError::ShutDown`; callbacks arriving afterwards are acknowledged and
    /// ignored.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        for record in self.locks.all() {
            let _state = record.state();
            record.unlocked.notify_waiters();
            record.released.notify_waiters();
            record.retry.notify_waiters();
        }
        info!(client = %self.id, "lock cache shut down");
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[async_trait]
impl LockCallbackRpc for ClientLockCache {
    async fn retry(&self, lock: LockId, version: Version) -> Result<(), RpcError> {
        if self.shutdown.is_triggered() {
            debug!(client = %self.id, lock, version, "shut down, ignoring retry");
            return Ok(());
        }
        debug!(client = %self.id, lock, version, "retry received");
        self.retries
            .send(Notification { lock, version })
            .map_err(|_| RpcError::Remote(format!("client {} is shut down", self.id)))
    }

    async fn revoke(&self, lock: LockId, version: Version) -> Result<(), RpcError> {
        if self.shutdown.is_triggered() {
            debug!(client = %self.id, lock, version, "shut down, ignoring revoke");
            return Ok(());
        }
        debug!(client = %self.id, lock, version, "revoke received");
        self.revokes
            .send(Notification { lock, version })
            .map_err(|_| RpcError::Remote(format!("client {} is shut down", self.id)))
    }
}

/// Releases its lock when dropped.
pub struct LockGuard {
    cache: Arc<ClientLockCache>,
    lock: LockId,
}

impl LockGuard {
    pub fn lock_id(&self) -> LockId {
        self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.cache.release(self.lock) {
            warn!(lock = self.lock, error = %e, "release on drop failed");
        }
    }
}

/// Puts `notification` back on `queue` once the acquire it answers has returned.
pub(crate) fn requeue_when_answered(
    record: Arc<ClientLockRecord>,
    notification: Notification,
    queue: mpsc::UnboundedSender<Notification>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = stopped(&mut shutdown) => {}
            _ = record.answered(notification.version) => {
                let _ = queue.send(notification);
            }
        }
    });
}
