//! Server side of the caching lock protocol.
//!
//! The server decides ownership. Acquire and release handlers only update the
//! lock table and queue callbacks; revokes and retries go out from background
//! senders so a slow client never stalls the ordered decision path.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::BackoffConfig,
    error::RpcError,
    protocol::{
        rpc::{CallbackConnector, LockServerRpc},
        Callback, ClientId, LockId, LockStatus, Version, VersionTable,
    },
    util::{lock, runnable::run_queue, Shutdown},
};

use self::notifier::{CallbackKind, CallbackSender, ClientConnections};

mod notifier;
pub mod replica;

pub use replica::{PrimaryFlag, Replica, Standalone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLockState {
    Free,
    Locked,
}

#[derive(Debug)]
struct ServerLockRecord {
    state: ServerLockState,
    owner: Option<ClientId>,
    waiters: VecDeque<ClientId>,
    /// Set while a revoke for the current contention episode is outstanding.
    revoke_in_flight: bool,
    granted: u64,
}

impl Default for ServerLockRecord {
    fn default() -> Self {
        Self {
            state: ServerLockState::Free,
            owner: None,
            waiters: VecDeque::new(),
            revoke_in_flight: false,
            granted: 0,
        }
    }
}

#[derive(Debug, Default)]
struct LockBook {
    locks: HashMap<LockId, ServerLockRecord>,
    versions: VersionTable,
}

pub struct ServerLockCache {
    book: Mutex<LockBook>,
    clients: Arc<ClientConnections>,
    revokes: mpsc::UnboundedSender<Callback>,
    retries: mpsc::UnboundedSender<Callback>,
    shutdown: Shutdown,
}

impl ServerLockCache {
    /// Builds the server and starts its revoke and retry senders on the current
    /// tokio runtime.
    pub fn new(
        connector: Arc<dyn CallbackConnector>,
        replica: Arc<dyn Replica>,
        backoff: BackoffConfig,
    ) -> Arc<Self> {
        let clients = Arc::new(ClientConnections::new(connector));
        let shutdown = Shutdown::new();
        let (revokes, revoke_rx) = mpsc::unbounded_channel();
        let (retries, retry_rx) = mpsc::unbounded_channel();

        for (kind, queue) in [
            (CallbackKind::Revoke, revoke_rx),
            (CallbackKind::Retry, retry_rx),
        ] {
            tokio::spawn(run_queue(
                Arc::new(CallbackSender {
                    kind,
                    clients: clients.clone(),
                    replica: replica.clone(),
                    backoff: backoff.clone(),
                }),
                queue,
                shutdown.subscribe(),
            ));
        }

        Arc::new(Self {
            book: Mutex::new(LockBook::default()),
            clients,
            revokes,
            retries,
            shutdown,
        })
    }

    pub fn lock_state(&self, lock_id: LockId) -> ServerLockState {
        lock(&self.book)
            .locks
            .get(&lock_id)
            .map(|record| record.state)
            .unwrap_or(ServerLockState::Free)
    }

    pub fn owner(&self, lock_id: LockId) -> Option<ClientId> {
        lock(&self.book)
            .locks
            .get(&lock_id)
            .and_then(|record| record.owner.clone())
    }

    pub fn waiters(&self, lock_id: LockId) -> Vec<ClientId> {
        lock(&self.book)
            .locks
            .get(&lock_id)
            .map(|record| record.waiters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of clients a callback channel has been opened to.
    pub fn known_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    fn queue(&self, kind: CallbackKind, callback: Callback) {
        let queue = match kind {
            CallbackKind::Revoke => &self.revokes,
            CallbackKind::Retry => &self.retries,
        };
        if queue.send(callback).is_err() {
            warn!(?kind, "callback sender stopped, dropping callback");
        }
    }
}

#[async_trait]
impl LockServerRpc for ServerLockCache {
    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        client: &ClientId,
        lock_id: LockId,
        version: Version,
    ) -> Result<LockStatus, RpcError> {
        let mut book = lock(&self.book);
        let LockBook { locks, versions } = &mut *book;

        if !versions.record(client, lock_id, version) {
            debug!("replayed acquire, ignoring");
            return Ok(LockStatus::Retry);
        }

        let record = locks.entry(lock_id).or_default();
        match (record.state, record.owner.as_ref()) {
            (ServerLockState::Free, _) => {
                record.state = ServerLockState::Locked;
                record.owner = Some(client.clone());
                record.granted += 1;
                info!("lock granted");
                Ok(LockStatus::Ok)
            }
            (ServerLockState::Locked, Some(owner)) if owner == client => {
                debug!("acquire from current owner, already granted");
                Ok(LockStatus::Ok)
            }
            (ServerLockState::Locked, owner) => {
                if !record.waiters.contains(client) {
                    record.waiters.push_back(client.clone());
                }

                match owner {
                    Some(owner) if !record.revoke_in_flight => {
                        record.revoke_in_flight = true;
                        let callback = Callback {
                            client: owner.clone(),
                            lock: lock_id,
                            version: versions.get(owner, lock_id),
                        };
                        debug!(owner = %callback.client, "queueing revoke");
                        self.queue(CallbackKind::Revoke, callback);
                    }
                    _ => debug!("revoke already outstanding"),
                }
                Ok(LockStatus::Retry)
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(
        &self,
        client: &ClientId,
        lock_id: LockId,
        version: Version,
    ) -> Result<LockStatus, RpcError> {
        let mut book = lock(&self.book);
        let LockBook { locks, versions } = &mut *book;

        if !versions.record(client, lock_id, version) {
            debug!("replayed release, ignoring");
            return Ok(LockStatus::Ok);
        }

        let record = match locks.get_mut(&lock_id) {
            Some(record) => record,
            None => return Ok(LockStatus::Ok),
        };

        // Every waiter gets a retry; the first one back wins and the rest are
        // queued again.
        for waiter in record.waiters.drain(..) {
            let callback = Callback {
                version: versions.get(&waiter, lock_id),
                client: waiter,
                lock: lock_id,
            };
            self.queue(CallbackKind::Retry, callback);
        }

        if record.owner.as_ref() == Some(client) {
            record.state = ServerLockState::Free;
            record.owner = None;
            record.revoke_in_flight = false;
            info!("lock released");
        } else {
            debug!(owner = ?record.owner, "release from a non-owner");
        }
        Ok(LockStatus::Ok)
    }

    async fn stat(&self, lock_id: LockId) -> Result<u64, RpcError> {
        Ok(lock(&self.book)
            .locks
            .get(&lock_id)
            .map(|record| record.granted)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{protocol::rpc::LockCallbackRpc, transport::local::LocalNetwork};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(&'static str, LockId, Version)>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<(&'static str, LockId, Version)> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl LockCallbackRpc for Recorder {
        async fn retry(&self, lock_id: LockId, version: Version) -> Result<(), RpcError> {
            lock(&self.calls).push(("retry", lock_id, version));
            Ok(())
        }

        async fn revoke(&self, lock_id: LockId, version: Version) -> Result<(), RpcError> {
            lock(&self.calls).push(("revoke", lock_id, version));
            Ok(())
        }
    }

    struct Fixture {
        server: Arc<ServerLockCache>,
        clients: Vec<(ClientId, Arc<Recorder>)>,
        _endpoints: Vec<Arc<dyn LockCallbackRpc>>,
    }

    fn fixture(replica: Arc<dyn Replica>, names: &[&str]) -> Fixture {
        let network = LocalNetwork::new();
        let mut clients = Vec::new();
        let mut endpoints: Vec<Arc<dyn LockCallbackRpc>> = Vec::new();
        for name in names {
            let id = ClientId::new(*name);
            let recorder = Arc::new(Recorder::default());
            let endpoint: Arc<dyn LockCallbackRpc> = recorder.clone();
            network.register(&id, endpoint.clone());
            endpoints.push(endpoint);
            clients.push((id, recorder));
        }
        let backoff = BackoffConfig {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        };
        Fixture {
            server: ServerLockCache::new(Arc::new(network), replica, backoff),
            clients,
            _endpoints: endpoints,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn free_lock_is_granted() {
        let f = fixture(Arc::new(Standalone), &["a"]);
        let (a, _) = &f.clients[0];

        assert_eq!(f.server.acquire(a, 1, 0).await.unwrap(), LockStatus::Ok);
        assert_eq!(f.server.lock_state(1), ServerLockState::Locked);
        assert_eq!(f.server.owner(1), Some(a.clone()));
        assert_eq!(f.server.stat(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn contention_sends_one_revoke_per_episode() {
        let f = fixture(Arc::new(Standalone), &["a", "b", "c"]);
        let (a, a_calls) = &f.clients[0];
        let (b, _) = &f.clients[1];
        let (c, _) = &f.clients[2];

        assert_eq!(f.server.acquire(a, 7, 3).await.unwrap(), LockStatus::Ok);
        assert_eq!(f.server.acquire(b, 7, 0).await.unwrap(), LockStatus::Retry);
        assert_eq!(f.server.acquire(c, 7, 0).await.unwrap(), LockStatus::Retry);
        assert_eq!(f.server.acquire(b, 7, 1).await.unwrap(), LockStatus::Retry);
        settle().await;

        assert_eq!(a_calls.calls(), vec![("revoke", 7, 3)]);
        assert_eq!(f.server.waiters(7), vec![b.clone(), c.clone()]);
    }

    #[tokio::test]
    async fn release_retries_every_waiter() {
        let f = fixture(Arc::new(Standalone), &["a", "b", "c"]);
        let (a, _) = &f.clients[0];
        let (b, b_calls) = &f.clients[1];
        let (c, c_calls) = &f.clients[2];

        f.server.acquire(a, 2, 0).await.unwrap();
        f.server.acquire(b, 2, 4).await.unwrap();
        f.server.acquire(c, 2, 9).await.unwrap();
        assert_eq!(f.server.release(a, 2, 1).await.unwrap(), LockStatus::Ok);
        settle().await;

        assert_eq!(f.server.lock_state(2), ServerLockState::Free);
        assert!(f.server.waiters(2).is_empty());
        assert_eq!(b_calls.calls(), vec![("retry", 2, 4)]);
        assert_eq!(c_calls.calls(), vec![("retry", 2, 9)]);

        // First one back wins, the next one queues and triggers a fresh revoke.
        assert_eq!(f.server.acquire(c, 2, 10).await.unwrap(), LockStatus::Ok);
        assert_eq!(f.server.acquire(b, 2, 5).await.unwrap(), LockStatus::Retry);
        settle().await;
        assert_eq!(
            c_calls.calls(),
            vec![("retry", 2, 9), ("revoke", 2, 10)]
        );
    }

    #[tokio::test]
    async fn release_from_non_owner_keeps_lock() {
        let f = fixture(Arc::new(Standalone), &["a", "b"]);
        let (a, _) = &f.clients[0];
        let (b, _) = &f.clients[1];

        f.server.acquire(a, 4, 0).await.unwrap();
        f.server.release(b, 4, 0).await.unwrap();
        assert_eq!(f.server.owner(4), Some(a.clone()));
    }

    #[tokio::test]
    async fn replayed_calls_change_nothing() {
        let f = fixture(Arc::new(Standalone), &["a", "b"]);
        let (a, _) = &f.clients[0];
        let (b, _) = &f.clients[1];

        assert_eq!(f.server.acquire(a, 5, 0).await.unwrap(), LockStatus::Ok);
        // Duplicate delivery of the granted acquire.
        assert_eq!(f.server.acquire(a, 5, 0).await.unwrap(), LockStatus::Ok);
        assert_eq!(f.server.stat(5).await.unwrap(), 1);

        f.server.release(a, 5, 1).await.unwrap();
        assert_eq!(f.server.acquire(b, 5, 0).await.unwrap(), LockStatus::Ok);

        // An older release from `a` arriving late must not free b's lock.
        f.server.release(a, 5, 0).await.unwrap();
        assert_eq!(f.server.owner(5), Some(b.clone()));

        // Nor may an older acquire from `a` enqueue it.
        assert_eq!(f.server.acquire(a, 5, 0).await.unwrap(), LockStatus::Retry);
        assert!(f.server.waiters(5).is_empty());
    }

    #[tokio::test]
    async fn backup_does_not_send_callbacks() {
        let f = fixture(Arc::new(PrimaryFlag::new(false)), &["a", "b"]);
        let (a, a_calls) = &f.clients[0];
        let (b, _) = &f.clients[1];

        f.server.acquire(a, 6, 0).await.unwrap();
        assert_eq!(f.server.acquire(b, 6, 0).await.unwrap(), LockStatus::Retry);
        settle().await;

        assert!(a_calls.calls().is_empty());
        assert_eq!(f.server.known_clients(), 0);
    }
}
