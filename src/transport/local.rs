//! In-process transport. Clients and server live in one runtime and call each
//! other directly, with knobs to drop calls and count what was delivered.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
};

use async_trait::async_trait;

use crate::{
    error::RpcError,
    protocol::{
        rpc::{CallbackConnector, LockCallbackRpc, LockServerRpc},
        ClientId, LockId, LockStatus, Version,
    },
    util::lock,
};

#[derive(Default)]
struct Deliveries {
    revokes: usize,
    retries: usize,
}

#[derive(Default)]
struct NetworkState {
    endpoints: Mutex<HashMap<ClientId, Weak<dyn LockCallbackRpc>>>,
    dropped_calls: Mutex<HashMap<ClientId, usize>>,
    deliveries: Mutex<HashMap<ClientId, Deliveries>>,
}

impl NetworkState {
    fn take_fault(&self, client: &ClientId) -> bool {
        match lock(&self.dropped_calls).get_mut(client) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn endpoint(&self, client: &ClientId) -> Result<Arc<dyn LockCallbackRpc>, RpcError> {
        lock(&self.endpoints)
            .get(client)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RpcError::Unreachable(client.clone()))
    }
}

/// Routes server callbacks to client caches registered by id.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<NetworkState>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `endpoint` reachable as `client`. Only a weak reference is kept, so
    /// dropping the client takes it off the network.
    pub fn register(&self, client: &ClientId, endpoint: Arc<dyn LockCallbackRpc>) {
        lock(&self.state.endpoints).insert(client.clone(), Arc::downgrade(&endpoint));
    }

    /// Fails the next `calls` callbacks addressed to `client`.
    pub fn drop_next(&self, client: &ClientId, calls: usize) {
        lock(&self.state.dropped_calls).insert(client.clone(), calls);
    }

    pub fn revokes_delivered(&self, client: &ClientId) -> usize {
        lock(&self.state.deliveries)
            .get(client)
            .map(|d| d.revokes)
            .unwrap_or_default()
    }

    pub fn retries_delivered(&self, client: &ClientId) -> usize {
        lock(&self.state.deliveries)
            .get(client)
            .map(|d| d.retries)
            .unwrap_or_default()
    }
}

#[async_trait]
impl CallbackConnector for LocalNetwork {
    async fn connect(&self, client: &ClientId) -> Result<Arc<dyn LockCallbackRpc>, RpcError> {
        self.state.endpoint(client)?;
        Ok(Arc::new(LocalEndpoint {
            client: client.clone(),
            state: self.state.clone(),
        }))
    }
}

struct LocalEndpoint {
    client: ClientId,
    state: Arc<NetworkState>,
}

impl LocalEndpoint {
    fn reach(&self) -> Result<Arc<dyn LockCallbackRpc>, RpcError> {
        if self.state.take_fault(&self.client) {
            return Err(RpcError::Transport(format!("call to {} dropped", self.client)));
        }
        self.state.endpoint(&self.client)
    }
}

#[async_trait]
impl LockCallbackRpc for LocalEndpoint {
    async fn retry(&self, lock_id: LockId, version: Version) -> Result<(), RpcError> {
        self.reach()?.retry(lock_id, version).await?;
        lock(&self.state.deliveries)
            .entry(self.client.clone())
            .or_default()
            .retries += 1;
        Ok(())
    }

    async fn revoke(&self, lock_id: LockId, version: Version) -> Result<(), RpcError> {
        self.reach()?.revoke(lock_id, version).await?;
        lock(&self.state.deliveries)
            .entry(self.client.clone())
            .or_default()
            .revokes += 1;
        Ok(())
    }
}

/// Wraps a server, counting calls and optionally failing some of them.
pub struct CountingServer {
    inner: Arc<dyn LockServerRpc>,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    failing_acquires: AtomicUsize,
    failing_releases: AtomicUsize,
}

impl CountingServer {
    pub fn new(inner: Arc<dyn LockServerRpc>) -> Self {
        Self {
            inner,
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            failing_acquires: AtomicUsize::new(0),
            failing_releases: AtomicUsize::new(0),
        }
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn fail_next_acquires(&self, calls: usize) {
        self.failing_acquires.store(calls, Ordering::SeqCst);
    }

    pub fn fail_next_releases(&self, calls: usize) {
        self.failing_releases.store(calls, Ordering::SeqCst);
    }
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl LockServerRpc for CountingServer {
    async fn acquire(
        &self,
        client: &ClientId,
        lock_id: LockId,
        version: Version,
    ) -> Result<LockStatus, RpcError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if take(&self.failing_acquires) {
            return Err(RpcError::Transport("acquire dropped".to_string()));
        }
        self.inner.acquire(client, lock_id, version).await
    }

    async fn release(
        &self,
        client: &ClientId,
        lock_id: LockId,
        version: Version,
    ) -> Result<LockStatus, RpcError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if take(&self.failing_releases) {
            return Err(RpcError::Transport("release dropped".to_string()));
        }
        self.inner.release(client, lock_id, version).await
    }

    async fn stat(&self, lock_id: LockId) -> Result<u64, RpcError> {
        self.inner.stat(lock_id).await
    }
}
