use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, info};

use super::replica::Replica;
use crate::{
    config::BackoffConfig,
    error::RpcError,
    protocol::{
        rpc::{CallbackConnector, LockCallbackRpc},
        Callback, ClientId,
    },
    util::{
        lock,
        retry::{with_backoff, Backoff},
        runnable::QueueRunnable,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallbackKind {
    Revoke,
    Retry,
}

impl CallbackKind {
    fn name(self) -> &'static str {
        match self {
            CallbackKind::Revoke => "revoke",
            CallbackKind::Retry => "retry",
        }
    }
}

/// Callback channels to clients, dialed on first use and kept for good.
pub(crate) struct ClientConnections {
    connector: Arc<dyn CallbackConnector>,
    handles: Mutex<HashMap<ClientId, Arc<dyn LockCallbackRpc>>>,
}

impl ClientConnections {
    pub(crate) fn new(connector: Arc<dyn CallbackConnector>) -> Self {
        Self {
            connector,
            handles: Mutex::new(HashMap::new()),
        }
    }

    async fn get(&self, client: &ClientId) -> Result<Arc<dyn LockCallbackRpc>, RpcError> {
        let cached = lock(&self.handles).get(client).cloned();
        if let Some(handle) = cached {
            return Ok(handle);
        }

        debug!(%client, "dialing client");
        let handle = self.connector.connect(client).await?;
        Ok(lock(&self.handles)
            .entry(client.clone())
            .or_insert(handle)
            .clone())
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.handles).len()
    }
}

/// Delivers one kind of callback, retrying each until the client acknowledges it.
pub(crate) struct CallbackSender {
    pub(crate) kind: CallbackKind,
    pub(crate) clients: Arc<ClientConnections>,
    pub(crate) replica: Arc<dyn Replica>,
    pub(crate) backoff: BackoffConfig,
}

impl CallbackSender {
    async fn deliver(&self, callback: &Callback) -> Result<(), RpcError> {
        let client = self.clients.get(&callback.client).await?;
        match self.kind {
            CallbackKind::Revoke => client.revoke(callback.lock, callback.version).await,
            CallbackKind::Retry => client.retry(callback.lock, callback.version).await,
        }
    }
}

#[async_trait]
impl QueueRunnable for CallbackSender {
    type Item = Callback;

    async fn run_once(&self, callback: Callback) {
        // A former primary may still have queued work after a fail-over; only
        // the current primary talks to clients.
        if !self.replica.is_primary() {
            debug!(
                kind = self.kind.name(),
                client = %callback.client,
                lock = callback.lock,
                "not primary, dropping callback"
            );
            return;
        }

        let sent = with_backoff(Backoff::forever(self.kind.name(), &self.backoff), || {
            self.deliver(&callback).boxed()
        })
        .await;

        if sent.is_ok() {
            info!(
                kind = self.kind.name(),
                client = %callback.client,
                lock = callback.lock,
                version = callback.version,
                "callback delivered"
            );
        }
    }
}
