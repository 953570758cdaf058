use std::sync::Arc;

use config::{BackoffConfig, ClientConfig};
use interface::release::ReleaseHook;
use protocol::ClientId;
use server::Replica;
use transport::local::{CountingServer, LocalNetwork};

pub mod client;
pub mod config;
pub mod error;
pub mod extent;
pub mod interface;
pub mod protocol;
pub mod server;
pub mod transport;
mod util;

pub use client::{ClientLockCache, ClientLockState, LockGuard};
pub use error::{ExtentError, LockError, RpcError};
pub use protocol::{LockId, LockStatus, Version};
pub use server::{ServerLockCache, ServerLockState};

/// A lock server and any number of client caches wired together in-process.
pub struct LocalCluster {
    network: LocalNetwork,
    server: Arc<ServerLockCache>,
    backoff: BackoffConfig,
}

impl LocalCluster {
    pub fn new(replica: Arc<dyn Replica>, backoff: BackoffConfig) -> Self {
        let network = LocalNetwork::new();
        let server = ServerLockCache::new(Arc::new(network.clone()), replica, backoff.clone());
        Self {
            network,
            server,
            backoff,
        }
    }

    pub fn server(&self) -> &Arc<ServerLockCache> {
        &self.server
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// Starts a client cache named `name`, with its server calls going through a
    /// counting wrapper that is handed back alongside it.
    pub fn client(
        &self,
        name: &str,
        release_hook: Arc<dyn ReleaseHook>,
    ) -> (Arc<ClientLockCache>, Arc<CountingServer>) {
        let id = ClientId::new(name);
        let server = Arc::new(CountingServer::new(self.server.clone()));
        let cache = ClientLockCache::new(
            id.clone(),
            server.clone(),
            release_hook,
            ClientConfig {
                backoff: self.backoff.clone(),
            },
        );
        self.network.register(&id, cache.clone());
        (cache, server)
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}
