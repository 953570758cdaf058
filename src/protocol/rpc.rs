use std::sync::Arc;

use async_trait::async_trait;

use super::{ClientId, LockId, LockStatus, Version};
use crate::error::RpcError;

/// Calls a client makes on the lock server. Implementations route to the
/// current primary of the server's replica group.
#[async_trait]
pub trait LockServerRpc: Send + Sync {
    async fn acquire(
        &self,
        client: &ClientId,
        lock: LockId,
        version: Version,
    ) -> Result<LockStatus, RpcError>;

    async fn release(
        &self,
        client: &ClientId,
        lock: LockId,
        version: Version,
    ) -> Result<LockStatus, RpcError>;

    async fn stat(&self, lock: LockId) -> Result<u64, RpcError>;
}

/// Callbacks the lock server delivers to a client's inbound endpoint. Both must
/// return without waiting on lock state.
#[async_trait]
pub trait LockCallbackRpc: Send + Sync {
    async fn retry(&self, lock: LockId, version: Version) -> Result<(), RpcError>;

    async fn revoke(&self, lock: LockId, version: Version) -> Result<(), RpcError>;
}

/// Opens a callback channel to a client, given its id.
#[async_trait]
pub trait CallbackConnector: Send + Sync {
    async fn connect(&self, client: &ClientId) -> Result<Arc<dyn LockCallbackRpc>, RpcError>;
}
