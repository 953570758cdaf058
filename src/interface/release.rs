use async_trait::async_trait;

use crate::protocol::LockId;

/// Upcall run by the client releaser just before a lock is handed back to the
/// server, so whatever the lock protected can be written out first.
#[async_trait]
pub trait ReleaseHook: Send + Sync {
    async fn on_release(&self, lock: LockId);
}

/// Hands locks back without doing anything first.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRelease;

#[async_trait]
impl ReleaseHook for NoopRelease {
    async fn on_release(&self, _lock: LockId) {}
}
