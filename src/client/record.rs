use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::{watch, Notify};

use crate::{
    protocol::{LockId, Version},
    util::lock,
};

/// Where a lock stands from the point of view of one client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLockState {
    /// The process does not own the lock.
    None,
    /// One task is asking the server for the lock.
    Acquiring,
    /// The process owns the lock and a local task holds it.
    Locked,
    /// The process owns the lock and no local task holds it.
    Free,
    /// The releaser is handing the lock back to the server.
    Releasing,
}

#[derive(Debug)]
pub(crate) struct RecordState {
    pub(crate) state: ClientLockState,
    pub(crate) holder: Option<u64>,
    pub(crate) pending_revoke: bool,
    /// Version the next acquire will carry. Only moves forward.
    pub(crate) version: Version,
}

/// Per-lock state plus the wait points tasks park on.
///
/// Every `notify_waiters` call on these happens with `state` held, and waiters
/// create their `Notified` future while still holding it, so no wakeup can fall
/// between a waiter's check and its wait.
#[derive(Debug)]
pub(crate) struct ClientLockRecord {
    pub(crate) lock: LockId,
    state: Mutex<RecordState>,
    version_tx: watch::Sender<Version>,
    pub(crate) unlocked: Notify,
    pub(crate) released: Notify,
    pub(crate) retry: Notify,
}

impl ClientLockRecord {
    fn new(lock: LockId) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            lock,
            state: Mutex::new(RecordState {
                state: ClientLockState::None,
                holder: None,
                pending_revoke: false,
                version: 0,
            }),
            version_tx,
            unlocked: Notify::new(),
            released: Notify::new(),
            retry: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RecordState> {
        lock(&self.state)
    }

    /// Called once the reply to the acquire carrying `state.version` is in.
    pub(crate) fn advance_version(&self, state: &mut RecordState) {
        state.version += 1;
        self.version_tx.send_replace(state.version);
    }

    /// Resolves once the outgoing version has moved past `version`.
    pub(crate) async fn answered(&self, version: Version) {
        let mut rx = self.version_tx.subscribe();
        let _ = rx.wait_for(|&current| current > version).await;
    }
}

/// Registry of per-lock records. Records are created on first use and never
/// removed, so memory grows with the number of distinct locks a process touches.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    records: Mutex<HashMap<LockId, Arc<ClientLockRecord>>>,
}

impl LockTable {
    pub(crate) fn get_or_create(&self, lock_id: LockId) -> Arc<ClientLockRecord> {
        lock(&self.records)
            .entry(lock_id)
            .or_insert_with(|| Arc::new(ClientLockRecord::new(lock_id)))
            .clone()
    }

    pub(crate) fn get(&self, lock_id: LockId) -> Option<Arc<ClientLockRecord>> {
        lock(&self.records).get(&lock_id).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<ClientLockRecord>> {
        lock(&self.records).values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.records).len()
    }
}
