//! Extent storage used by the layer above the lock cache. Data for an extent is
//! only touched while holding the lock with the same id.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::{error::ExtentError, util::lock};

mod cache;

pub use cache::{CachingExtentClient, FlushOnRelease};

pub type ExtentId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentAttr {
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl ExtentAttr {
    fn written(size: usize) -> Self {
        let now = unix_now();
        Self {
            size: size as u64,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

#[async_trait]
pub trait ExtentStore: Send + Sync {
    async fn get(&self, id: ExtentId) -> Result<Bytes, ExtentError>;

    async fn put(&self, id: ExtentId, data: Bytes) -> Result<(), ExtentError>;

    /// Removing a missing extent is not an error.
    async fn remove(&self, id: ExtentId) -> Result<(), ExtentError>;

    async fn getattr(&self, id: ExtentId) -> Result<ExtentAttr, ExtentError>;
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug)]
struct Extent {
    data: Bytes,
    attr: ExtentAttr,
}

/// Extent server keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemoryExtentStore {
    extents: Mutex<HashMap<ExtentId, Extent>>,
}

impl MemoryExtentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExtentStore for MemoryExtentStore {
    async fn get(&self, id: ExtentId) -> Result<Bytes, ExtentError> {
        let mut extents = lock(&self.extents);
        let extent = extents.get_mut(&id).ok_or(ExtentError::NoEnt(id))?;
        extent.attr.atime = unix_now();
        Ok(extent.data.clone())
    }

    async fn put(&self, id: ExtentId, data: Bytes) -> Result<(), ExtentError> {
        debug!(id, len = data.len(), "put");
        let attr = ExtentAttr::written(data.len());
        lock(&self.extents).insert(id, Extent { data, attr });
        Ok(())
    }

    async fn remove(&self, id: ExtentId) -> Result<(), ExtentError> {
        debug!(id, "remove");
        lock(&self.extents).remove(&id);
        Ok(())
    }

    async fn getattr(&self, id: ExtentId) -> Result<ExtentAttr, ExtentError> {
        lock(&self.extents)
            .get(&id)
            .map(|extent| extent.attr)
            .ok_or(ExtentError::NoEnt(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryExtentStore::new();
        store.put(5, Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(store.get(5).await.unwrap(), Bytes::from_static(b"hello"));
        let attr = store.getattr(5).await.unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(attr.mtime, attr.ctime);
    }

    #[tokio::test]
    async fn missing_extent_is_noent() {
        let store = MemoryExtentStore::new();
        assert!(matches!(store.get(1).await, Err(ExtentError::NoEnt(1))));
        assert!(matches!(store.getattr(1).await, Err(ExtentError::NoEnt(1))));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = MemoryExtentStore::new();
        store.put(2, Bytes::from_static(b"x")).await.unwrap();
        store.remove(2).await.unwrap();
        store.remove(2).await.unwrap();
        assert!(matches!(store.get(2).await, Err(ExtentError::NoEnt(2))));
    }
}
