use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{unix_now, ExtentAttr, ExtentId, ExtentStore};
use crate::{
    config::BackoffConfig,
    error::{ExtentError, RpcError},
    interface::release::ReleaseHook,
    protocol::LockId,
    util::{
        lock,
        retry::{with_backoff, Backoff},
    },
};

#[derive(Debug)]
struct CachedExtent {
    data: Bytes,
    attr: ExtentAttr,
    dirty: bool,
    deleted: bool,
}

/// Write-back cache in front of an extent store.
///
/// Reads and writes stay local until `flush`, which the lock cache triggers
/// right before handing the matching lock back to the server. Callers must
/// hold the lock for any extent they touch.
pub struct CachingExtentClient {
    store: Arc<dyn ExtentStore>,
    cache: Mutex<HashMap<ExtentId, CachedExtent>>,
    backoff: BackoffConfig,
}

impl CachingExtentClient {
    pub fn new(store: Arc<dyn ExtentStore>, backoff: BackoffConfig) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            backoff,
        }
    }

    pub async fn get(&self, id: ExtentId) -> Result<Bytes, ExtentError> {
        {
            let mut cache = lock(&self.cache);
            if let Some(extent) = cache.get_mut(&id) {
                if extent.deleted {
                    return Err(ExtentError::NoEnt(id));
                }
                extent.attr.atime = unix_now();
                return Ok(extent.data.clone());
            }
        }

        debug!(id, "cache miss, fetching");
        let data = self.store.get(id).await?;
        let attr = self.store.getattr(id).await?;
        lock(&self.cache).insert(
            id,
            CachedExtent {
                data: data.clone(),
                attr,
                dirty: false,
                deleted: false,
            },
        );
        Ok(data)
    }

    pub async fn getattr(&self, id: ExtentId) -> Result<ExtentAttr, ExtentError> {
        {
            let cache = lock(&self.cache);
            if let Some(extent) = cache.get(&id) {
                if extent.deleted {
                    return Err(ExtentError::NoEnt(id));
                }
                return Ok(extent.attr);
            }
        }
        self.store.getattr(id).await
    }

    pub fn put(&self, id: ExtentId, data: Bytes) {
        let attr = ExtentAttr::written(data.len());
        lock(&self.cache).insert(
            id,
            CachedExtent {
                data,
                attr,
                dirty: true,
                deleted: false,
            },
        );
    }

    pub fn remove(&self, id: ExtentId) {
        lock(&self.cache)
            .entry(id)
            .and_modify(|extent| extent.deleted = true)
            .or_insert(CachedExtent {
                data: Bytes::new(),
                attr: ExtentAttr::default(),
                dirty: false,
                deleted: true,
            });
    }

    pub fn is_dirty(&self, id: ExtentId) -> bool {
        lock(&self.cache)
            .get(&id)
            .map(|extent| extent.dirty || extent.deleted)
            .unwrap_or(false)
    }

    /// Pushes pending changes for `id` to the store and forgets the local copy.
    pub async fn flush(&self, id: ExtentId) -> Result<(), ExtentError> {
        let extent = match lock(&self.cache).remove(&id) {
            Some(extent) => extent,
            None => return Ok(()),
        };

        if extent.deleted {
            debug!(id, "flushing delete");
            with_backoff(Backoff::forever("extent remove", &self.backoff), || {
                let store = self.store.clone();
                async move { store.remove(id).await.map_err(into_rpc) }.boxed()
            })
            .await?;
        } else if extent.dirty {
            debug!(id, len = extent.data.len(), "flushing write");
            with_backoff(Backoff::forever("extent put", &self.backoff), || {
                let store = self.store.clone();
                let data = extent.data.clone();
                async move { store.put(id, data).await.map_err(into_rpc) }.boxed()
            })
            .await?;
        }
        Ok(())
    }
}

fn into_rpc(e: ExtentError) -> RpcError {
    match e {
        ExtentError::Rpc(e) => e,
        other => RpcError::Remote(other.to_string()),
    }
}

/// Release hook writing back the extent that shares the lock's id.
pub struct FlushOnRelease {
    extents: Arc<CachingExtentClient>,
}

impl FlushOnRelease {
    pub fn new(extents: Arc<CachingExtentClient>) -> Self {
        Self { extents }
    }
}

#[async_trait]
impl ReleaseHook for FlushOnRelease {
    async fn on_release(&self, lock: LockId) {
        if let Err(e) = self.extents.flush(lock).await {
            warn!(lock, error = %e, "flush before release failed");
        }
    }
}
