// SPDX-License-Identifier: MIT
//! Content store facade over the node object API.
//!
//! Adds the publish/GC exclusion the raw API does not have: GC takes the
//! store-wide write lock, publish runs hold read guards. tokio's RwLock is
//! write-preferring, so a pending GC blocks new publishes while in-flight
//! ones finish — the pin set is stable for the whole GC run.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::info;

use crate::node::{ApiError, ContentId, NodeApi};

#[derive(Debug, Error)]
pub enum GcError {
    #[error("node is offline")]
    Offline,
    #[error("gc timed out after {0:?}")]
    Timeout(Duration),
    #[error("node API error: {0}")]
    Api(#[from] ApiError),
}

pub struct ContentStore {
    api: Arc<dyn NodeApi>,
    gc_lock: RwLock<()>,
}

impl ContentStore {
    pub fn new(api: Arc<dyn NodeApi>) -> Self {
        Self { api, gc_lock: RwLock::new(()) }
    }

    /// Idempotent content add: identical bytes yield the identical id and a
    /// second submission changes nothing.
    pub async fn put(&self, bytes: Vec<u8>) -> Result<ContentId, ApiError> {
        self.api.add(bytes).await
    }

    pub async fn get(&self, id: &ContentId) -> Result<Vec<u8>, ApiError> {
        self.api.cat(id).await
    }

    pub async fn pin(&self, id: &ContentId) -> Result<(), ApiError> {
        self.api.pin(id).await
    }

    pub async fn unpin(&self, id: &ContentId) -> Result<(), ApiError> {
        self.api.unpin(id).await
    }

    /// Enter a publish run. The returned guard keeps GC out until dropped;
    /// acquisition waits if a GC is running or already queued.
    pub async fn begin_publish(&self) -> RwLockReadGuard<'_, ()> {
        self.gc_lock.read().await
    }

    /// Remove unreferenced objects. Requires the node online; exclusive with
    /// publish runs; not cancellable mid-run but bounded by `timeout`.
    pub async fn gc(&self, timeout: Duration) -> Result<usize, GcError> {
        let _exclusive = self.gc_lock.write().await;
        match tokio::time::timeout(timeout, self.api.repo_gc()).await {
            Err(_) => Err(GcError::Timeout(timeout)),
            Ok(Err(ApiError::Offline)) => Err(GcError::Offline),
            Ok(Err(e)) => Err(GcError::Api(e)),
            Ok(Ok(reclaimed)) => {
                info!(reclaimed, "gc completed");
                Ok(reclaimed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::memory::MemoryNode;

    #[tokio::test]
    async fn put_is_idempotent() {
        let node = Arc::new(MemoryNode::new());
        let store = ContentStore::new(node.clone());
        let a = store.put(b"same bytes".to_vec()).await.unwrap();
        let count = node.object_count();
        let b = store.put(b"same bytes".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(node.object_count(), count);
    }

    #[tokio::test]
    async fn gc_waits_for_an_in_flight_publish() {
        let node = Arc::new(MemoryNode::new());
        let store = Arc::new(ContentStore::new(node.clone()));
        store.put(b"unpinned".to_vec()).await.unwrap();

        let guard = store.begin_publish().await;
        let gc_store = Arc::clone(&store);
        let gc = tokio::spawn(async move { gc_store.gc(Duration::from_secs(5)).await });

        // GC must not finish while the publish guard is held.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!gc.is_finished());

        drop(guard);
        let reclaimed = gc.await.unwrap().unwrap();
        assert_eq!(reclaimed, 1);
    }

    #[tokio::test]
    async fn gc_offline_is_a_typed_error() {
        let node = Arc::new(MemoryNode::new());
        node.set_offline(true);
        let store = ContentStore::new(node);
        assert!(matches!(store.gc(Duration::from_secs(1)).await, Err(GcError::Offline)));
    }
}
