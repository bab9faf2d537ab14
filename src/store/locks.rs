//! Per-namespace read/write locks.
//!
//! Ingestion holds a namespace's write lock from the existence check to the
//! last upsert; retrieval holds the read lock. Readers of a namespace that is
//! being re-ingested wait instead of seeing a half-cleared index. Unrelated
//! namespaces never contend.
//!
//! A namespace's entry lives only while some guard holds or awaits it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type LockMap = Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>;

/// Guard that drops its namespace entry once nobody else references it.
pub struct NamespaceGuard<G> {
    guard: Option<G>,
    namespace: String,
    locks: LockMap,
}

impl<G> Drop for NamespaceGuard<G> {
    fn drop(&mut self) {
        // Release the lock (and its Arc) before inspecting the map
        self.guard.take();
        let mut locks = self.locks.lock();
        let unused = locks
            .get(&self.namespace)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if unused {
            locks.remove(&self.namespace);
        }
    }
}

pub type NamespaceReadGuard = NamespaceGuard<OwnedRwLockReadGuard<()>>;
pub type NamespaceWriteGuard = NamespaceGuard<OwnedRwLockWriteGuard<()>>;

#[derive(Default)]
pub struct NamespaceLocks {
    locks: LockMap,
}

impl NamespaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, namespace: &str) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    fn wrap<G>(&self, namespace: &str, guard: G) -> NamespaceGuard<G> {
        NamespaceGuard {
            guard: Some(guard),
            namespace: namespace.to_string(),
            locks: self.locks.clone(),
        }
    }

    pub async fn read(&self, namespace: &str) -> NamespaceReadGuard {
        let guard = self.handle(namespace).read_owned().await;
        self.wrap(namespace, guard)
    }

    pub async fn write(&self, namespace: &str) -> NamespaceWriteGuard {
        let guard = self.handle(namespace).write_owned().await;
        self.wrap(namespace, guard)
    }

    /// Namespaces with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
