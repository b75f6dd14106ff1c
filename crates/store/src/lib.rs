//! Steward store: get/list/update-status over declarative records.
//!
//! The store is the only shared mutable resource in the system. All writes
//! are read-modify-write scoped to a single record, so cross-instance
//! contention does not arise. Readers subscribe to an epoch channel that is
//! bumped on every spec change, giving the scheduler its on-demand wakeups.

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use rustc_hash::FxHashMap;
use steward_core::{ManagedResource, ResourceKey};
use tokio::sync::{watch, RwLock};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(ResourceKey),
}

/// The declarative-store capability consumed by the reconcile core.
/// Status updates never touch the spec; the spec is user-owned.
#[async_trait::async_trait]
pub trait Store<S: Clone + Send + Sync + 'static>: Send + Sync {
    async fn get(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ManagedResource<S>>, StoreError>;

    async fn list(&self) -> Result<Vec<ManagedResource<S>>, StoreError>;

    /// Persist `status`, `annotations` and `deletion_policy` of the given
    /// record; the stored spec and deletion timestamp win over the caller's
    /// copy.
    async fn update_status(&self, cr: &ManagedResource<S>) -> Result<(), StoreError>;

    /// Drop the record entirely (after a successful external delete, or when
    /// orphaning).
    async fn remove(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError>;

    /// Epoch channel bumped on spec changes.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// In-memory store used by the CLI runtime and by tests.
pub struct MemoryStore<S> {
    records: RwLock<FxHashMap<ResourceKey, ManagedResource<S>>>,
    epoch_tx: watch::Sender<u64>,
}

impl<S: Clone + Send + Sync + 'static> MemoryStore<S> {
    pub fn new() -> Arc<Self> {
        let (epoch_tx, _) = watch::channel(0u64);
        Arc::new(Self { records: RwLock::new(FxHashMap::default()), epoch_tx })
    }

    fn bump(&self) {
        self.epoch_tx.send_modify(|e| *e = e.saturating_add(1));
    }

    /// Insert or replace the desired spec for a record. Status, annotations
    /// and the deletion timestamp of an existing record are preserved; the
    /// generation is bumped so controllers can notice the change.
    pub async fn apply(&self, mut cr: ManagedResource<S>) {
        let key = cr.key();
        let mut map = self.records.write().await;
        if let Some(existing) = map.get(&key) {
            cr.status = existing.status.clone();
            cr.meta.annotations = existing.meta.annotations.clone();
            cr.meta.deletion_timestamp = existing.meta.deletion_timestamp;
            cr.meta.generation = existing.meta.generation + 1;
        }
        debug!(key = %key, generation = cr.meta.generation, "spec applied");
        map.insert(key, cr);
        drop(map);
        self.bump();
    }

    /// Request deletion: sets the deletion timestamp; actual removal happens
    /// once the reconcile engine has dealt with the external object.
    pub async fn mark_deleted(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        let key = ResourceKey::new(namespace, name);
        let mut map = self.records.write().await;
        let rec = map.get_mut(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if rec.meta.deletion_timestamp.is_none() {
            rec.meta.deletion_timestamp = Some(Utc::now());
        }
        drop(map);
        self.bump();
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Clone + Send + Sync + 'static> Store<S> for MemoryStore<S> {
    async fn get(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ManagedResource<S>>, StoreError> {
        let key = ResourceKey::new(namespace, name);
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn list(&self) -> Result<Vec<ManagedResource<S>>, StoreError> {
        let mut out: Vec<_> = self.records.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    async fn update_status(&self, cr: &ManagedResource<S>) -> Result<(), StoreError> {
        let key = cr.key();
        let mut map = self.records.write().await;
        let rec = map.get_mut(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
        rec.status = cr.status.clone();
        rec.meta.annotations = cr.meta.annotations.clone();
        rec.deletion_policy = cr.deletion_policy;
        Ok(())
    }

    async fn remove(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let key = ResourceKey::new(namespace, name);
        let mut map = self.records.write().await;
        map.remove(&key).ok_or(StoreError::NotFound(key))?;
        drop(map);
        self.bump();
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }
}
