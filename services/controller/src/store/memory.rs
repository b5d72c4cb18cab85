//! In-memory object store.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use dgs_api::{LabelSelector, ObjectKey, Resource};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use super::{Lister, ResourceClient, StoreError, WatchEvent};

const WATCH_BUFFER: usize = 1024;

/// In-memory [`ResourceClient`] with per-object optimistic concurrency.
///
/// Resource versions come from one counter shared by every object in the
/// store, so they increase monotonically across the whole kind. Watch events
/// are sent while the write lock is held, so subscribers observe writes in
/// version order.
pub struct MemoryStore<K: Resource> {
    inner: RwLock<Inner<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    version: u64,
}

impl<K: Resource> MemoryStore<K> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: RwLock::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
            }),
            events,
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WatchEvent<K>) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl<K: Resource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: Resource> Lister<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self
            .read()
            .objects
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, StoreError> {
        Ok(self
            .read()
            .objects
            .values()
            .filter(|obj| namespace.is_none_or(|ns| obj.meta().namespace == ns))
            .filter(|obj| selector.matches(&obj.meta().labels))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl<K: Resource> ResourceClient<K> for MemoryStore<K> {
    async fn create(&self, mut obj: K) -> Result<K, StoreError> {
        let key = obj.key();
        let mut inner = self.write();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: K::KIND,
                key: key.to_string(),
            });
        }

        inner.version += 1;
        let meta = obj.meta_mut();
        meta.uid.get_or_insert_with(Uuid::new_v4);
        meta.creation_timestamp.get_or_insert_with(Utc::now);
        meta.resource_version = inner.version;

        inner.objects.insert(key.clone(), obj.clone());
        trace!(kind = K::KIND, key = %key, version = inner.version, "Created");
        self.emit(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, mut obj: K) -> Result<K, StoreError> {
        let key = obj.key();
        let mut inner = self.write();
        let next_version = inner.version + 1;
        let Some(current) = inner.objects.get_mut(&key) else {
            return Err(StoreError::not_found::<K>(&key));
        };

        let expected = current.meta().resource_version;
        let actual = obj.meta().resource_version;
        if expected != actual {
            return Err(StoreError::Conflict {
                kind: K::KIND,
                key: key.to_string(),
                expected,
                actual,
            });
        }

        let meta = obj.meta_mut();
        meta.uid = current.meta().uid;
        meta.creation_timestamp = current.meta().creation_timestamp;
        meta.resource_version = next_version;

        let old = std::mem::replace(current, obj.clone());
        inner.version = next_version;
        trace!(kind = K::KIND, key = %key, version = next_version, "Updated");
        self.emit(WatchEvent::Updated {
            old,
            new: obj.clone(),
        });
        Ok(obj)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = ObjectKey::new(namespace, name);
        let mut inner = self.write();
        let Some(old) = inner.objects.remove(&key) else {
            return Err(StoreError::not_found::<K>(&key));
        };
        inner.version += 1;
        trace!(kind = K::KIND, key = %key, "Deleted");
        self.emit(WatchEvent::Deleted(old));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>> {
        self.events.subscribe()
    }
}
