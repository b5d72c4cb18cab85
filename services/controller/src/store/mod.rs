//! Object store boundary.
//!
//! Controllers read through [`Lister`]s and write through [`ResourceClient`]s.
//! In production the listers are [`Informer`] caches kept current by a watch
//! subscription; tests can hand the store itself to a controller as its
//! lister to get read-your-writes behavior.

mod informer;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use dgs_api::{
    DedicatedGameServer, DedicatedGameServerCollection, LabelSelector, Node, ObjectKey, Pod,
    Resource,
};
use dgs_reconcile::{retry_on_conflict, RetryPolicy, Retryable};
use thiserror::Error;
use tokio::sync::broadcast;

pub use informer::{EventHandler, Informer};
pub use memory::MemoryStore;

/// Object store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Object does not exist.
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// Object with this name already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// Write carried a stale resource version.
    #[error("conflict writing {kind} {key}: expected version {expected}, got {actual}")]
    Conflict {
        kind: &'static str,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found<K: Resource>(key: &ObjectKey) -> Self {
        Self::NotFound {
            kind: K::KIND,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl Retryable for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Change notification delivered by a watch.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Updated { old: K, new: K },
    /// Carries the last state the store held before the delete.
    Deleted(K),
}

impl<K: Resource> WatchEvent<K> {
    /// The most recent state carried by this event.
    pub fn object(&self) -> &K {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Updated { new, .. } => new,
        }
    }
}

/// Read access to one resource kind.
#[async_trait]
pub trait Lister<K: Resource>: Send + Sync {
    /// Fetch one object. Returns `Ok(None)` if it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    /// List objects matching `selector`, across all namespaces if
    /// `namespace` is `None`.
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, StoreError>;
}

/// Read/write access to one resource kind with optimistic concurrency.
#[async_trait]
pub trait ResourceClient<K: Resource>: Lister<K> {
    /// Store a new object. The store assigns uid and resource version.
    async fn create(&self, obj: K) -> Result<K, StoreError>;

    /// Replace an object. Fails with [`StoreError::Conflict`] if
    /// `obj`'s resource version is not the stored one.
    async fn update(&self, obj: K) -> Result<K, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Subscribe to changes made after this call.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>>;
}

/// Fetch, mutate and write back one object, retrying on conflict.
///
/// `mutate` returns false to skip the write (nothing to change). Returns the
/// object as stored after the call, or `None` if it no longer exists.
pub async fn modify<K, F>(
    client: &dyn ResourceClient<K>,
    key: &ObjectKey,
    policy: &RetryPolicy,
    mutate: F,
) -> Result<Option<K>, StoreError>
where
    K: Resource,
    F: Fn(&mut K) -> bool + Send + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(policy, || async move {
        let Some(mut obj) = client.get(&key.namespace, &key.name).await? else {
            return Ok(None);
        };
        if !mutate(&mut obj) {
            return Ok(Some(obj));
        }
        client.update(obj).await.map(Some)
    })
    .await
}

/// Write handles for every kind the controllers touch.
#[derive(Clone)]
pub struct Clients {
    pub game_servers: Arc<dyn ResourceClient<DedicatedGameServer>>,
    pub collections: Arc<dyn ResourceClient<DedicatedGameServerCollection>>,
    pub pods: Arc<dyn ResourceClient<Pod>>,
    pub nodes: Arc<dyn ResourceClient<Node>>,
}

impl Clients {
    /// Fresh in-memory stores for every kind.
    pub fn in_memory() -> Self {
        Self {
            game_servers: Arc::new(MemoryStore::new()),
            collections: Arc::new(MemoryStore::new()),
            pods: Arc::new(MemoryStore::new()),
            nodes: Arc::new(MemoryStore::new()),
        }
    }
}

/// Read handles for every kind the controllers touch.
#[derive(Clone)]
pub struct Listers {
    pub game_servers: Arc<dyn Lister<DedicatedGameServer>>,
    pub collections: Arc<dyn Lister<DedicatedGameServerCollection>>,
    pub pods: Arc<dyn Lister<Pod>>,
    pub nodes: Arc<dyn Lister<Node>>,
}

impl Listers {
    /// Read straight from the store, bypassing any cache.
    pub fn direct(clients: &Clients) -> Self {
        Self {
            game_servers: clients.game_servers.clone(),
            collections: clients.collections.clone(),
            pods: clients.pods.clone(),
            nodes: clients.nodes.clone(),
        }
    }
}

/// Informer caches for every kind the controllers touch.
#[derive(Clone)]
pub struct Informers {
    pub game_servers: Arc<Informer<DedicatedGameServer>>,
    pub collections: Arc<Informer<DedicatedGameServerCollection>>,
    pub pods: Arc<Informer<Pod>>,
    pub nodes: Arc<Informer<Node>>,
}

impl Informers {
    pub fn new(clients: &Clients) -> Self {
        Self {
            game_servers: Arc::new(Informer::new(clients.game_servers.clone())),
            collections: Arc::new(Informer::new(clients.collections.clone())),
            pods: Arc::new(Informer::new(clients.pods.clone())),
            nodes: Arc::new(Informer::new(clients.nodes.clone())),
        }
    }

    /// Listers backed by the informer caches.
    pub fn listers(&self) -> Listers {
        Listers {
            game_servers: self.game_servers.clone(),
            collections: self.collections.clone(),
            pods: self.pods.clone(),
            nodes: self.nodes.clone(),
        }
    }
}
