//! Local cache mirror of one resource kind.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use dgs_api::{LabelSelector, ObjectKey, Resource};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use super::{Lister, ResourceClient, StoreError, WatchEvent};

/// Callback invoked for every cache change, after the cache is updated.
pub type EventHandler<K> = Arc<dyn Fn(&WatchEvent<K>) + Send + Sync>;

/// Keeps a local copy of every object of one kind and fans changes out to
/// registered handlers.
///
/// Register handlers before calling [`Informer::run`]; the initial list is
/// delivered to them as `Added` events.
pub struct Informer<K: Resource> {
    client: Arc<dyn ResourceClient<K>>,
    cache: RwLock<BTreeMap<ObjectKey, K>>,
    handlers: Mutex<Vec<EventHandler<K>>>,
    synced_tx: watch::Sender<bool>,
}

impl<K: Resource> Informer<K> {
    pub fn new(client: Arc<dyn ResourceClient<K>>) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            client,
            cache: RwLock::new(BTreeMap::new()),
            handlers: Mutex::new(Vec::new()),
            synced_tx,
        }
    }

    /// Register a change handler.
    pub fn add_handler(&self, handler: impl Fn(&WatchEvent<K>) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Flips to true once the initial list has been loaded.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    /// Load the cache and keep it current until shutdown.
    #[instrument(skip(self, shutdown), fields(kind = K::KIND))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        // Subscribe before listing so nothing written in between is missed.
        let mut events = self.client.watch();
        self.relist().await?;
        self.synced_tx.send_replace(true);
        info!(objects = self.len(), "Cache synced");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Informer shutting down");
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.apply(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch lagged, relisting");
                        self.relist().await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Watch closed");
                        break;
                    }
                },
            }
        }

        Ok(())
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the cache with a fresh list, emitting the differences.
    async fn relist(&self) -> Result<(), StoreError> {
        let listed = self.client.list(None, &LabelSelector::everything()).await?;

        let mut events = Vec::new();
        {
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            let mut fresh = BTreeMap::new();
            for obj in listed {
                let key = obj.key();
                match cache.remove(&key) {
                    None => events.push(WatchEvent::Added(obj.clone())),
                    Some(old) if old.meta().resource_version != obj.meta().resource_version => {
                        events.push(WatchEvent::Updated {
                            old,
                            new: obj.clone(),
                        })
                    }
                    Some(_) => {}
                }
                fresh.insert(key, obj);
            }
            events.extend(cache.values().cloned().map(WatchEvent::Deleted));
            *cache = fresh;
        }

        for event in &events {
            self.dispatch(event);
        }
        Ok(())
    }

    /// Apply one watch event, dropping anything the cache has already seen.
    fn apply(&self, event: WatchEvent<K>) {
        let event = {
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            let obj = event.object();
            let key = obj.key();
            let version = obj.meta().resource_version;
            let cached_version = cache.get(&key).map(|c| c.meta().resource_version);

            match event {
                WatchEvent::Added(obj) | WatchEvent::Updated { new: obj, .. } => {
                    if cached_version.is_some_and(|v| v >= version) {
                        return;
                    }
                    match cache.insert(key, obj.clone()) {
                        Some(old) => WatchEvent::Updated { old, new: obj },
                        None => WatchEvent::Added(obj),
                    }
                }
                WatchEvent::Deleted(obj) => match cached_version {
                    Some(v) if v <= version => {
                        cache.remove(&key);
                        WatchEvent::Deleted(obj)
                    }
                    _ => return,
                },
            }
        };

        self.dispatch(&event);
    }

    fn dispatch(&self, event: &WatchEvent<K>) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(event);
        }
    }
}

#[async_trait]
impl<K: Resource> Lister<K> for Informer<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, StoreError> {
        Ok(self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|obj| namespace.is_none_or(|ns| obj.meta().namespace == ns))
            .filter(|obj| selector.matches(&obj.meta().labels))
            .cloned()
            .collect())
    }
}
