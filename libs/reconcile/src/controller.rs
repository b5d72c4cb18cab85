//! Controller worker pool.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::queue::WorkQueue;
use crate::ReconcileError;

/// Per-key reconciliation logic plugged into a [`Controller`].
#[async_trait]
pub trait SyncHandler: Send + Sync + 'static {
    /// Error returned from a failed sync. Logged, then the key is requeued.
    type Error: Display + Send;

    /// Controller name for logging.
    fn name(&self) -> &str;

    /// Converge the object identified by `key`.
    async fn sync(&self, key: &str) -> Result<(), Self::Error>;
}

/// Drains a [`WorkQueue`] of object keys through a [`SyncHandler`].
pub struct Controller<H: SyncHandler> {
    handler: Arc<H>,
    queue: WorkQueue<String>,
    cache_synced: Vec<watch::Receiver<bool>>,
}

impl<H: SyncHandler> Controller<H> {
    /// Create a controller with the default queue backoff.
    pub fn new(handler: H) -> Self {
        Self::with_backoff(handler, BackoffPolicy::default())
    }

    pub fn with_backoff(handler: H, backoff: BackoffPolicy) -> Self {
        Self {
            handler: Arc::new(handler),
            queue: WorkQueue::new(backoff),
            cache_synced: Vec::new(),
        }
    }

    /// Block [`Controller::run`] until `synced` reports true.
    pub fn wait_for_cache(mut self, synced: watch::Receiver<bool>) -> Self {
        self.cache_synced.push(synced);
        self
    }

    /// Queue handle for event handlers to enqueue keys into.
    pub fn queue(&self) -> WorkQueue<String> {
        self.queue.clone()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Wait for caches, then run `workers` workers until shutdown.
    ///
    /// On shutdown the queue stops handing out keys; syncs already in flight
    /// run to completion before this returns.
    #[instrument(skip(self, shutdown), fields(controller = %self.handler.name()))]
    pub async fn run(
        &self,
        workers: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ReconcileError> {
        info!("Waiting for caches to sync");
        for synced in &self.cache_synced {
            let mut synced = synced.clone();
            tokio::select! {
                synced_ok = async { synced.wait_for(|s| *s).await.is_ok() } => {
                    if !synced_ok {
                        self.queue.shut_down();
                        return Err(ReconcileError::CacheSync(self.handler.name().to_string()));
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown before caches synced");
                    self.queue.shut_down();
                    return Ok(());
                }
            }
        }

        info!(workers, "Starting workers");
        let mut tasks = JoinSet::new();
        for worker in 0..workers.max(1) {
            let handler = Arc::clone(&self.handler);
            let queue = self.queue.clone();
            tasks.spawn(async move { run_worker(worker, handler, queue).await });
        }

        wait_for_shutdown(&mut shutdown).await;
        info!("Shutting down workers");
        self.queue.shut_down();

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
                result = Err(ReconcileError::Worker(e.to_string()));
            }
        }

        info!("Workers stopped");
        result
    }
}

/// Resolve once shutdown is signaled or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn run_worker<H: SyncHandler>(worker: usize, handler: Arc<H>, queue: WorkQueue<String>) {
    debug!(worker, "Worker started");

    while let Some(key) = queue.get().await {
        match handler.sync(&key).await {
            Ok(()) => {
                queue.forget(&key);
                debug!(key = %key, "Successfully synced");
            }
            Err(e) => {
                warn!(
                    key = %key,
                    requeues = queue.num_requeues(&key),
                    error = %e,
                    "Error syncing, requeuing"
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }

    debug!(worker, "Worker stopped");
}
