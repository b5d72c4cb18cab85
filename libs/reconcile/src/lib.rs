//! Reconciliation runtime primitives.
//!
//! Controllers built on this crate converge observed state toward desired
//! state one object key at a time:
//!
//! - **Work queue**: a deduplicating, rate-limited queue of keys. A key is
//!   never handed to two workers at once.
//! - **Controller**: waits for its caches to sync, then runs a pool of workers
//!   that drain the queue through a [`SyncHandler`].
//! - **Conflict retry**: bounded read-modify-write retry for optimistic
//!   concurrency writes.
//!
//! # Invariants
//!
//! - At most one sync per key is in flight at any time
//! - A failed sync is requeued with exponential backoff; a successful one
//!   resets the key's backoff
//! - Handler errors never stop a worker

mod backoff;
mod controller;
mod queue;
mod retry;

use std::time::Duration;

use thiserror::Error;

pub use backoff::BackoffPolicy;
pub use controller::{Controller, SyncHandler};
pub use queue::WorkQueue;
pub use retry::{retry_on_conflict, RetryPolicy, Retryable};

/// Reconciliation runtime errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A cache this controller depends on never finished its initial sync.
    #[error("failed to wait for caches to sync: {0}")]
    CacheSync(String),

    /// A worker task ended abnormally.
    #[error("worker failed: {0}")]
    Worker(String),
}

/// Base delay for the first requeue of a failing key.
pub const DEFAULT_QUEUE_BASE_DELAY: Duration = Duration::from_millis(5);

/// Ceiling for per-key requeue delay.
pub const DEFAULT_QUEUE_MAX_DELAY: Duration = Duration::from_secs(300);

/// Attempts made by [`retry_on_conflict`] with the default policy.
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;
