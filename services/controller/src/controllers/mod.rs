//! Reconcilers for game servers, collections and collection autoscaling.
//!
//! Each reconciler implements [`dgs_reconcile::SyncHandler`] and has a
//! `register` function that wires informer events to its work queue.

pub mod autoscaler;
pub mod collection;
pub mod gameserver;

use dgs_api::ObjectKey;
use thiserror::Error;
use tracing::warn;

use crate::portregistry::{PortRegistry, PortRegistryError};
use crate::store::StoreError;

pub use autoscaler::AutoscalerReconciler;
pub use collection::CollectionReconciler;
pub use gameserver::GameServerReconciler;

/// Reconciliation errors. All of them cause the key to be requeued.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Object store read or write failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Port allocation failed.
    #[error(transparent)]
    Ports(#[from] PortRegistryError),

    /// The pod's node is not in the cache yet.
    #[error("node {0} not found")]
    NodeNotFound(String),

    /// The pod's node publishes neither an external nor an internal address.
    #[error("node {0} has no reachable address")]
    NoNodeAddress(String),
}

/// Parse a queue key, logging and dropping keys that can never succeed.
fn parse_key(key: &str) -> Option<ObjectKey> {
    match key.parse::<ObjectKey>() {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(key, error = %e, "Dropping invalid key");
            None
        }
    }
}

/// Give ports back on behalf of `owner`, logging instead of failing.
async fn release_ports(ports: &PortRegistry, owner: &ObjectKey, host_ports: &[u16]) {
    if let Err(e) = ports.deregister_ports(owner, host_ports).await {
        warn!(owner = %owner, ports = ?host_ports, error = %e, "Failed to release ports");
    }
}
