//! Port Registry: the single owner of the host port pool.
//!
//! All allocation state lives inside one actor. Callers send a request and
//! wait for its reply, so concurrent allocations are serialized without a
//! lock and the scan order stays deterministic.

use async_trait::async_trait;
use dgs_api::{DedicatedGameServer, ObjectKey, Resource};
use dgs_networking::{NetworkError, PortPool};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::{self, Actor, ActorError, ActorHandle};

const MAILBOX_SIZE: usize = 256;

/// Port Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortRegistryError {
    /// The pool could not satisfy the request.
    #[error(transparent)]
    Pool(#[from] NetworkError),

    /// The registry has been stopped.
    #[error("port registry stopped")]
    Stopped,
}

impl From<ActorError> for PortRegistryError {
    fn from(_: ActorError) -> Self {
        Self::Stopped
    }
}

#[derive(Debug)]
enum PortRequest {
    Allocate {
        owner: ObjectKey,
        reply_to: oneshot::Sender<Result<u16, NetworkError>>,
    },
    Release {
        owner: ObjectKey,
        ports: Vec<u16>,
        reply_to: oneshot::Sender<usize>,
    },
    Available {
        reply_to: oneshot::Sender<usize>,
    },
}

struct PortArbiter {
    pool: PortPool<ObjectKey>,
}

#[async_trait]
impl Actor for PortArbiter {
    type Message = PortRequest;

    fn name(&self) -> &str {
        "port_registry"
    }

    async fn handle(&mut self, msg: PortRequest) -> Result<bool, ActorError> {
        match msg {
            PortRequest::Allocate { owner, reply_to } => {
                let result = self.pool.allocate(owner.clone());
                match &result {
                    Ok(port) => debug!(owner = %owner, port, "Allocated port"),
                    Err(e) => warn!(owner = %owner, error = %e, "Port allocation failed"),
                }
                if let Err(Ok(port)) = reply_to.send(result) {
                    // Caller went away; give the port back.
                    self.pool.release(&owner, &[port]);
                }
            }
            PortRequest::Release {
                owner,
                ports,
                reply_to,
            } => {
                let freed = self.pool.release(&owner, &ports);
                debug!(owner = %owner, requested = ports.len(), freed, "Released ports");
                let _ = reply_to.send(freed);
            }
            PortRequest::Available { reply_to } => {
                let _ = reply_to.send(self.pool.available());
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self) {
        info!(
            in_use = self.pool.capacity() - self.pool.available(),
            "Port registry stopped"
        );
    }
}

/// Handle to the port arbiter. Cheap to clone.
#[derive(Clone)]
pub struct PortRegistry {
    handle: ActorHandle<PortRequest>,
}

impl PortRegistry {
    /// Build the pool over `[min, max]` and start the arbiter.
    ///
    /// Host ports already exposed by `existing` instances are registered to
    /// those instances first, so a restart never hands out a live port.
    pub fn new(
        min: u16,
        max: u16,
        existing: &[DedicatedGameServer],
    ) -> Result<(Self, JoinHandle<()>), PortRegistryError> {
        let mut builder = PortPool::builder(min, max)?;
        let mut registered = 0;
        for dgs in existing {
            let owner = dgs.key();
            for port in dgs.exposed_host_ports() {
                match builder.register(owner.clone(), port) {
                    Ok(()) => registered += 1,
                    Err(e) => warn!(owner = %owner, port, error = %e, "Skipping existing port"),
                }
            }
        }

        let pool = builder.build(&mut rand::rng());
        info!(
            min,
            max,
            registered,
            available = pool.available(),
            "Port registry initialized"
        );

        let (handle, task) = actor::spawn(PortArbiter { pool }, MAILBOX_SIZE);
        Ok((Self { handle }, task))
    }

    /// Allocate a free port for `owner`.
    pub async fn get_new_port(&self, owner: &ObjectKey) -> Result<u16, PortRegistryError> {
        let (reply_to, rx) = oneshot::channel();
        self.handle
            .send(PortRequest::Allocate {
                owner: owner.clone(),
                reply_to,
            })
            .await?;
        let result = rx.await.map_err(|_| PortRegistryError::Stopped)?;
        Ok(result?)
    }

    /// Return `ports` held by `owner` to the pool. Returns how many were freed.
    pub async fn deregister_ports(
        &self,
        owner: &ObjectKey,
        ports: &[u16],
    ) -> Result<usize, PortRegistryError> {
        if ports.is_empty() {
            return Ok(0);
        }
        let (reply_to, rx) = oneshot::channel();
        self.handle
            .send(PortRequest::Release {
                owner: owner.clone(),
                ports: ports.to_vec(),
                reply_to,
            })
            .await?;
        rx.await.map_err(|_| PortRegistryError::Stopped)
    }

    /// Number of free ports.
    pub async fn available(&self) -> Result<usize, PortRegistryError> {
        let (reply_to, rx) = oneshot::channel();
        self.handle
            .send(PortRequest::Available { reply_to })
            .await?;
        rx.await.map_err(|_| PortRegistryError::Stopped)
    }

    /// Stop the arbiter. Later calls fail with [`PortRegistryError::Stopped`].
    pub fn stop(&self) {
        self.handle.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgs_api::{ContainerPort, ContainerSpec, ObjectMeta, PodTemplate, Protocol};
    use std::collections::HashSet;

    fn with_host_port(name: &str, host_port: u16) -> DedicatedGameServer {
        let mut port = ContainerPort::new(7777, Protocol::Udp);
        port.host_port = Some(host_port);
        let mut dgs = DedicatedGameServer {
            metadata: ObjectMeta::new("default", name),
            ..Default::default()
        };
        dgs.spec.template = PodTemplate {
            containers: vec![ContainerSpec {
                name: "server".to_string(),
                image: "example/arena:1.0".to_string(),
                ports: vec![port],
                ..Default::default()
            }],
        };
        dgs.spec.ports_to_expose = vec![7777];
        dgs
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        let (registry, _task) = PortRegistry::new(20000, 20099, &[]).unwrap();

        let mut tasks = Vec::new();
        for i in 0..100 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .get_new_port(&ObjectKey::new("default", format!("dgs-{i}")))
                    .await
            }));
        }

        let mut ports = HashSet::new();
        for task in tasks {
            let port = task.await.unwrap().unwrap();
            assert!(ports.insert(port), "port {port} handed out twice");
        }
        assert_eq!(registry.available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_is_an_error() {
        let (registry, _task) = PortRegistry::new(20000, 20001, &[]).unwrap();
        let owner = ObjectKey::new("default", "arena-a");
        registry.get_new_port(&owner).await.unwrap();
        registry.get_new_port(&owner).await.unwrap();

        let err = registry.get_new_port(&owner).await.unwrap_err();
        assert!(matches!(
            err,
            PortRegistryError::Pool(NetworkError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_existing_ports_are_not_reissued() {
        let existing = vec![
            with_host_port("arena-a", 20000),
            with_host_port("arena-b", 20001),
        ];
        let (registry, _task) = PortRegistry::new(20000, 20002, &existing).unwrap();
        assert_eq!(registry.available().await.unwrap(), 1);

        let port = registry
            .get_new_port(&ObjectKey::new("default", "arena-c"))
            .await
            .unwrap();
        assert_eq!(port, 20002);
    }

    #[tokio::test]
    async fn test_double_release_is_harmless() {
        let (registry, _task) = PortRegistry::new(20000, 20000, &[]).unwrap();
        let a = ObjectKey::new("default", "arena-a");
        let b = ObjectKey::new("default", "arena-b");

        let port = registry.get_new_port(&a).await.unwrap();
        assert_eq!(registry.deregister_ports(&a, &[port]).await.unwrap(), 1);

        // The port moves to b; a second release on behalf of a must not free it.
        assert_eq!(registry.get_new_port(&b).await.unwrap(), port);
        assert_eq!(registry.deregister_ports(&a, &[port]).await.unwrap(), 0);
        assert_eq!(registry.available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_calls_after_stop_fail() {
        let (registry, task) = PortRegistry::new(20000, 20010, &[]).unwrap();
        registry.stop();
        task.await.unwrap();

        let err = registry
            .get_new_port(&ObjectKey::new("default", "arena-a"))
            .await
            .unwrap_err();
        assert_eq!(err, PortRegistryError::Stopped);
    }

    #[test]
    fn test_invalid_range() {
        assert!(matches!(
            PortRegistry::new(30000, 20000, &[]),
            Err(PortRegistryError::Pool(NetworkError::InvalidRange { .. }))
        ));
    }
}
