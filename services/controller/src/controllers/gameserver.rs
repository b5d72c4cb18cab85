//! DedicatedGameServer reconciler.
//!
//! Binds each instance to exactly one pod, mirrors the pod's phase and the
//! hosting node's address onto the instance status, and deletes drained
//! instances that were scaled out of their collection.

use async_trait::async_trait;
use dgs_api::{labels, DedicatedGameServer, LabelSelector, ObjectKey, Pod, PodPhase, Resource};
use dgs_reconcile::{SyncHandler, WorkQueue};
use tracing::{debug, info, instrument, warn};

use super::{parse_key, release_ports, ControllerError};
use crate::events::{REASON_INSTANCE_DELETED, REASON_POD_CREATED};
use crate::pods::build_pod;
use crate::state::ControllerContext;
use crate::store::{self, Informers, WatchEvent};

pub struct GameServerReconciler {
    ctx: ControllerContext,
}

impl GameServerReconciler {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// Converge one instance.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        let Some(dgs) = self
            .ctx
            .listers
            .game_servers
            .get(&key.namespace, &key.name)
            .await?
        else {
            debug!("DedicatedGameServer no longer exists");
            return Ok(());
        };

        if dgs.is_terminating() {
            return Ok(());
        }

        if dgs.status.marked_for_deletion && dgs.status.active_players == 0 {
            return self.delete_drained(key).await;
        }

        let selector = LabelSelector::from_label(labels::GAME_SERVER_NAME, &key.name);
        let pods = self
            .ctx
            .listers
            .pods
            .list(Some(&key.namespace), &selector)
            .await?;

        let Some(pod) = select_pod(&pods) else {
            return self.create_pod(dgs).await;
        };
        if pods.len() > 1 {
            debug!(count = pods.len(), pod = %pod.metadata.name, "Multiple pods bound, using preferred");
        }

        self.observe_pod(&dgs, pod).await
    }

    async fn delete_drained(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        match self
            .ctx
            .clients
            .game_servers
            .delete(&key.namespace, &key.name)
            .await
        {
            Ok(()) => {
                info!("Deleted drained DedicatedGameServer");
                self.ctx.recorder.normal(
                    DedicatedGameServer::KIND,
                    key,
                    REASON_INSTANCE_DELETED,
                    "Marked for deletion with no active players".to_string(),
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_pod(&self, dgs: DedicatedGameServer) -> Result<(), ControllerError> {
        let dgs = if dgs.needs_host_ports() {
            self.assign_host_ports(dgs).await?
        } else {
            dgs
        };

        let pod = build_pod(&dgs, &self.ctx.callbacks);
        match self.ctx.clients.pods.create(pod).await {
            Ok(pod) => {
                info!(pod = %pod.metadata.name, "Created pod");
                self.ctx.recorder.normal(
                    DedicatedGameServer::KIND,
                    &dgs.key(),
                    REASON_POD_CREATED,
                    format!("Created pod {}", pod.metadata.name),
                );
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("Pod already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Allocate host ports for exposed container ports that lack one and
    /// persist them on the instance before any pod uses them.
    async fn assign_host_ports(
        &self,
        mut dgs: DedicatedGameServer,
    ) -> Result<DedicatedGameServer, ControllerError> {
        let key = dgs.key();
        let exposed = dgs.spec.ports_to_expose.clone();
        let mut allocated = Vec::new();

        for port in dgs
            .spec
            .template
            .ports_mut()
            .filter(|p| exposed.contains(&p.container_port) && p.host_port.is_none())
        {
            match self.ctx.ports.get_new_port(&key).await {
                Ok(host_port) => {
                    port.host_port = Some(host_port);
                    allocated.push(host_port);
                }
                Err(e) => {
                    release_ports(&self.ctx.ports, &key, &allocated).await;
                    return Err(e.into());
                }
            }
        }

        match self.ctx.clients.game_servers.update(dgs).await {
            Ok(updated) => {
                info!(ports = ?allocated, "Assigned host ports");
                Ok(updated)
            }
            Err(e) => {
                release_ports(&self.ctx.ports, &key, &allocated).await;
                Err(e.into())
            }
        }
    }

    /// Mirror pod phase, node and public address onto the instance status.
    async fn observe_pod(&self, dgs: &DedicatedGameServer, pod: &Pod) -> Result<(), ControllerError> {
        let node_name = pod.spec.node_name.clone().filter(|n| !n.is_empty());
        let public_ip = match &node_name {
            Some(name) => {
                let node = self
                    .ctx
                    .listers
                    .nodes
                    .get("", name)
                    .await?
                    .ok_or_else(|| ControllerError::NodeNotFound(name.clone()))?;
                let address = node
                    .reachable_address()
                    .ok_or_else(|| ControllerError::NoNodeAddress(name.clone()))?;
                Some(address.to_string())
            }
            None => None,
        };
        let phase = pod.status.phase;

        let current = &dgs.status;
        if current.pod_phase == Some(phase)
            && current.public_ip == public_ip
            && current.node_name == node_name
        {
            return Ok(());
        }

        let updated = store::modify(
            self.ctx.clients.game_servers.as_ref(),
            &dgs.key(),
            &self.ctx.retry,
            |latest| {
                let status = &mut latest.status;
                if status.pod_phase == Some(phase)
                    && status.public_ip == public_ip
                    && status.node_name == node_name
                {
                    return false;
                }
                status.pod_phase = Some(phase);
                status.public_ip = public_ip.clone();
                status.node_name = node_name.clone();
                true
            },
        )
        .await?;

        if updated.is_some() {
            debug!(phase = %phase, public_ip = ?public_ip, node = ?node_name, "Updated observed status");
        }
        Ok(())
    }
}

#[async_trait]
impl SyncHandler for GameServerReconciler {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "dedicated-game-server"
    }

    async fn sync(&self, key: &str) -> Result<(), Self::Error> {
        match parse_key(key) {
            Some(key) => self.reconcile(&key).await,
            None => Ok(()),
        }
    }
}

/// Pick the pod an instance is bound to, preferring a running one.
pub fn select_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter()
        .find(|p| p.status.phase == PodPhase::Running)
        .or_else(|| pods.first())
}

/// Returns true if an instance update is worth reconciling.
pub fn has_game_server_changed(old: &DedicatedGameServer, new: &DedicatedGameServer) -> bool {
    let (o, n) = (&old.status, &new.status);
    old.spec.template.containers.len() != new.spec.template.containers.len()
        || !old.spec.template.images().eq(new.spec.template.images())
        || o.health != n.health
        || o.pod_phase != n.pod_phase
        || o.public_ip != n.public_ip
        || o.node_name != n.node_name
        || o.active_players != n.active_players
        || o.marked_for_deletion != n.marked_for_deletion
        || old.metadata.labels != new.metadata.labels
}

/// Release everything a deleted instance held: its host ports and any pod
/// still bound to it. The store does not garbage collect dependents.
pub async fn release_instance(ctx: &ControllerContext, dgs: &DedicatedGameServer) {
    let key = dgs.key();
    let host_ports = dgs.exposed_host_ports();
    match ctx.ports.deregister_ports(&key, &host_ports).await {
        Ok(freed) if freed > 0 => info!(key = %key, freed, "Released ports of deleted DedicatedGameServer"),
        Ok(_) => {}
        Err(e) => warn!(key = %key, error = %e, "Failed to release ports"),
    }

    let selector = LabelSelector::from_label(labels::GAME_SERVER_NAME, &key.name);
    let pods = match ctx.clients.pods.list(Some(&key.namespace), &selector).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to list pods of deleted DedicatedGameServer");
            return;
        }
    };
    for pod in pods
        .iter()
        .filter(|p| p.metadata.is_owned_by(DedicatedGameServer::KIND, &key.name))
    {
        match ctx
            .clients
            .pods
            .delete(&pod.metadata.namespace, &pod.metadata.name)
            .await
        {
            Ok(()) => debug!(pod = %pod.metadata.name, "Deleted pod of deleted DedicatedGameServer"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(pod = %pod.metadata.name, error = %e, "Failed to delete pod"),
        }
    }
}

/// Wire instance and pod events to `queue`.
pub fn register(informers: &Informers, queue: &WorkQueue<String>, ctx: &ControllerContext) {
    {
        let queue = queue.clone();
        let ctx = ctx.clone();
        informers
            .game_servers
            .add_handler(move |event: &WatchEvent<DedicatedGameServer>| match event {
                WatchEvent::Added(dgs) => queue.add(dgs.key().to_string()),
                WatchEvent::Updated { old, new } => {
                    if has_game_server_changed(old, new) {
                        queue.add(new.key().to_string());
                    }
                }
                WatchEvent::Deleted(dgs) => {
                    let ctx = ctx.clone();
                    let dgs = dgs.clone();
                    tokio::spawn(async move { release_instance(&ctx, &dgs).await });
                }
            });
    }

    let queue = queue.clone();
    informers.pods.add_handler(move |event: &WatchEvent<Pod>| {
        let pod = event.object();
        if let Some(name) = pod.metadata.label(labels::GAME_SERVER_NAME) {
            queue.add(ObjectKey::new(&pod.metadata.namespace, name).to_string());
        }
    });
}
