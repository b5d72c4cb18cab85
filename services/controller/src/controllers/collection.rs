//! DedicatedGameServerCollection reconciler.
//!
//! Keeps the number of member instances at `spec.replicas`, aggregates member
//! health into the collection status and applies the configured fail
//! behavior. A failure observed once the failure counter is at its threshold
//! puts the collection into `NeedsIntervention`, which stops scaling until an
//! operator lowers the counter.

use std::collections::BTreeSet;

use async_trait::async_trait;
use dgs_api::{
    labels, CollectionHealth, DedicatedGameServer, DedicatedGameServerCollection,
    DedicatedGameServerSpec, FailBehavior, GameServerHealth, LabelSelector, ObjectKey, ObjectMeta,
    OwnerReference, PodPhase, Resource,
};
use dgs_reconcile::{SyncHandler, WorkQueue};
use tracing::{debug, info, instrument, warn};

use super::gameserver::has_game_server_changed;
use super::{parse_key, release_ports, ControllerError};
use crate::events::{
    REASON_FAILED_INSTANCES, REASON_NEEDS_INTERVENTION, REASON_REPLICAS_DECREASED,
    REASON_REPLICAS_INCREASED, REASON_SYNCED,
};
use crate::state::ControllerContext;
use crate::store::{self, Informers, WatchEvent};

const KIND: &str = DedicatedGameServerCollection::KIND;

pub struct CollectionReconciler {
    ctx: ControllerContext,
}

impl CollectionReconciler {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        let Some(col) = self
            .ctx
            .listers
            .collections
            .get(&key.namespace, &key.name)
            .await?
        else {
            debug!("DedicatedGameServerCollection no longer exists");
            return Ok(());
        };
        if col.is_terminating() {
            return Ok(());
        }

        let members = self.members(&col).await?;

        let Some(col) = self.reconcile_status(key, &members).await? else {
            return Ok(());
        };

        let failed: Vec<&DedicatedGameServer> = members
            .iter()
            .filter(|d| d.status.health == GameServerHealth::Failed)
            .collect();
        if !failed.is_empty() {
            return self.handle_failures(&col, &failed).await;
        }

        if col.status.dgs_collection_health == CollectionHealth::NeedsIntervention {
            debug!("Scaling suspended until the failure counter is reset");
            return Ok(());
        }

        let desired = col.spec.replicas as usize;
        let current = members.len();
        if current < desired {
            self.scale_out(&col, desired - current).await
        } else if current > desired {
            self.scale_in(&col, &members, current - desired).await
        } else {
            self.ctx.recorder.normal(
                KIND,
                key,
                REASON_SYNCED,
                format!("{current} replicas in sync"),
            );
            Ok(())
        }
    }

    /// Instances currently carrying membership of `col`.
    ///
    /// Read from the store rather than the cache: instances created by the
    /// previous pass may not have reached the cache yet, and counting from it
    /// would create them again.
    async fn members(
        &self,
        col: &DedicatedGameServerCollection,
    ) -> Result<Vec<DedicatedGameServer>, ControllerError> {
        let selector = LabelSelector::from_label(labels::COLLECTION_NAME, &col.metadata.name);
        Ok(self
            .ctx
            .clients
            .game_servers
            .list(Some(&col.metadata.namespace), &selector)
            .await?)
    }

    /// Recompute aggregate status. Returns the collection as stored afterwards,
    /// or `None` if it was deleted meanwhile.
    async fn reconcile_status(
        &self,
        key: &ObjectKey,
        members: &[DedicatedGameServer],
    ) -> Result<Option<DedicatedGameServerCollection>, ControllerError> {
        let health = collection_health(members);
        let pod_state = pod_collection_state(members);
        let available = available_replicas(members);

        let col = store::modify(
            self.ctx.clients.collections.as_ref(),
            key,
            &self.ctx.retry,
            |latest| {
                let health = if latest.status.dgs_collection_health
                    == CollectionHealth::NeedsIntervention
                    && latest.failure_threshold_reached()
                {
                    CollectionHealth::NeedsIntervention
                } else {
                    health
                };
                let status = &mut latest.status;
                if status.dgs_collection_health == health
                    && status.pod_collection_state == Some(pod_state)
                    && status.available_replicas == available
                {
                    return false;
                }
                status.dgs_collection_health = health;
                status.pod_collection_state = Some(pod_state);
                status.available_replicas = available;
                true
            },
        )
        .await?;
        Ok(col)
    }

    async fn handle_failures(
        &self,
        col: &DedicatedGameServerCollection,
        failed: &[&DedicatedGameServer],
    ) -> Result<(), ControllerError> {
        let key = col.key();

        if col.failure_threshold_reached() {
            let updated = store::modify(
                self.ctx.clients.collections.as_ref(),
                &key,
                &self.ctx.retry,
                |latest| {
                    if latest.status.dgs_collection_health == CollectionHealth::NeedsIntervention {
                        return false;
                    }
                    latest.status.dgs_collection_health = CollectionHealth::NeedsIntervention;
                    true
                },
            )
            .await?;
            if col.status.dgs_collection_health != CollectionHealth::NeedsIntervention
                && updated.is_some()
            {
                warn!(
                    times_failed = col.status.dgs_times_failed,
                    max_failures = col.spec.dgs_max_failures,
                    "Failure threshold reached"
                );
                self.ctx.recorder.warning(
                    KIND,
                    &key,
                    REASON_NEEDS_INTERVENTION,
                    format!(
                        "{} failures reached the limit of {}",
                        col.status.dgs_times_failed, col.spec.dgs_max_failures
                    ),
                );
            }
            return Ok(());
        }

        let mut handled: u32 = 0;
        for dgs in failed {
            let dgs_key = dgs.key();
            match col.spec.dgs_fail_behavior {
                FailBehavior::Remove => {
                    let name = col.metadata.name.as_str();
                    let detached = store::modify(
                        self.ctx.clients.game_servers.as_ref(),
                        &dgs_key,
                        &self.ctx.retry,
                        |latest| {
                            if latest.collection_name() != Some(name) {
                                return false;
                            }
                            latest.detach_from_collection(name);
                            true
                        },
                    )
                    .await?;
                    if detached.is_some() {
                        info!(instance = %dgs_key, "Detached failed instance");
                        handled += 1;
                    }
                }
                FailBehavior::Delete => {
                    match self
                        .ctx
                        .clients
                        .game_servers
                        .delete(&dgs_key.namespace, &dgs_key.name)
                        .await
                    {
                        Ok(()) => {
                            info!(instance = %dgs_key, "Deleted failed instance");
                            handled += 1;
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        if handled == 0 {
            return Ok(());
        }

        // The freed slots are refilled on the next pass, even when this
        // increment reaches the threshold. Only a later failure trips it.
        store::modify(
            self.ctx.clients.collections.as_ref(),
            &key,
            &self.ctx.retry,
            |latest| {
                latest.status.dgs_times_failed =
                    latest.status.dgs_times_failed.saturating_add(handled);
                true
            },
        )
        .await?;

        self.ctx.recorder.warning(
            KIND,
            &key,
            REASON_FAILED_INSTANCES,
            format!(
                "Handled {handled} failed instances with behavior {:?}",
                col.spec.dgs_fail_behavior
            ),
        );
        Ok(())
    }

    async fn scale_out(
        &self,
        col: &DedicatedGameServerCollection,
        count: usize,
    ) -> Result<(), ControllerError> {
        for _ in 0..count {
            let dgs = self.create_member(col).await?;
            info!(instance = %dgs.metadata.name, "Created instance");
        }
        self.ctx.recorder.normal(
            KIND,
            &col.key(),
            REASON_REPLICAS_INCREASED,
            format!("Created {count} instances"),
        );
        Ok(())
    }

    /// Create one member instance with host ports for every exposed port.
    async fn create_member(
        &self,
        col: &DedicatedGameServerCollection,
    ) -> Result<DedicatedGameServer, ControllerError> {
        let mut dgs = new_member(col, self.ctx.names.generate(&col.metadata.name));
        let key = dgs.key();
        let exposed = dgs.spec.ports_to_expose.clone();
        let mut allocated = Vec::new();

        for port in dgs
            .spec
            .template
            .ports_mut()
            .filter(|p| exposed.contains(&p.container_port))
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

        match self.ctx.clients.game_servers.create(dgs).await {
            Ok(created) => Ok(created),
            Err(e) => {
                release_ports(&self.ctx.ports, &key, &allocated).await;
                Err(e.into())
            }
        }
    }

    /// Detach a random `count` of `members` and mark them for deletion. The
    /// instance reconciler deletes each once its players have left.
    async fn scale_in(
        &self,
        col: &DedicatedGameServerCollection,
        members: &[DedicatedGameServer],
        count: usize,
    ) -> Result<(), ControllerError> {
        let name = col.metadata.name.as_str();
        let picked = rand::seq::index::sample(&mut rand::rng(), members.len(), count);

        for index in picked.iter() {
            let dgs_key = members[index].key();
            let detached = store::modify(
                self.ctx.clients.game_servers.as_ref(),
                &dgs_key,
                &self.ctx.retry,
                |latest| {
                    if latest.collection_name() != Some(name) {
                        return false;
                    }
                    latest.detach_from_collection(name);
                    latest.status.marked_for_deletion = true;
                    true
                },
            )
            .await?;
            if detached.is_some() {
                info!(instance = %dgs_key, "Marked instance for deletion");
            }
        }

        self.ctx.recorder.normal(
            KIND,
            &col.key(),
            REASON_REPLICAS_DECREASED,
            format!("Marked {count} instances for deletion"),
        );
        Ok(())
    }
}

#[async_trait]
impl SyncHandler for CollectionReconciler {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "dedicated-game-server-collection"
    }

    async fn sync(&self, key: &str) -> Result<(), Self::Error> {
        match parse_key(key) {
            Some(key) => self.reconcile(&key).await,
            None => Ok(()),
        }
    }
}

/// A new, not yet stored member of `col` named `name`.
pub fn new_member(col: &DedicatedGameServerCollection, name: String) -> DedicatedGameServer {
    let mut metadata = ObjectMeta::new(&col.metadata.namespace, name)
        .with_label(labels::COLLECTION_NAME, &col.metadata.name);
    metadata
        .owner_references
        .push(OwnerReference::controlled_by(col));

    DedicatedGameServer {
        metadata,
        spec: DedicatedGameServerSpec {
            template: col.spec.template.clone(),
            ports_to_expose: col.spec.ports_to_expose.clone(),
        },
        status: Default::default(),
    }
}

/// Healthy when every member is healthy, otherwise the first unhealthy
/// member's health. An empty collection is healthy.
pub fn collection_health(members: &[DedicatedGameServer]) -> CollectionHealth {
    members
        .iter()
        .map(|d| d.status.health)
        .find(|h| *h != GameServerHealth::Healthy)
        .map(CollectionHealth::from)
        .unwrap_or(CollectionHealth::Healthy)
}

/// Running when every member's pod runs, otherwise the first other phase.
/// Members without an observed pod count as pending.
pub fn pod_collection_state(members: &[DedicatedGameServer]) -> PodPhase {
    members
        .iter()
        .map(|d| d.status.pod_phase.unwrap_or(PodPhase::Pending))
        .find(|p| *p != PodPhase::Running)
        .unwrap_or(PodPhase::Running)
}

/// Members that are both healthy and running.
pub fn available_replicas(members: &[DedicatedGameServer]) -> u32 {
    let count = members
        .iter()
        .filter(|d| {
            d.status.health == GameServerHealth::Healthy
                && d.status.pod_phase == Some(PodPhase::Running)
        })
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Collections an instance event concerns: the one it belongs to, and the
/// one it was detached from if it still needs attention there.
fn affected_collections(dgs: &DedicatedGameServer, keys: &mut BTreeSet<ObjectKey>) {
    let ns = &dgs.metadata.namespace;
    if let Some(col) = dgs.collection_name() {
        keys.insert(ObjectKey::new(ns, col));
    } else if let Some(col) = dgs.original_collection_name() {
        if dgs.status.health == GameServerHealth::Failed || dgs.status.marked_for_deletion {
            keys.insert(ObjectKey::new(ns, col));
        }
    }
}

/// Returns true if a collection update needs a reconcile.
pub fn has_collection_changed(
    old: &DedicatedGameServerCollection,
    new: &DedicatedGameServerCollection,
) -> bool {
    old.spec.replicas != new.spec.replicas
        || old.spec.dgs_max_failures != new.spec.dgs_max_failures
        || new.status.dgs_times_failed < old.status.dgs_times_failed
}

/// Delete every member of a deleted collection. The store does not garbage
/// collect dependents.
pub async fn release_collection(ctx: &ControllerContext, col: &DedicatedGameServerCollection) {
    let key = col.key();
    let selector = LabelSelector::from_label(labels::COLLECTION_NAME, &col.metadata.name);
    let members = match ctx
        .clients
        .game_servers
        .list(Some(&col.metadata.namespace), &selector)
        .await
    {
        Ok(members) => members,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to list members of deleted collection");
            return;
        }
    };

    for dgs in members
        .iter()
        .filter(|d| d.metadata.is_owned_by(KIND, &col.metadata.name))
    {
        match ctx
            .clients
            .game_servers
            .delete(&dgs.metadata.namespace, &dgs.metadata.name)
            .await
        {
            Ok(()) => debug!(instance = %dgs.metadata.name, "Deleted member of deleted collection"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(instance = %dgs.metadata.name, error = %e, "Failed to delete member"),
        }
    }
}

/// Wire collection and instance events to `queue`.
pub fn register(informers: &Informers, queue: &WorkQueue<String>, ctx: &ControllerContext) {
    {
        let queue = queue.clone();
        let ctx = ctx.clone();
        informers.collections.add_handler(
            move |event: &WatchEvent<DedicatedGameServerCollection>| match event {
                WatchEvent::Added(col) => queue.add(col.key().to_string()),
                WatchEvent::Updated { old, new } => {
                    if has_collection_changed(old, new) {
                        queue.add(new.key().to_string());
                    }
                }
                WatchEvent::Deleted(col) => {
                    let ctx = ctx.clone();
                    let col = col.clone();
                    tokio::spawn(async move { release_collection(&ctx, &col).await });
                }
            },
        );
    }

    let queue = queue.clone();
    informers
        .game_servers
        .add_handler(move |event: &WatchEvent<DedicatedGameServer>| {
            let mut keys = BTreeSet::new();
            match event {
                WatchEvent::Added(dgs) | WatchEvent::Deleted(dgs) => {
                    affected_collections(dgs, &mut keys)
                }
                WatchEvent::Updated { old, new } => {
                    if !has_game_server_changed(old, new) {
                        return;
                    }
                    affected_collections(old, &mut keys);
                    affected_collections(new, &mut keys);
                }
            }
            for key in keys {
                queue.add(key.to_string());
            }
        });
}
