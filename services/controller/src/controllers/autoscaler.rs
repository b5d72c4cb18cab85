//! Load-based collection autoscaler.
//!
//! Moves `spec.replicas` one step at a time based on the ratio of connected
//! players to total player capacity, honoring a cooldown between steps.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use dgs_api::{
    labels, AutoScalerDetails, CollectionHealth, DedicatedGameServer,
    DedicatedGameServerCollection, LabelSelector, ObjectKey, PodPhase, Resource,
};
use dgs_reconcile::{SyncHandler, WorkQueue};
use tracing::{debug, info, instrument, warn};

use super::{parse_key, ControllerError};
use crate::events::REASON_SCALED;
use crate::state::ControllerContext;
use crate::store::{Informers, WatchEvent};

/// Direction of a single scale step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Out,
    In,
}

pub struct AutoscalerReconciler {
    ctx: ControllerContext,
}

impl AutoscalerReconciler {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// Evaluate one collection and apply at most one scale step. Returns the
    /// step taken, if any.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Option<ScaleDecision>, ControllerError> {
        let Some(col) = self
            .ctx
            .listers
            .collections
            .get(&key.namespace, &key.name)
            .await?
        else {
            return Ok(None);
        };
        if col.is_terminating() {
            return Ok(None);
        }
        let Some(details) = col.active_autoscaler() else {
            return Ok(None);
        };

        if col.status.dgs_collection_health != CollectionHealth::Healthy
            || col.status.pod_collection_state != Some(PodPhase::Running)
        {
            debug!("Collection not fully healthy and running, skipping");
            return Ok(None);
        }

        let now = self.ctx.clock.now();
        if in_cooldown(details, now) {
            debug!("Cooldown in effect, skipping");
            return Ok(None);
        }

        let selector = LabelSelector::from_label(labels::COLLECTION_NAME, &col.metadata.name);
        let members = self
            .ctx
            .listers
            .game_servers
            .list(Some(&col.metadata.namespace), &selector)
            .await?;

        let Some(decision) = decide(details, &members) else {
            return Ok(None);
        };

        let mut scaled = col;
        apply_step(&mut scaled, decision, now);
        let replicas = scaled.spec.replicas;
        self.ctx.clients.collections.update(scaled).await?;

        info!(decision = ?decision, replicas, "Scaled collection");
        self.ctx.recorder.normal(
            DedicatedGameServerCollection::KIND,
            key,
            REASON_SCALED,
            format!("Scaled {} to {replicas} replicas", direction(decision)),
        );
        Ok(Some(decision))
    }
}

#[async_trait]
impl SyncHandler for AutoscalerReconciler {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "collection-autoscaler"
    }

    async fn sync(&self, key: &str) -> Result<(), Self::Error> {
        match parse_key(key) {
            Some(key) => self.reconcile(&key).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

fn direction(decision: ScaleDecision) -> &'static str {
    match decision {
        ScaleDecision::Out => "out",
        ScaleDecision::In => "in",
    }
}

/// Returns true if the last scale step happened within the cooldown window.
///
/// A timestamp that does not parse is ignored.
pub fn in_cooldown(details: &AutoScalerDetails, now: DateTime<Utc>) -> bool {
    let Some(raw) = details.last_scale_operation_date_time.as_deref() else {
        return false;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(last) => {
            now.signed_duration_since(last.with_timezone(&Utc))
                <= Duration::minutes(i64::from(details.cool_down_in_minutes))
        }
        Err(e) => {
            warn!(
                last_scale_operation = raw,
                error = %e,
                "Cannot parse last scale time, ignoring cooldown"
            );
            false
        }
    }
}

/// Decide on a scale step from the current player load of the running members.
pub fn decide(details: &AutoScalerDetails, members: &[DedicatedGameServer]) -> Option<ScaleDecision> {
    let running: Vec<&DedicatedGameServer> = members
        .iter()
        .filter(|d| d.status.pod_phase == Some(PodPhase::Running))
        .collect();
    let replicas = u32::try_from(running.len()).unwrap_or(u32::MAX);
    if replicas == 0 || details.max_players_per_server == 0 {
        return None;
    }

    let players: u64 = running.iter().map(|d| u64::from(d.status.active_players)).sum();
    let capacity = u64::from(details.max_players_per_server) * u64::from(replicas);
    let load = players as f64 / capacity as f64;
    let scale_out_at = f64::from(details.scale_out_threshold) / 100.0;
    let scale_in_at = f64::from(details.scale_in_threshold) / 100.0;

    debug!(players, capacity, load, replicas, "Evaluated load");

    if replicas < details.maximum_replicas && load > scale_out_at {
        Some(ScaleDecision::Out)
    } else if replicas > details.minimum_replicas && load < scale_in_at {
        Some(ScaleDecision::In)
    } else {
        None
    }
}

/// Move replicas one step, stamp the scale time and hand the collection back
/// to the collection reconciler.
pub fn apply_step(col: &mut DedicatedGameServerCollection, decision: ScaleDecision, now: DateTime<Utc>) {
    col.spec.replicas = match decision {
        ScaleDecision::Out => col.spec.replicas.saturating_add(1),
        ScaleDecision::In => col.spec.replicas.saturating_sub(1),
    };
    if let Some(details) = col.spec.autoscaler_details.as_mut() {
        details.last_scale_operation_date_time =
            Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    col.status.dgs_collection_health = CollectionHealth::Creating;
}

/// Wire collection and member instance events to `queue`.
pub fn register(informers: &Informers, queue: &WorkQueue<String>) {
    {
        let queue = queue.clone();
        informers
            .collections
            .add_handler(move |event: &WatchEvent<DedicatedGameServerCollection>| match event {
                WatchEvent::Added(col) | WatchEvent::Updated { new: col, .. } => {
                    if col.active_autoscaler().is_some() {
                        queue.add(col.key().to_string());
                    }
                }
                WatchEvent::Deleted(_) => {}
            });
    }

    let queue = queue.clone();
    informers
        .game_servers
        .add_handler(move |event: &WatchEvent<DedicatedGameServer>| {
            if let WatchEvent::Updated { new, .. } = event {
                if let Some(col) = new.collection_name() {
                    queue.add(ObjectKey::new(&new.metadata.namespace, col).to_string());
                }
            }
        });
}
