//! The DedicatedGameServerCollection resource: a horizontally scaled fleet.

use serde::{Deserialize, Serialize};

use crate::gameserver::GameServerHealth;
use crate::meta::{ObjectMeta, Resource};
use crate::pod::{PodPhase, PodTemplate};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedicatedGameServerCollection {
    pub metadata: ObjectMeta,
    pub spec: DedicatedGameServerCollectionSpec,
    #[serde(default)]
    pub status: DedicatedGameServerCollectionStatus,
}

impl Resource for DedicatedGameServerCollection {
    const KIND: &'static str = "DedicatedGameServerCollection";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl DedicatedGameServerCollection {
    /// Returns true while the failure counter is at or past its threshold.
    pub fn failure_threshold_reached(&self) -> bool {
        self.status.dgs_times_failed >= self.spec.dgs_max_failures
    }

    /// Autoscaler settings, if autoscaling is configured and enabled.
    pub fn active_autoscaler(&self) -> Option<&AutoScalerDetails> {
        self.spec.autoscaler_details.as_ref().filter(|a| a.enabled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedicatedGameServerCollectionSpec {
    pub replicas: u32,
    pub template: PodTemplate,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports_to_expose: Vec<u16>,
    #[serde(default)]
    pub dgs_fail_behavior: FailBehavior,
    #[serde(default)]
    pub dgs_max_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler_details: Option<AutoScalerDetails>,
}

/// What happens to an instance that reports itself failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailBehavior {
    /// Detach the instance and leave it around for inspection.
    #[default]
    Remove,
    /// Delete the instance.
    Delete,
}

/// Load-based autoscaling settings.
///
/// Thresholds are percentages of total player capacity across running
/// replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoScalerDetails {
    pub minimum_replicas: u32,
    pub maximum_replicas: u32,
    pub scale_in_threshold: u32,
    pub scale_out_threshold: u32,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cool_down_in_minutes: u32,
    pub max_players_per_server: u32,
    /// RFC 3339 timestamp of the last scale operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_operation_date_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedicatedGameServerCollectionStatus {
    #[serde(default)]
    pub dgs_collection_health: CollectionHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_collection_state: Option<PodPhase>,
    #[serde(default)]
    pub available_replicas: u32,
    #[serde(default)]
    pub dgs_times_failed: u32,
}

/// Aggregate health of a collection.
///
/// `NeedsIntervention` is sticky: once entered it only clears when an
/// operator lowers the failure counter below the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionHealth {
    #[default]
    Creating,
    Healthy,
    Failed,
    NeedsIntervention,
}

impl From<GameServerHealth> for CollectionHealth {
    fn from(health: GameServerHealth) -> Self {
        match health {
            GameServerHealth::Creating => Self::Creating,
            GameServerHealth::Healthy => Self::Healthy,
            GameServerHealth::Failed => Self::Failed,
        }
    }
}

impl std::fmt::Display for CollectionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Healthy => "Healthy",
            Self::Failed => "Failed",
            Self::NeedsIntervention => "NeedsIntervention",
        };
        f.write_str(s)
    }
}
