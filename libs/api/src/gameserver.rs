//! The DedicatedGameServer resource: one running game server instance.

use serde::{Deserialize, Serialize};

use crate::labels;
use crate::meta::{ObjectMeta, Resource};
use crate::pod::{PodPhase, PodTemplate};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedicatedGameServer {
    pub metadata: ObjectMeta,
    pub spec: DedicatedGameServerSpec,
    #[serde(default)]
    pub status: DedicatedGameServerStatus,
}

impl Resource for DedicatedGameServer {
    const KIND: &'static str = "DedicatedGameServer";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl DedicatedGameServer {
    /// Name of the collection this instance is an active member of.
    pub fn collection_name(&self) -> Option<&str> {
        self.metadata.label(labels::COLLECTION_NAME)
    }

    /// Name of the collection this instance was detached from.
    pub fn original_collection_name(&self) -> Option<&str> {
        self.metadata.label(labels::ORIGINAL_COLLECTION_NAME)
    }

    /// Host ports currently assigned to exposed container ports.
    pub fn exposed_host_ports(&self) -> Vec<u16> {
        self.spec
            .template
            .ports()
            .filter(|p| self.spec.ports_to_expose.contains(&p.container_port))
            .filter_map(|p| p.host_port)
            .collect()
    }

    /// Returns true if an exposed container port is still waiting for a host port.
    pub fn needs_host_ports(&self) -> bool {
        self.spec
            .template
            .ports()
            .any(|p| self.spec.ports_to_expose.contains(&p.container_port) && p.host_port.is_none())
    }

    /// Remove collection membership, remembering where the instance came from.
    pub fn detach_from_collection(&mut self, collection: &str) {
        self.metadata.owner_references.clear();
        self.metadata.labels.remove(labels::COLLECTION_NAME);
        self.metadata.labels.insert(
            labels::ORIGINAL_COLLECTION_NAME.to_string(),
            collection.to_string(),
        );
    }

    /// Returns true when the instance can accept players.
    pub fn is_ready(&self) -> bool {
        self.status.health == GameServerHealth::Healthy
            && self.status.pod_phase == Some(PodPhase::Running)
            && !self.status.marked_for_deletion
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedicatedGameServerSpec {
    pub template: PodTemplate,
    /// Container ports that must be reachable from outside the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports_to_expose: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedicatedGameServerStatus {
    #[serde(default)]
    pub health: GameServerHealth,
    #[serde(default)]
    pub state: GameServerState,
    /// Mirrored from the bound pod; unset until a pod has been observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_phase: Option<PodPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub active_players: u32,
    #[serde(default)]
    pub marked_for_deletion: bool,
}

/// Instance health as reported by the game server process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameServerHealth {
    #[default]
    Creating,
    Healthy,
    Failed,
}

impl std::fmt::Display for GameServerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Healthy => "Healthy",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Game session state as reported by the game server process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameServerState {
    #[default]
    Idle,
    Assigned,
    Running,
    PostMatch,
}

impl std::fmt::Display for GameServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Assigned => "Assigned",
            Self::Running => "Running",
            Self::PostMatch => "PostMatch",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{ContainerPort, ContainerSpec, Protocol};

    fn game_server() -> DedicatedGameServer {
        let mut game = ContainerPort::new(7777, Protocol::Udp);
        game.host_port = Some(20001);
        let metrics = ContainerPort::new(9100, Protocol::Tcp);
        let query = ContainerPort::new(27015, Protocol::Udp);

        DedicatedGameServer {
            metadata: ObjectMeta::new("default", "arena-abcde")
                .with_label(labels::COLLECTION_NAME, "arena"),
            spec: DedicatedGameServerSpec {
                template: PodTemplate {
                    containers: vec![ContainerSpec {
                        name: "server".to_string(),
                        image: "example/arena:1.0".to_string(),
                        ports: vec![game, metrics, query],
                        ..Default::default()
                    }],
                },
                ports_to_expose: vec![7777, 27015],
            },
            status: DedicatedGameServerStatus::default(),
        }
    }

    #[test]
    fn test_exposed_host_ports() {
        let mut dgs = game_server();
        assert_eq!(dgs.exposed_host_ports(), vec![20001]);
        assert!(dgs.needs_host_ports());

        for port in dgs.spec.template.ports_mut() {
            if port.container_port == 27015 {
                port.host_port = Some(20002);
            }
        }
        assert_eq!(dgs.exposed_host_ports(), vec![20001, 20002]);
        assert!(!dgs.needs_host_ports());
    }

    #[test]
    fn test_detach_from_collection() {
        let mut dgs = game_server();
        dgs.metadata.owner_references.push(crate::OwnerReference {
            kind: "DedicatedGameServerCollection".to_string(),
            name: "arena".to_string(),
            uid: None,
            controller: true,
        });

        dgs.detach_from_collection("arena");

        assert!(dgs.metadata.owner_references.is_empty());
        assert_eq!(dgs.collection_name(), None);
        assert_eq!(dgs.original_collection_name(), Some("arena"));
    }

    #[test]
    fn test_ready() {
        let mut dgs = game_server();
        assert!(!dgs.is_ready());

        dgs.status.health = GameServerHealth::Healthy;
        dgs.status.pod_phase = Some(PodPhase::Running);
        assert!(dgs.is_ready());

        dgs.status.marked_for_deletion = true;
        assert!(!dgs.is_ready());
    }

    #[test]
    fn test_status_json_shape() {
        let mut dgs = game_server();
        dgs.status.active_players = 3;
        dgs.status.public_ip = Some("52.1.1.1".to_string());

        let json = serde_json::to_value(&dgs.status).unwrap();
        assert_eq!(json["activePlayers"], 3);
        assert_eq!(json["publicIp"], "52.1.1.1");
        assert_eq!(json["health"], "Creating");
        assert_eq!(json["markedForDeletion"], false);
    }
}
