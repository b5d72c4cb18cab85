//! Seed manifest loaded into the store at startup.

use std::path::Path;

use anyhow::{Context, Result};
use dgs_api::{DedicatedGameServer, DedicatedGameServerCollection, Node, Pod, Resource};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{Clients, ResourceClient};

/// Objects an operator wants present before the controllers start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub collections: Vec<DedicatedGameServerCollection>,
    #[serde(default)]
    pub game_servers: Vec<DedicatedGameServer>,
    #[serde(default)]
    pub pods: Vec<Pod>,
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid manifest {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Create every object. Objects that already exist are left as they are.
    pub async fn apply(self, clients: &Clients) -> Result<()> {
        let nodes = create_all(clients.nodes.as_ref(), self.nodes).await?;
        let collections = create_all(clients.collections.as_ref(), self.collections).await?;
        let game_servers = create_all(clients.game_servers.as_ref(), self.game_servers).await?;
        let pods = create_all(clients.pods.as_ref(), self.pods).await?;
        info!(nodes, collections, game_servers, pods, "Seed manifest applied");
        Ok(())
    }
}

async fn create_all<K: Resource>(client: &dyn ResourceClient<K>, objects: Vec<K>) -> Result<usize> {
    let mut created = 0;
    for obj in objects {
        let key = obj.key();
        match client.create(obj).await {
            Ok(_) => created += 1,
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e).with_context(|| format!("failed to create {} {key}", K::KIND)),
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgs_api::LabelSelector;

    const MANIFEST: &str = r#"{
        "nodes": [
            {
                "metadata": { "name": "node-1" },
                "status": { "addresses": [{ "type": "ExternalIP", "address": "52.1.1.1" }] }
            }
        ],
        "collections": [
            {
                "metadata": { "name": "arena", "namespace": "default" },
                "spec": {
                    "replicas": 3,
                    "template": {
                        "containers": [{
                            "name": "server",
                            "image": "example/arena:1.0",
                            "ports": [{ "containerPort": 7777, "protocol": "UDP" }]
                        }]
                    },
                    "portsToExpose": [7777],
                    "dgsFailBehavior": "Delete",
                    "dgsMaxFailures": 4
                }
            }
        ]
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        assert_eq!(manifest.nodes.len(), 1);
        assert_eq!(manifest.nodes[0].reachable_address(), Some("52.1.1.1"));
        let col = &manifest.collections[0];
        assert_eq!(col.spec.replicas, 3);
        assert_eq!(col.spec.dgs_max_failures, 4);
        assert_eq!(col.spec.template.containers[0].ports[0].container_port, 7777);
        assert!(manifest.game_servers.is_empty());
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let clients = Clients::in_memory();
        Manifest::from_json(MANIFEST).unwrap().apply(&clients).await.unwrap();
        Manifest::from_json(MANIFEST).unwrap().apply(&clients).await.unwrap();

        let cols = clients
            .collections
            .list(None, &LabelSelector::everything())
            .await
            .unwrap();
        assert_eq!(cols.len(), 1);
        assert!(clients.nodes.get("", "node-1").await.unwrap().is_some());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Manifest::from_json("{ \"collections\": 3 }").is_err());
    }
}
