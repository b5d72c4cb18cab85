//! Test fixtures: a fully wired controller context over in-memory stores.
//!
//! Listers read straight from the stores so every write is visible to the
//! next reconcile without waiting for an informer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dgs_api::{
    labels, AutoScalerDetails, ContainerPort, ContainerSpec, DedicatedGameServer,
    DedicatedGameServerCollection, DedicatedGameServerCollectionSpec, DedicatedGameServerSpec,
    FailBehavior, GameServerHealth, LabelSelector, Node, NodeAddress, NodeAddressType, NodeStatus,
    ObjectKey, ObjectMeta, Pod, PodPhase, PodTemplate, Protocol,
};

use crate::clock::FixedClock;
use crate::config::CallbackConfig;
use crate::controllers::{AutoscalerReconciler, CollectionReconciler, GameServerReconciler};
use crate::events::MemoryRecorder;
use crate::names::SequentialNameGenerator;
use crate::pods::build_pod;
use crate::portregistry::PortRegistry;
use crate::state::ControllerContext;
use crate::status::StatusReporter;
use crate::store::{Clients, Listers};

pub const NAMESPACE: &str = "default";
pub const GAME_PORT: u16 = 7777;

/// Time every fixture clock starts at.
pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_714_564_800, 0).unwrap_or_default()
}

/// Single-container template exposing [`GAME_PORT`] over UDP.
pub fn template() -> PodTemplate {
    PodTemplate {
        containers: vec![ContainerSpec {
            name: "server".to_string(),
            image: "example/arena:1.0".to_string(),
            ports: vec![ContainerPort::new(GAME_PORT, Protocol::Udp)],
            ..Default::default()
        }],
    }
}

/// Unparented instance with no host port assigned yet.
pub fn game_server(name: &str) -> DedicatedGameServer {
    DedicatedGameServer {
        metadata: ObjectMeta::new(NAMESPACE, name),
        spec: DedicatedGameServerSpec {
            template: template(),
            ports_to_expose: vec![GAME_PORT],
        },
        status: Default::default(),
    }
}

/// The pod the instance reconciler would create for `name`.
pub fn pod_for(name: &str) -> Pod {
    build_pod(&game_server(name), &CallbackConfig::default())
}

pub fn collection(name: &str, replicas: u32) -> DedicatedGameServerCollection {
    DedicatedGameServerCollection {
        metadata: ObjectMeta::new(NAMESPACE, name),
        spec: DedicatedGameServerCollectionSpec {
            replicas,
            template: template(),
            ports_to_expose: vec![GAME_PORT],
            dgs_fail_behavior: FailBehavior::Remove,
            dgs_max_failures: 5,
            autoscaler_details: None,
        },
        status: Default::default(),
    }
}

pub fn autoscaled_collection(
    name: &str,
    replicas: u32,
    details: AutoScalerDetails,
) -> DedicatedGameServerCollection {
    let mut col = collection(name, replicas);
    col.spec.autoscaler_details = Some(details);
    col
}

/// Controller context plus handles to every fake behind it.
pub struct Harness {
    pub clients: Clients,
    pub ports: PortRegistry,
    pub recorder: Arc<MemoryRecorder>,
    pub clock: Arc<FixedClock>,
    pub ctx: ControllerContext,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Harness with 100 ports. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_port_range(20000, 20099)
    }

    pub fn with_port_range(min: u16, max: u16) -> Self {
        let clients = Clients::in_memory();
        let (ports, _task) = match PortRegistry::new(min, max, &[]) {
            Ok(registry) => registry,
            Err(e) => panic!("invalid fixture port range {min}-{max}: {e}"),
        };
        let recorder = Arc::new(MemoryRecorder::new());
        let clock = Arc::new(FixedClock::new(start_time()));
        let ctx = ControllerContext::new(clients.clone(), Listers::direct(&clients), ports.clone())
            .with_recorder(recorder.clone())
            .with_clock(clock.clone())
            .with_names(Arc::new(SequentialNameGenerator::new()));

        Self {
            clients,
            ports,
            recorder,
            clock,
            ctx,
        }
    }

    pub fn game_servers(&self) -> GameServerReconciler {
        GameServerReconciler::new(self.ctx.clone())
    }

    pub fn collections(&self) -> CollectionReconciler {
        CollectionReconciler::new(self.ctx.clone())
    }

    pub fn autoscaler(&self) -> AutoscalerReconciler {
        AutoscalerReconciler::new(self.ctx.clone())
    }

    pub fn status(&self) -> StatusReporter {
        StatusReporter::new(self.clients.clone())
    }

    pub async fn game_server(&self, name: &str) -> Option<DedicatedGameServer> {
        self.clients
            .game_servers
            .get(NAMESPACE, name)
            .await
            .unwrap_or_default()
    }

    pub async fn collection(&self, name: &str) -> Option<DedicatedGameServerCollection> {
        self.clients
            .collections
            .get(NAMESPACE, name)
            .await
            .unwrap_or_default()
    }

    /// Instances carrying membership of collection `name`.
    pub async fn members(&self, name: &str) -> Vec<DedicatedGameServer> {
        self.clients
            .game_servers
            .list(
                Some(NAMESPACE),
                &LabelSelector::from_label(labels::COLLECTION_NAME, name),
            )
            .await
            .unwrap_or_default()
    }

    /// Every instance in the namespace, members or not.
    pub async fn all_game_servers(&self) -> Vec<DedicatedGameServer> {
        self.clients
            .game_servers
            .list(Some(NAMESPACE), &LabelSelector::everything())
            .await
            .unwrap_or_default()
    }

    pub async fn pods_of(&self, game_server: &str) -> Vec<Pod> {
        self.clients
            .pods
            .list(
                Some(NAMESPACE),
                &LabelSelector::from_label(labels::GAME_SERVER_NAME, game_server),
            )
            .await
            .unwrap_or_default()
    }

    pub async fn create_node(&self, name: &str, external: Option<&str>, internal: &str) {
        let mut addresses = vec![NodeAddress {
            kind: NodeAddressType::InternalIP,
            address: internal.to_string(),
        }];
        if let Some(external) = external {
            addresses.push(NodeAddress {
                kind: NodeAddressType::ExternalIP,
                address: external.to_string(),
            });
        }
        let node = Node {
            metadata: ObjectMeta::new("", name),
            status: NodeStatus { addresses },
        };
        if let Err(e) = self.clients.nodes.create(node).await {
            panic!("failed to create node {name}: {e}");
        }
    }

    /// Schedule the pod of `game_server` onto `node` and mark it running,
    /// as the orchestrator would.
    pub async fn run_pod(&self, game_server: &str, node: &str) {
        let Some(mut pod) = self.clients.pods.get(NAMESPACE, game_server).await.unwrap_or_default()
        else {
            panic!("no pod for {game_server}");
        };
        pod.spec.node_name = Some(node.to_string());
        pod.status.phase = PodPhase::Running;
        if let Err(e) = self.clients.pods.update(pod).await {
            panic!("failed to update pod {game_server}: {e}");
        }
    }

    /// Report every member of `name` healthy and running. Failed members stay
    /// failed.
    pub async fn mark_members_ready(&self, name: &str) {
        for mut dgs in self.members(name).await {
            if dgs.status.health == GameServerHealth::Failed {
                continue;
            }
            let key = ObjectKey::new(NAMESPACE, &dgs.metadata.name);
            dgs.status.health = GameServerHealth::Healthy;
            dgs.status.pod_phase = Some(PodPhase::Running);
            if let Err(e) = self.clients.game_servers.update(dgs).await {
                panic!("failed to mark {key} ready: {e}");
            }
        }
    }

    /// Create `col`, bring up its members healthy and running with the given
    /// player counts, and reconcile its status to Healthy/Running.
    pub async fn converged_collection(&self, col: DedicatedGameServerCollection, players: &[u32]) {
        let key = ObjectKey::new(NAMESPACE, &col.metadata.name);
        let name = col.metadata.name.clone();
        if let Err(e) = self.clients.collections.create(col).await {
            panic!("failed to create collection {key}: {e}");
        }

        let reconciler = self.collections();
        if let Err(e) = reconciler.reconcile(&key).await {
            panic!("failed to scale {key}: {e}");
        }
        self.mark_members_ready(&name).await;
        for (dgs, count) in self.members(&name).await.iter().zip(players) {
            if let Err(e) = self
                .status()
                .set_active_players(NAMESPACE, &dgs.metadata.name, *count)
                .await
            {
                panic!("failed to set players: {e}");
            }
        }
        if let Err(e) = reconciler.reconcile(&key).await {
            panic!("failed to reconcile {key}: {e}");
        }
    }
}
