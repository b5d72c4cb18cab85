//! Resource model for the game server fleet control plane.
//!
//! Two managed kinds live here, [`DedicatedGameServer`] and
//! [`DedicatedGameServerCollection`], along with the orchestrator objects the
//! controllers read and write ([`Pod`], [`Node`]) and the shared metadata
//! types every object carries.
//!
//! All types serialize to camelCase JSON so manifests look like the objects
//! an orchestrator would store.

pub mod collection;
pub mod error;
pub mod gameserver;
pub mod labels;
pub mod meta;
pub mod pod;

pub use collection::{
    AutoScalerDetails, CollectionHealth, DedicatedGameServerCollection,
    DedicatedGameServerCollectionSpec, DedicatedGameServerCollectionStatus, FailBehavior,
};
pub use error::KeyError;
pub use gameserver::{
    DedicatedGameServer, DedicatedGameServerSpec, DedicatedGameServerStatus, GameServerHealth,
    GameServerState,
};
pub use meta::{LabelSelector, ObjectKey, ObjectMeta, OwnerReference, Resource};
pub use pod::{
    ContainerPort, ContainerSpec, EnvVar, Node, NodeAddress, NodeAddressType, NodeStatus, Pod,
    PodPhase, PodSpec, PodStatus, PodTemplate, Protocol, ResourceLimits, RestartPolicy,
};
