//! Game server fleet controller.
//!
//! Reconciles `DedicatedGameServer` and `DedicatedGameServerCollection`
//! objects against an object store:
//!
//! - [`controllers::GameServerReconciler`] binds each instance to one pod and
//!   mirrors its phase and address.
//! - [`controllers::CollectionReconciler`] keeps collections at their replica
//!   count and applies fail behavior.
//! - [`controllers::AutoscalerReconciler`] adjusts replica counts from
//!   player load.
//!
//! Host ports come from a single [`portregistry::PortRegistry`] actor shared
//! by all reconcilers.

pub mod actor;
pub mod clock;
pub mod config;
pub mod controllers;
pub mod events;
pub mod manifest;
pub mod names;
pub mod pods;
pub mod portregistry;
pub mod state;
pub mod status;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
