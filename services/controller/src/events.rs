//! Controller event recording.
//!
//! Reconcilers report notable outcomes (a collection synced, replicas added,
//! a threshold tripped) as events attached to the object they concern.

use std::sync::{Mutex, PoisonError};

use dgs_api::ObjectKey;
use tracing::{info, warn};

pub const REASON_SYNCED: &str = "Synced";
pub const REASON_REPLICAS_INCREASED: &str = "ReplicasIncreased";
pub const REASON_REPLICAS_DECREASED: &str = "ReplicasDecreased";
pub const REASON_FAILED_INSTANCES: &str = "FailedInstancesHandled";
pub const REASON_NEEDS_INTERVENTION: &str = "NeedsIntervention";
pub const REASON_POD_CREATED: &str = "PodCreated";
pub const REASON_INSTANCE_DELETED: &str = "InstanceDeleted";
pub const REASON_SCALED: &str = "Autoscaled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: &'static str,
    pub object: ObjectKey,
    pub event_type: EventType,
    pub reason: &'static str,
    pub message: String,
}

/// Sink for controller events.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);

    fn normal(&self, kind: &'static str, object: &ObjectKey, reason: &'static str, message: String) {
        self.record(Event {
            kind,
            object: object.clone(),
            event_type: EventType::Normal,
            reason,
            message,
        });
    }

    fn warning(&self, kind: &'static str, object: &ObjectKey, reason: &'static str, message: String) {
        self.record(Event {
            kind,
            object: object.clone(),
            event_type: EventType::Warning,
            reason,
            message,
        });
    }
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                kind = event.kind,
                object = %event.object,
                reason = event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                kind = event.kind,
                object = %event.object,
                reason = event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reasons recorded for `object`, oldest first.
    pub fn reasons_for(&self, object: &ObjectKey) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| &e.object == object)
            .map(|e| e.reason)
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
