//! Dependencies shared by every controller.

use std::sync::Arc;

use dgs_reconcile::RetryPolicy;

use crate::clock::{Clock, SystemClock};
use crate::config::CallbackConfig;
use crate::events::{EventRecorder, TracingRecorder};
use crate::names::{NameGenerator, RandomNameGenerator};
use crate::portregistry::PortRegistry;
use crate::store::{Clients, Listers};

/// Everything a reconciler needs, passed in explicitly at construction.
///
/// Cloning is cheap; all heavy members are shared.
#[derive(Clone)]
pub struct ControllerContext {
    pub clients: Clients,
    pub listers: Listers,
    pub ports: PortRegistry,
    pub recorder: Arc<dyn EventRecorder>,
    pub clock: Arc<dyn Clock>,
    pub names: Arc<dyn NameGenerator>,
    pub callbacks: CallbackConfig,
    pub retry: RetryPolicy,
}

impl ControllerContext {
    /// Create a context with the system clock, random names and log-only events.
    pub fn new(clients: Clients, listers: Listers, ports: PortRegistry) -> Self {
        Self {
            clients,
            listers,
            ports,
            recorder: Arc::new(TracingRecorder),
            clock: Arc::new(SystemClock),
            names: Arc::new(RandomNameGenerator),
            callbacks: CallbackConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_names(mut self, names: Arc<dyn NameGenerator>) -> Self {
        self.names = names;
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackConfig) -> Self {
        self.callbacks = callbacks;
        self
    }
}
