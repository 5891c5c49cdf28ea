//! Shutdown manager for the helm runtime
//!
//! Shutdown runs in two phases:
//!
//! - Phase A releases resources: the root registry is terminated in reverse
//!   bind order and the event bus is closed.
//! - Phase B stops components (timer, workers, primary loop) in the order
//!   they were registered.
//!
//! A second request, concurrent or later, is a no-op.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use helm_core::terminable::TerminableRegistry;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::events::EventBus;

/// Where the runtime is in its shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,

    /// Phase A: releasing registered resources
    Releasing,

    /// Phase B: stopping components
    Stopping,

    /// Shutdown has completed
    Stopped,
}

type StopFn = Box<dyn FnOnce() + Send>;

/// Manager for system shutdown
pub struct ShutdownManager {
    /// Current phase
    phase: Mutex<ShutdownPhase>,

    /// Registered components, stopped in registration order
    components: Mutex<Vec<(String, StopFn)>>,
}

impl ShutdownManager {
    /// Create a new shutdown manager
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(ShutdownPhase::Running),
            components: Mutex::new(Vec::new()),
        }
    }

    /// Register a component to stop in phase B
    pub fn register_component<F>(&self, name: &str, stop: F)
    where
        F: FnOnce() + Send + 'static,
    {
        debug!("Registered component for shutdown: {}", name);
        self.components
            .lock()
            .push((name.to_string(), Box::new(stop)));
    }

    /// Current phase
    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.lock()
    }

    /// Number of components still waiting to be stopped
    pub fn component_count(&self) -> usize {
        self.components.lock().len()
    }

    /// Run the shutdown sequence.
    ///
    /// Returns `false` if shutdown was already requested.
    pub fn request_shutdown(&self, registry: &TerminableRegistry, events: &EventBus) -> bool {
        {
            let mut phase = self.phase.lock();
            if *phase != ShutdownPhase::Running {
                debug!("Shutdown already requested ({:?})", *phase);
                return false;
            }
            *phase = ShutdownPhase::Releasing;
        }
        info!("Initiating shutdown");

        info!("Phase A: Releasing registered resources");
        registry.terminate();
        events.close();

        *self.phase.lock() = ShutdownPhase::Stopping;
        info!("Phase B: Stopping components");

        let components = std::mem::take(&mut *self.components.lock());
        for (name, stop) in components {
            debug!("Stopping {}", name);
            if panic::catch_unwind(AssertUnwindSafe(stop)).is_err() {
                error!("Component {} panicked while stopping", name);
            }
        }

        *self.phase.lock() = ShutdownPhase::Stopped;
        info!("Shutdown complete");
        true
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownManager")
            .field("phase", &self.phase())
            .field("components", &self.component_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UnregisterStrategy;
    use helm_concurrency::FaultSink;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn test_release_then_stop() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let manager = ShutdownManager::new();
        let registry = TerminableRegistry::new();
        let events = EventBus::new(Arc::new(FaultSink::new()), UnregisterStrategy::Immediate);

        {
            let order = order.clone();
            registry
                .bind_fn(move || {
                    order.lock().unwrap().push("resource");
                    Ok(())
                })
                .unwrap();
        }
        for name in ["timer", "workers", "primary"] {
            let order = order.clone();
            manager.register_component(name, move || order.lock().unwrap().push(name));
        }

        assert!(manager.request_shutdown(&registry, &events));
        assert_eq!(manager.phase(), ShutdownPhase::Stopped);
        assert!(events.is_closed());
        assert_eq!(
            *order.lock().unwrap(),
            vec!["resource", "timer", "workers", "primary"]
        );
    }

    #[test]
    fn test_second_request_is_noop() {
        let manager = ShutdownManager::new();
        let registry = TerminableRegistry::new();
        let events = EventBus::new(Arc::new(FaultSink::new()), UnregisterStrategy::Immediate);

        assert!(manager.request_shutdown(&registry, &events));
        assert!(!manager.request_shutdown(&registry, &events));
    }

    #[test]
    fn test_panicking_component_does_not_stop_others() {
        let manager = ShutdownManager::new();
        let registry = TerminableRegistry::new();
        let events = EventBus::new(Arc::new(FaultSink::new()), UnregisterStrategy::Immediate);
        let stopped = Arc::new(StdMutex::new(false));

        manager.register_component("broken", || panic!("stop failed"));
        {
            let stopped = stopped.clone();
            manager.register_component("healthy", move || *stopped.lock().unwrap() = true);
        }

        assert!(manager.request_shutdown(&registry, &events));
        assert!(*stopped.lock().unwrap());
        assert_eq!(manager.component_count(), 0);
    }
}
