//! Helm Runtime - the runtime handle for helm
//!
//! This crate wires the lower crates together: it starts the primary loop,
//! the worker pool and the timer, builds the fault sink, the event bus and the
//! root resource registry, and tears all of it down again in order.
//!
//! Code reaches the runtime through an explicit [`Runtime`] handle.
//!
//! ```no_run
//! use helm_runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::builder(RuntimeConfig::default()).build()?;
//! runtime.scheduler().run_sync(|| println!("on the primary thread"))?;
//! runtime.shutdown();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod events;
pub mod logging;
pub mod promise;
pub mod scheduler;
pub mod system;

use std::sync::Arc;

use anyhow::Result;
use helm_concurrency::{FaultObserver, FaultSink, PrimaryExecutor, PrimaryLoop};
use helm_core::context::{PrimaryThread, ThreadContext};
use helm_core::terminable::TerminableRegistry;
use tracing::info;

pub use events::{EventBus, FaultEvent, Subscription, SubscriptionBuilder, UnregisterStrategy};
pub use promise::Promise;
pub use scheduler::Scheduler;
pub use system::{RuntimeConfig, ShutdownPhase};

use system::{Components, ShutdownManager, System};

/// Builder for a [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    observers: Vec<Arc<dyn FaultObserver>>,
}

impl RuntimeBuilder {
    /// Add a fault observer before anything is started, so faults raised
    /// during startup are seen too
    pub fn with_fault_observer(mut self, observer: Arc<dyn FaultObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Start the runtime
    pub fn build(self) -> Result<Runtime> {
        info!("Initializing helm runtime");

        let system = System::new(self.config)?;

        let sink = Arc::new(FaultSink::new());
        for observer in self.observers {
            sink.add_observer(observer);
        }

        let Components {
            sink,
            primary,
            pool,
            timer,
            events,
            registry,
            scheduler,
        } = system.bootstrap(sink)?;

        let shutdown = ShutdownManager::new();
        shutdown.register_component("timer", move || timer.shutdown());
        {
            // workers waiting on a rendezvous only return once the loop runs
            // or drops their request; on the loop's own thread it never runs
            let primary = Arc::clone(&primary);
            shutdown.register_component("primary queue", move || {
                if primary.primary_thread().is_current() {
                    primary.stop();
                }
            });
        }
        shutdown.register_component("worker pool", move || pool.shutdown_and_join());
        {
            let primary = Arc::clone(&primary);
            shutdown.register_component("primary loop", move || primary.stop());
        }

        info!("helm runtime initialized");
        Ok(Runtime {
            system,
            sink,
            primary,
            events,
            registry,
            scheduler,
            shutdown,
        })
    }
}

/// Handle to a running helm runtime.
///
/// Dropping the handle shuts the runtime down.
pub struct Runtime {
    system: System,
    sink: Arc<FaultSink>,
    primary: Arc<PrimaryLoop>,
    events: EventBus,
    registry: Arc<TerminableRegistry>,
    scheduler: Scheduler,
    shutdown: ShutdownManager,
}

impl Runtime {
    /// Start building a runtime from `config`
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            observers: Vec::new(),
        }
    }

    /// Load configuration from `config_path` (or defaults) and start a runtime
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let config = RuntimeConfig::load(config_path)?;
        Self::builder(config).build()
    }

    /// The root registry; it is terminated first on shutdown
    pub fn registry(&self) -> &Arc<TerminableRegistry> {
        &self.registry
    }

    /// The fault sink
    pub fn faults(&self) -> &Arc<FaultSink> {
        &self.sink
    }

    /// The event bus
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The scheduling facade
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The primary thread
    pub fn primary_thread(&self) -> &PrimaryThread {
        self.primary.primary_thread()
    }

    /// Classify the calling thread
    pub fn current_context(&self) -> ThreadContext {
        self.primary.current_context()
    }

    /// The configuration the runtime was started with
    pub fn config(&self) -> &RuntimeConfig {
        self.system.config()
    }

    /// Where the runtime is in its shutdown
    pub fn shutdown_phase(&self) -> ShutdownPhase {
        self.shutdown.phase()
    }

    /// Shut the runtime down.
    ///
    /// Terminates the root registry in reverse bind order, closes the event
    /// bus, then stops the timer, the worker pool and the primary loop.
    /// Called on the primary thread, the loop is stopped before the pool, so
    /// workers waiting on a rendezvous get [`Interrupted`] rather than
    /// blocking the join. Returns `false` if the runtime was already shut
    /// down.
    ///
    /// [`Interrupted`]: helm_core::ConcurrencyError::Interrupted
    pub fn shutdown(&self) -> bool {
        self.shutdown.request_shutdown(&self.registry, &self.events)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("primary", self.primary_thread())
            .field("registry", &self.registry.len())
            .field("events", &self.events)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}
