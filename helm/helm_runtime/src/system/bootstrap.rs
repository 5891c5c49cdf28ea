//! System bootstrap for the helm runtime
//!
//! Brings the runtime up in phases. Each phase only starts once the previous
//! one succeeded; if a phase fails, whatever was already started is stopped
//! again before the error is returned.

use std::fmt;
use std::sync::{Arc, Weak};

use anyhow::Result;
use helm_concurrency::{FaultObserver, FaultSink, PrimaryExecutor, PrimaryLoop, ThreadPool, Timer};
use helm_core::terminable::TerminableRegistry;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};

use super::config::RuntimeConfig;
use crate::events::{EventBus, FaultForwarder};
use crate::scheduler::Scheduler;

/// Errors that can occur during bootstrap
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A phase could not complete
    #[error("Phase {0} bootstrap failed: {1}")]
    PhaseFailed(BootstrapPhase, String),

    /// The configuration was rejected
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Bootstrap phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapPhase {
    /// Phase 0: primary loop, worker pool and timer
    Host = 0,

    /// Phase 1: event bus, fault forwarding and the scheduling facade
    Services = 1,

    /// Phase 2: periodic registry cleanup
    Maintenance = 2,

    /// System is fully bootstrapped
    Complete = 3,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Host => "host",
            Self::Services => "services",
            Self::Maintenance => "maintenance",
            Self::Complete => "complete",
        };
        write!(f, "{} ({})", *self as u8, name)
    }
}

/// Everything a running system is made of
pub struct Components {
    /// Where contained faults go
    pub sink: Arc<FaultSink>,

    /// The primary loop
    pub primary: Arc<PrimaryLoop>,

    /// Worker threads
    pub pool: Arc<ThreadPool>,

    /// Delayed and repeating tasks
    pub timer: Arc<Timer>,

    /// Event subscriptions
    pub events: EventBus,

    /// The root registry; everything the runtime owns is bound here
    pub registry: Arc<TerminableRegistry>,

    /// Scheduling facade over the executors
    pub scheduler: Scheduler,
}

/// Host executors started in phase 0
struct Host {
    primary: Arc<PrimaryLoop>,
    pool: Arc<ThreadPool>,
    timer: Arc<Timer>,
}

impl Host {
    /// Stop in reverse start order
    fn stop(&self) {
        self.timer.shutdown();
        self.pool.shutdown_and_join();
        self.primary.stop();
    }
}

/// Phased startup of a runtime
pub struct System {
    /// System configuration
    config: RuntimeConfig,

    /// Last phase reached
    phase: Mutex<BootstrapPhase>,
}

impl System {
    /// Create a new system; the configuration is validated up front
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BootstrapError::ConfigError(e.to_string()))?;

        Ok(Self {
            config,
            phase: Mutex::new(BootstrapPhase::Host),
        })
    }

    /// The configuration this system was built from
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The last phase reached
    pub fn phase(&self) -> BootstrapPhase {
        *self.phase.lock()
    }

    /// Bootstrap the system
    pub fn bootstrap(&self, sink: Arc<FaultSink>) -> Result<Components> {
        info!("Starting system bootstrap");

        let host = self.start_host(&sink)?;

        let services = self.start_services(&sink, &host);
        let (events, scheduler, registry) = match services {
            Ok(services) => services,
            Err(e) => {
                host.stop();
                return Err(e);
            }
        };

        if let Err(e) = self.start_maintenance(&host, &registry) {
            registry.terminate();
            host.stop();
            return Err(e);
        }

        *self.phase.lock() = BootstrapPhase::Complete;
        info!("System bootstrap complete");

        Ok(Components {
            sink,
            primary: host.primary,
            pool: host.pool,
            timer: host.timer,
            events,
            registry,
            scheduler,
        })
    }

    /// Phase 0: primary loop, worker pool and timer
    fn start_host(&self, sink: &Arc<FaultSink>) -> Result<Host> {
        info!("Bootstrap Phase 0: Host executors");
        *self.phase.lock() = BootstrapPhase::Host;

        let failed =
            |e: helm_core::Error| BootstrapError::PhaseFailed(BootstrapPhase::Host, e.to_string());

        let primary = PrimaryLoop::spawn(self.config.primary.loop_config(), Arc::clone(sink))
            .map_err(failed)?;

        let pool_config = self.config.workers.pool_config();
        let pool = match ThreadPool::with_config(pool_config, Arc::clone(sink)) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                primary.stop();
                return Err(failed(e).into());
            }
        };

        let timer = match Timer::start(pool.clone(), Arc::clone(sink)) {
            Ok(timer) => Arc::new(timer),
            Err(e) => {
                pool.shutdown_and_join();
                primary.stop();
                return Err(failed(e).into());
            }
        };

        debug!(
            workers = pool.worker_count(),
            primary = ?primary.primary_thread().name(),
            "Host executors started"
        );
        Ok(Host {
            primary,
            pool,
            timer,
        })
    }

    /// Phase 1: event bus, fault forwarding and the scheduling facade
    fn start_services(
        &self,
        sink: &Arc<FaultSink>,
        host: &Host,
    ) -> Result<(EventBus, Scheduler, Arc<TerminableRegistry>)> {
        info!("Bootstrap Phase 1: Services");
        *self.phase.lock() = BootstrapPhase::Services;

        let events = match self.config.events.unregister_strategy {
            Some(strategy) => {
                info!(%strategy, "Using configured unregister strategy");
                EventBus::new(Arc::clone(sink), strategy)
            }
            None => EventBus::detect(Arc::clone(sink)),
        };

        if self.config.events.forward_faults {
            let forwarder: Arc<dyn FaultObserver> = Arc::new(FaultForwarder::new(
                &events,
                host.primary.primary_thread().clone(),
            ));
            sink.add_observer(forwarder);
        }

        let scheduler = Scheduler::new(
            host.primary.clone(),
            host.pool.clone(),
            Arc::clone(&host.timer),
            Arc::clone(sink),
        );

        Ok((events, scheduler, Arc::new(TerminableRegistry::new())))
    }

    /// Phase 2: periodic registry cleanup
    fn start_maintenance(&self, host: &Host, registry: &Arc<TerminableRegistry>) -> Result<()> {
        info!("Bootstrap Phase 2: Maintenance");
        *self.phase.lock() = BootstrapPhase::Maintenance;

        if !self.config.cleanup.enabled {
            info!("Registry cleanup disabled");
            return Ok(());
        }

        let weak: Weak<TerminableRegistry> = Arc::downgrade(registry);
        let task = host
            .timer
            .schedule_repeating(
                self.config.cleanup_initial_delay(),
                self.config.cleanup_period(),
                move || {
                    if let Some(registry) = weak.upgrade() {
                        let removed = registry.cleanup();
                        if removed > 0 {
                            debug!(removed, "Removed finished resources from the root registry");
                        }
                    }
                },
            )
            .map_err(|e| BootstrapError::PhaseFailed(BootstrapPhase::Maintenance, e.to_string()))?;

        if let Err(e) = registry.bind(Arc::new(task)) {
            error!("Could not bind the cleanup task: {}", e);
            return Err(
                BootstrapError::PhaseFailed(BootstrapPhase::Maintenance, e.to_string()).into(),
            );
        }
        Ok(())
    }
}
