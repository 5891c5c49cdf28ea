//! Fault notifications on the event bus.
//!
//! The runtime registers a [`FaultForwarder`] with its fault sink, so any
//! subsystem can observe contained faults by subscribing to
//! [`FaultEvent`]. A handler that fails while handling a `FaultEvent` is
//! itself reported, but the sink's re-entrancy guard keeps that nested
//! report out of the bus.

use std::sync::Weak;

use helm_concurrency::FaultObserver;
use helm_core::context::{PrimaryThread, ThreadContext};
use helm_core::error::Result;
use helm_core::types::Fault;

use super::bus::{BusInner, EventBus};

/// Posted on the bus for every fault the sink publishes.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    /// The contained fault
    pub fault: Fault,

    /// The context of the thread the fault was caught on
    pub context: ThreadContext,
}

/// Republishes faults as [`FaultEvent`]s.
///
/// Holds the bus weakly; once the bus is gone faults are no longer
/// forwarded.
pub struct FaultForwarder {
    bus: Weak<BusInner>,
    primary: PrimaryThread,
}

impl FaultForwarder {
    /// Forward faults onto `bus`, classifying threads against `primary`.
    pub fn new(bus: &EventBus, primary: PrimaryThread) -> Self {
        Self {
            bus: bus.downgrade(),
            primary,
        }
    }
}

impl FaultObserver for FaultForwarder {
    fn on_fault(&self, fault: &Fault) -> Result<()> {
        if let Some(inner) = self.bus.upgrade() {
            EventBus::from_inner(inner).post(&FaultEvent {
                fault: fault.clone(),
                context: self.primary.current_context(),
            });
        }
        Ok(())
    }
}
