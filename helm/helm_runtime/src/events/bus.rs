//! Typed event bus.
//!
//! Handlers are keyed by the concrete event type. Dispatch works on a
//! snapshot of the handler list, so handlers may subscribe, unregister or
//! post further events without deadlocking the table. A handler that fails
//! is reported to the fault sink as an event fault and the remaining
//! handlers still run.

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use helm_concurrency::FaultSink;
use helm_core::error::{EventError, Result};
use helm_core::id::SubscriptionId;
use helm_core::types::{cause_from_error, cause_from_panic};
use tracing::{debug, info, trace};

use super::strategy::UnregisterStrategy;
use super::subscription::{SubscriptionBuilder, SubscriptionState};

/// Type-erased handler. Returns `Ok(false)` when the event was filtered out.
pub(crate) type ErasedHandler =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<bool> + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    state: Arc<SubscriptionState>,
    handler: ErasedHandler,
}

pub(crate) struct BusInner {
    handlers: DashMap<TypeId, Vec<HandlerEntry>>,
    sink: Arc<FaultSink>,
    strategy: UnregisterStrategy,
    closed: AtomicBool,
    posted: AtomicU64,
}

impl BusInner {
    pub(crate) fn insert(&self, state: Arc<SubscriptionState>, handler: ErasedHandler) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventError::BusClosed.into());
        }

        trace!(subscription = %state.id, event_type = state.event_type, "Registering handler");
        self.handlers
            .entry(state.type_id)
            .or_default()
            .push(HandlerEntry { state, handler });
        Ok(())
    }

    pub(crate) fn on_unregister(&self, type_id: TypeId, id: SubscriptionId) {
        if self.strategy != UnregisterStrategy::Immediate {
            return;
        }
        if let Some(mut entries) = self.handlers.get_mut(&type_id) {
            entries.retain(|entry| entry.state.id != id);
        }
    }

    fn sweep(&self, type_id: TypeId) {
        if let Some(mut entries) = self.handlers.get_mut(&type_id) {
            let before = entries.len();
            entries.retain(|entry| entry.state.is_active());
            trace!(removed = before - entries.len(), "Swept unregistered handlers");
        }
    }

    pub(crate) fn post<E>(&self, event: &E) -> usize
    where
        E: Any + Send + Sync + fmt::Debug,
    {
        if self.closed.load(Ordering::SeqCst) {
            return 0;
        }
        self.posted.fetch_add(1, Ordering::Relaxed);

        let type_id = TypeId::of::<E>();
        // the shard guard must be gone before any handler runs
        let snapshot: Vec<HandlerEntry> = match self.handlers.get(&type_id) {
            Some(entries) => entries.clone(),
            None => return 0,
        };

        if self.strategy == UnregisterStrategy::Deferred
            && snapshot.iter().any(|entry| !entry.state.is_active())
        {
            self.sweep(type_id);
        }

        let mut handled = 0;
        for entry in snapshot {
            if !entry.state.admit() {
                continue;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(event)));
            match outcome {
                Ok(Ok(false)) => continue,
                Ok(Ok(true)) => {}
                Ok(Err(e)) => self.sink.report_event_fault(event, cause_from_error(e)),
                Err(payload) => self.sink.report_event_fault(event, cause_from_panic(payload)),
            }

            handled += 1;
            entry.state.record_call();
        }
        handled
    }
}

/// Dispatches events to typed subscriptions.
///
/// Cloning the bus is cheap; clones share one handler table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Whether this bus can drop a single handler from its table.
    pub const SUPPORTS_DIRECT_REMOVAL: bool = true;

    /// Create a bus that uses `strategy` to remove unregistered handlers.
    pub fn new(sink: Arc<FaultSink>, strategy: UnregisterStrategy) -> Self {
        debug!(%strategy, "Creating event bus");
        Self {
            inner: Arc::new(BusInner {
                handlers: DashMap::new(),
                sink,
                strategy,
                closed: AtomicBool::new(false),
                posted: AtomicU64::new(0),
            }),
        }
    }

    /// Create a bus with the strategy detected for this host.
    pub fn detect(sink: Arc<FaultSink>) -> Self {
        Self::new(
            sink,
            UnregisterStrategy::detect(Self::SUPPORTS_DIRECT_REMOVAL),
        )
    }

    pub(crate) fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<BusInner> {
        Arc::downgrade(&self.inner)
    }

    /// Start building a subscription for events of type `E`.
    pub fn subscribe<E>(&self) -> SubscriptionBuilder<E>
    where
        E: Any + Send + Sync,
    {
        SubscriptionBuilder::new(Arc::clone(&self.inner))
    }

    /// Dispatch `event` to every active handler registered for `E`.
    ///
    /// Returns the number of handlers that accepted the event.
    pub fn post<E>(&self, event: &E) -> usize
    where
        E: Any + Send + Sync + fmt::Debug,
    {
        self.inner.post(event)
    }

    /// The removal strategy chosen at construction.
    pub fn strategy(&self) -> UnregisterStrategy {
        self.inner.strategy
    }

    /// Number of handler entries held for `E`, including unregistered ones
    /// awaiting a sweep.
    pub fn handler_count<E: Any>(&self) -> usize {
        self.inner
            .handlers
            .get(&TypeId::of::<E>())
            .map_or(0, |entries| entries.len())
    }

    /// Number of events posted so far.
    pub fn posted_count(&self) -> u64 {
        self.inner.posted.load(Ordering::Relaxed)
    }

    /// The sink handler faults are reported to.
    pub fn faults(&self) -> &Arc<FaultSink> {
        &self.inner.sink
    }

    /// Unregister every handler and refuse new subscriptions.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let entries: Vec<HandlerEntry> = self
            .inner
            .handlers
            .iter()
            .flat_map(|entries| entries.value().clone())
            .collect();
        self.inner.handlers.clear();

        let mut unregistered = 0;
        for entry in entries {
            if entry.state.unregister() {
                unregistered += 1;
            }
        }
        info!(unregistered, "Event bus closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("strategy", &self.inner.strategy)
            .field("event_types", &self.inner.handlers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
