//! Event subscriptions.
//!
//! A [`Subscription`] is the handle returned when a handler is registered
//! on an [`EventBus`](super::EventBus). It is a [`Terminable`], so it can be
//! bound into a registry and unregistered when its owner shuts down.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use helm_core::error::{EventError, Result};
use helm_core::id::SubscriptionId;
use helm_core::terminable::{Terminable, TerminableRegistry};
use tracing::{debug, trace};

use super::bus::{BusInner, ErasedHandler};

/// State shared between a subscription handle and the bus entry
pub(crate) struct SubscriptionState {
    pub(crate) id: SubscriptionId,
    pub(crate) type_id: TypeId,
    pub(crate) event_type: &'static str,
    active: AtomicBool,
    calls: AtomicU64,
    max_calls: Option<u64>,
    expires_at: Option<Instant>,
    bus: Weak<BusInner>,
}

impl SubscriptionState {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether a dispatch may proceed; unregisters once the expiry time has
    /// passed.
    pub(crate) fn admit(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.expires_at.is_some_and(|at| Instant::now() >= at) {
            debug!(subscription = %self.id, "Subscription expired");
            self.unregister();
            return false;
        }
        true
    }

    /// Count one handled event; unregisters once the call limit is reached.
    pub(crate) fn record_call(&self) {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_calls.is_some_and(|max| calls >= max) {
            debug!(subscription = %self.id, calls, "Subscription reached its call limit");
            self.unregister();
        }
    }

    pub(crate) fn unregister(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }

        if let Some(bus) = self.bus.upgrade() {
            bus.on_unregister(self.type_id, self.id);
        }
        trace!(subscription = %self.id, event_type = self.event_type, "Unregistered");
        true
    }
}

/// Handle to a registered event handler.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    /// Id of the subscription.
    pub fn id(&self) -> SubscriptionId {
        self.state.id
    }

    /// Type name of the handled event.
    pub fn event_type(&self) -> &'static str {
        self.state.event_type
    }

    /// Whether the handler still receives events.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Number of events handled so far. Events rejected by a filter are not
    /// counted.
    pub fn call_count(&self) -> u64 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Stop receiving events. Returns `true` only for the call that actually
    /// unregistered the handler.
    pub fn unregister(&self) -> bool {
        self.state.unregister()
    }

    /// Bind this subscription into `registry` so it is unregistered when the
    /// registry is terminated.
    pub fn bind_with(self, registry: &TerminableRegistry) -> Result<Self> {
        registry.bind(Arc::new(self.clone()))?;
        Ok(self)
    }
}

impl Terminable for Subscription {
    fn terminate(&self) -> Result<()> {
        self.unregister();
        Ok(())
    }

    fn has_terminated(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.state.id)
            .field("event_type", &self.state.event_type)
            .field("active", &self.is_active())
            .field("calls", &self.call_count())
            .finish()
    }
}

type Filter<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type Handler<E> = Box<dyn Fn(&E) -> Result<()> + Send + Sync>;

/// Builds a [`Subscription`] for events of type `E`.
///
/// ```ignore
/// let subscription = bus
///     .subscribe::<PlayerJoined>()
///     .filter(|e| !e.name.is_empty())
///     .expire_after_calls(1)
///     .handler(|e| greet(&e.name))
///     .register()?;
/// ```
#[must_use = "a subscription builder does nothing until registered"]
pub struct SubscriptionBuilder<E> {
    bus: Arc<BusInner>,
    filters: Vec<Filter<E>>,
    max_calls: Option<u64>,
    expire_after: Option<Duration>,
    handler: Option<Handler<E>>,
    _event: PhantomData<fn(&E)>,
}

impl<E> SubscriptionBuilder<E>
where
    E: Any + Send + Sync,
{
    pub(crate) fn new(bus: Arc<BusInner>) -> Self {
        Self {
            bus,
            filters: Vec::new(),
            max_calls: None,
            expire_after: None,
            handler: None,
            _event: PhantomData,
        }
    }

    /// Only handle events for which `filter` returns `true`.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Box::new(filter));
        self
    }

    /// Unregister after `calls` handled events.
    pub fn expire_after_calls(mut self, calls: u64) -> Self {
        self.max_calls = Some(calls);
        self
    }

    /// Unregister once `duration` has passed since registration.
    pub fn expire_after(mut self, duration: Duration) -> Self {
        self.expire_after = Some(duration);
        self
    }

    /// The handler to run for each accepted event.
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Register the handler with the bus.
    pub fn register(self) -> Result<Subscription> {
        let event_type = std::any::type_name::<E>();
        let handler = self
            .handler
            .ok_or(EventError::MissingHandler(event_type))?;

        let state = Arc::new(SubscriptionState {
            id: SubscriptionId::new(),
            type_id: TypeId::of::<E>(),
            event_type,
            active: AtomicBool::new(true),
            calls: AtomicU64::new(0),
            max_calls: self.max_calls,
            expires_at: self.expire_after.map(|d| Instant::now() + d),
            bus: Arc::downgrade(&self.bus),
        });

        if self.max_calls == Some(0) {
            // nothing to deliver
            state.active.store(false, Ordering::SeqCst);
            return Ok(Subscription { state });
        }

        let filters = self.filters;
        let erased: ErasedHandler = Arc::new(move |event: &(dyn Any + Send + Sync)| {
            let Some(event) = event.downcast_ref::<E>() else {
                return Ok(false);
            };
            if !filters.iter().all(|accept| accept(event)) {
                return Ok(false);
            }
            handler(event).map(|()| true)
        });

        self.bus.insert(Arc::clone(&state), erased)?;
        Ok(Subscription { state })
    }
}
