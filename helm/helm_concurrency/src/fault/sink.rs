//! Fault containment sink.
//!
//! Every callback boundary in helm funnels failures here. The sink logs the
//! fault and publishes it to registered observers. Observers are user code
//! too, so an observer that fails is reported as an event fault; a
//! per-thread flag makes that nested report log-only, which bounds the
//! recursion to one level.

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use helm_core::error::Result;
use helm_core::types::{cause_from_error, cause_from_panic, Fault, FaultCause};
use log::{debug, error, trace};
use parking_lot::RwLock;
use thread_local::ThreadLocal;

/// Receives published faults.
pub trait FaultObserver: Send + Sync {
    /// Handle a fault. Errors and panics raised here are contained.
    fn on_fault(&self, fault: &Fault) -> Result<()>;
}

impl<F> FaultObserver for F
where
    F: Fn(&Fault) -> Result<()> + Send + Sync,
{
    fn on_fault(&self, fault: &Fault) -> Result<()> {
        self(fault)
    }
}

/// Clears the publishing flag when a publish pass ends, even by unwinding
struct PublishGuard<'a>(&'a Cell<bool>);

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Captures, logs and republishes faults from user callbacks.
pub struct FaultSink {
    /// Registered observers
    observers: RwLock<Vec<Arc<dyn FaultObserver>>>,

    /// Per-thread "already publishing" flag
    publishing: ThreadLocal<Cell<bool>>,

    /// Number of faults reported
    reported: AtomicUsize,

    /// Number of faults logged but not republished
    suppressed: AtomicUsize,
}

impl FaultSink {
    /// Create a sink with no observers.
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            publishing: ThreadLocal::new(),
            reported: AtomicUsize::new(0),
            suppressed: AtomicUsize::new(0),
        }
    }

    /// Register an observer for published faults.
    pub fn add_observer(&self, observer: Arc<dyn FaultObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Report a failure from a scheduled task.
    pub fn report_scheduler_fault(&self, cause: FaultCause) {
        self.report(Fault::SchedulerTask { cause });
    }

    /// Report a failure from a chained continuation.
    pub fn report_promise_fault(&self, cause: FaultCause) {
        self.report(Fault::PromiseChain { cause });
    }

    /// Report a failure from a handler processing `event`.
    pub fn report_event_fault<E>(&self, event: &E, cause: FaultCause)
    where
        E: fmt::Debug + ?Sized,
    {
        self.report(Fault::EventHandler {
            event_type: std::any::type_name::<E>(),
            event: format!("{:?}", event),
            cause,
        });
    }

    fn report(&self, fault: Fault) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        error!("{}", fault);

        let flag = self.publishing.get_or(|| Cell::new(false));
        if flag.replace(true) {
            // a fault raised while this thread is already publishing one
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!("Fault raised while publishing a fault; not republished");
            return;
        }
        let _guard = PublishGuard(flag);

        self.publish(&fault);
    }

    fn publish(&self, fault: &Fault) {
        // snapshot so observers may register observers
        let observers: Vec<Arc<dyn FaultObserver>> = self.observers.read().clone();
        trace!("Publishing fault to {} observers", observers.len());

        for observer in observers {
            match panic::catch_unwind(AssertUnwindSafe(|| observer.on_fault(fault))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.report_event_fault(fault, cause_from_error(e)),
                Err(payload) => self.report_event_fault(fault, cause_from_panic(payload)),
            }
        }
    }

    /// Run `task` inline, reporting a panic as a scheduler fault.
    ///
    /// Returns `true` if the task completed normally.
    pub fn run_contained<F>(&self, task: F) -> bool
    where
        F: FnOnce(),
    {
        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => true,
            Err(payload) => {
                self.report_scheduler_fault(cause_from_panic(payload));
                false
            }
        }
    }

    /// Wrap `task` so a panic becomes a scheduler fault instead of
    /// unwinding into the executor.
    pub fn wrap_scheduled_task<F>(self: &Arc<Self>, task: F) -> impl FnOnce() + Send + 'static
    where
        F: FnOnce() + Send + 'static,
    {
        let sink = Arc::clone(self);
        move || {
            sink.run_contained(task);
        }
    }

    /// Wrap a fallible `task`; both errors and panics become scheduler faults.
    pub fn wrap_fallible_task<F>(self: &Arc<Self>, task: F) -> impl FnOnce() + Send + 'static
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let sink = Arc::clone(self);
        move || match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => sink.report_scheduler_fault(cause_from_error(e)),
            Err(payload) => sink.report_scheduler_fault(cause_from_panic(payload)),
        }
    }

    /// Wrap a continuation step; errors and panics become promise-chain
    /// faults and are handed back as the cause.
    pub fn wrap_continuation<T, U, F>(
        self: &Arc<Self>,
        step: F,
    ) -> impl FnOnce(T) -> std::result::Result<U, FaultCause> + Send + 'static
    where
        T: 'static,
        U: 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let sink = Arc::clone(self);
        move |input| {
            let cause = match panic::catch_unwind(AssertUnwindSafe(|| step(input))) {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => cause_from_error(e),
                Err(payload) => cause_from_panic(payload),
            };
            sink.report_promise_fault(Arc::clone(&cause));
            Err(cause)
        }
    }

    /// Total faults reported, including suppressed ones.
    pub fn reported_count(&self) -> usize {
        self.reported.load(Ordering::Relaxed)
    }

    /// Faults logged without being republished.
    pub fn suppressed_count(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl Default for FaultSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FaultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultSink")
            .field("observers", &self.observer_count())
            .field("reported", &self.reported_count())
            .field("suppressed", &self.suppressed_count())
            .finish()
    }
}
