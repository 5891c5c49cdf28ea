//! Chainable results of scheduled work.
//!
//! A [`Promise`] completes once, with a value, a failure or a cancellation.
//! Steps chained with `then_*` run on the primary thread or on a worker,
//! optionally after a delay, and only once the previous step produced a
//! value. A failure or cancellation skips the remaining steps and is passed
//! down the chain unchanged. Every failing step is also reported to the
//! fault sink as a promise-chain fault.
//!
//! ```no_run
//! # use helm_runtime::{Runtime, RuntimeConfig};
//! # let runtime = Runtime::builder(RuntimeConfig::default()).build()?;
//! let greeting = runtime
//!     .scheduler()
//!     .supply_async(|| Ok(load_name()))
//!     .then_apply_sync(|name| Ok(format!("hello {}", name)));
//!
//! assert_eq!(greeting.join()?, "hello helm");
//! # fn load_name() -> String { "helm".into() }
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Joining on the primary thread a promise that still waits for a sync step
//! never returns.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use helm_core::context::ThreadContext;
use helm_core::error::{PromiseError, Result};
use helm_core::types::{cause_from_error, FaultCause};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::scheduler::Scheduler;

type Outcome<T> = std::result::Result<T, PromiseError>;
type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Complete(Outcome<T>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    completed: Condvar,
}

/// Handle to a value that becomes available later.
///
/// Clones share the same completion.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    scheduler: Scheduler,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// A promise nothing has completed yet.
    pub fn empty(scheduler: &Scheduler) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
                completed: Condvar::new(),
            }),
            scheduler: scheduler.clone(),
        }
    }

    /// A promise already holding `value`.
    pub fn completed(scheduler: &Scheduler, value: T) -> Self {
        let promise = Self::empty(scheduler);
        promise.complete(value);
        promise
    }

    /// A promise that already failed with `cause`.
    pub fn failed(scheduler: &Scheduler, cause: FaultCause) -> Self {
        let promise = Self::empty(scheduler);
        promise.complete_exceptionally(cause);
        promise
    }

    /// Complete with `value`. Returns `false` if already complete.
    pub fn complete(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Complete with a failure. Returns `false` if already complete.
    pub fn complete_exceptionally(&self, cause: FaultCause) -> bool {
        self.finish(Err(PromiseError::Failed(cause)))
    }

    /// Cancel the promise. Steps chained after it never run.
    ///
    /// Returns `false` if it had already completed.
    pub fn cancel(&self) -> bool {
        let cancelled = self.finish(Err(PromiseError::Cancelled));
        if cancelled {
            trace!("Promise cancelled");
        }
        cancelled
    }

    /// Whether the promise has completed in any way.
    pub fn is_done(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Complete(_))
    }

    /// Whether the promise was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            *self.shared.state.lock(),
            State::Complete(Err(PromiseError::Cancelled))
        )
    }

    /// Whether the promise completed with a failure.
    pub fn is_completed_exceptionally(&self) -> bool {
        matches!(
            *self.shared.state.lock(),
            State::Complete(Err(PromiseError::Failed(_)))
        )
    }

    /// Block until the promise completes.
    pub fn join(&self) -> Result<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let State::Complete(outcome) = &*state {
                return outcome.clone().map_err(Into::into);
            }
            self.shared.completed.wait(&mut state);
        }
    }

    /// Block for at most `timeout`. Returns `None` if still pending.
    pub fn join_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while let State::Pending(_) = &*state {
            if self
                .shared
                .completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        match &*state {
            State::Complete(outcome) => Some(outcome.clone().map_err(Into::into)),
            State::Pending(_) => None,
        }
    }

    /// The value if complete, `value_if_absent` while pending.
    pub fn get_now(&self, value_if_absent: T) -> Result<T> {
        match &*self.shared.state.lock() {
            State::Complete(outcome) => outcome.clone().map_err(Into::into),
            State::Pending(_) => Ok(value_if_absent),
        }
    }

    /// Run `step` on the primary thread with the value.
    pub fn then_apply_sync<U, F>(&self, step: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.then_apply(ThreadContext::Primary, step)
    }

    /// Run `step` on a worker with the value.
    pub fn then_apply_async<U, F>(&self, step: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.then_apply(ThreadContext::Worker, step)
    }

    /// Run `step` on the primary thread, `delay` after the value arrives.
    pub fn then_apply_delayed_sync<U, F>(&self, delay: Duration, step: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.then_apply_delayed(ThreadContext::Primary, delay, step)
    }

    /// Run `step` on a worker, `delay` after the value arrives.
    pub fn then_apply_delayed_async<U, F>(&self, delay: Duration, step: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.then_apply_delayed(ThreadContext::Worker, delay, step)
    }

    /// Consume the value on the primary thread.
    pub fn then_accept_sync<F>(&self, action: F) -> Promise<()>
    where
        F: FnOnce(T) -> Result<()> + Send + 'static,
    {
        self.then_apply(ThreadContext::Primary, action)
    }

    /// Consume the value on a worker.
    pub fn then_accept_async<F>(&self, action: F) -> Promise<()>
    where
        F: FnOnce(T) -> Result<()> + Send + 'static,
    {
        self.then_apply(ThreadContext::Worker, action)
    }

    /// Run `step` in `context` with the value.
    pub fn then_apply<U, F>(&self, context: ThreadContext, step: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.chain(context, None, step)
    }

    /// Run `step` in `context`, `delay` after the value arrives.
    pub fn then_apply_delayed<U, F>(
        &self,
        context: ThreadContext,
        delay: Duration,
        step: F,
    ) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.chain(context, Some(delay), step)
    }

    fn chain<U, F>(&self, context: ThreadContext, delay: Option<Duration>, step: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let next = Promise::empty(&self.scheduler);
        let target = next.clone();
        let scheduler = self.scheduler.clone();

        self.on_complete(Box::new(move |outcome: &Outcome<T>| {
            let value = match outcome {
                Ok(value) => value.clone(),
                Err(e) => {
                    target.finish(Err(e.clone()));
                    return;
                }
            };
            if target.is_done() {
                return;
            }

            let step = scheduler.faults().wrap_continuation(step);
            let completes = target.clone();
            let submitted = scheduler.submit(context, delay, move || {
                // cancelled while waiting for its turn
                if completes.is_done() {
                    return;
                }
                match step(value) {
                    Ok(result) => completes.complete(result),
                    Err(cause) => completes.complete_exceptionally(cause),
                };
            });
            if let Err(e) = submitted {
                target.complete_exceptionally(cause_from_error(e));
            }
        }));

        next
    }

    /// Run `listener` once the promise completes; immediately if it already
    /// has.
    fn on_complete(&self, listener: Listener<T>) {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Pending(listeners) => listeners.push(listener),
            State::Complete(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                listener(&outcome);
            }
        }
    }

    fn finish(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut state = self.shared.state.lock();
            let State::Pending(listeners) = &mut *state else {
                return false;
            };
            let listeners = std::mem::take(listeners);
            *state = State::Complete(outcome.clone());
            listeners
        };
        self.shared.completed.notify_all();

        for listener in listeners {
            listener(&outcome);
        }
        true
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.state.lock() {
            State::Pending(listeners) => format!("pending ({} listeners)", listeners.len()),
            State::Complete(Ok(_)) => "complete".to_string(),
            State::Complete(Err(e)) => e.to_string(),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}
