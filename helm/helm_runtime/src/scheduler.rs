//! Scheduling facade.
//!
//! One place to submit work to the primary loop, the worker pool or the
//! timer. Every task submitted here is wrapped so its failures are reported
//! to the fault sink instead of reaching the executor.

use std::sync::Arc;
use std::time::Duration;

use helm_concurrency::{
    FaultSink, InterruptFlag, PrimaryExecutor, RendezvousGuard, RendezvousLock, ScheduledTask,
    Timer, WorkerExecutor,
};
use helm_core::context::ThreadContext;
use helm_core::error::Result;
use tracing::{trace, warn};

use crate::promise::Promise;

/// Submits work to the runtime's executors.
#[derive(Clone)]
pub struct Scheduler {
    primary: Arc<dyn PrimaryExecutor>,
    workers: Arc<dyn WorkerExecutor>,
    timer: Arc<Timer>,
    sink: Arc<FaultSink>,
    lock: RendezvousLock,
}

impl Scheduler {
    /// Build a facade over the given executors.
    pub fn new(
        primary: Arc<dyn PrimaryExecutor>,
        workers: Arc<dyn WorkerExecutor>,
        timer: Arc<Timer>,
        sink: Arc<FaultSink>,
    ) -> Self {
        Self {
            lock: RendezvousLock::new(Arc::clone(&primary)),
            primary,
            workers,
            timer,
            sink,
        }
    }

    /// Run `task` on the primary thread at the next tick.
    pub fn run_sync<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.primary
            .execute(Box::new(self.sink.wrap_scheduled_task(task)))
    }

    /// Run a fallible `task` on the primary thread at the next tick.
    pub fn try_run_sync<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.primary
            .execute(Box::new(self.sink.wrap_fallible_task(task)))
    }

    /// Run `task` on a worker thread.
    pub fn run_async<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.workers
            .execute(Box::new(self.sink.wrap_scheduled_task(task)))
    }

    /// Run a fallible `task` on a worker thread.
    pub fn try_run_async<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.workers
            .execute(Box::new(self.sink.wrap_fallible_task(task)))
    }

    /// Run `task` on a worker thread after `delay`.
    pub fn run_later_async<F>(&self, delay: Duration, task: F) -> Result<ScheduledTask>
    where
        F: FnOnce() + Send + 'static,
    {
        self.timer.schedule(delay, task)
    }

    /// Run `task` on the primary thread once `delay` has passed.
    pub fn run_later_sync<F>(&self, delay: Duration, task: F) -> Result<ScheduledTask>
    where
        F: FnOnce() + Send + 'static,
    {
        let primary = Arc::clone(&self.primary);
        let sink = Arc::clone(&self.sink);
        self.timer.schedule(delay, move || {
            if let Err(e) = primary.execute(Box::new(sink.wrap_scheduled_task(task))) {
                warn!("Delayed primary task dropped: {}", e);
            }
        })
    }

    /// Run `task` on worker threads after `delay`, then every `period`.
    ///
    /// Runs of one task never overlap.
    pub fn run_repeating_async<F>(
        &self,
        delay: Duration,
        period: Duration,
        task: F,
    ) -> Result<ScheduledTask>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timer.schedule_repeating(delay, period, task)
    }

    /// Run `task` on the primary thread after `delay`, then every `period`.
    ///
    /// The timer hands each run to the primary loop; a run that finds the
    /// loop stopped is dropped.
    pub fn run_repeating_sync<F>(
        &self,
        delay: Duration,
        period: Duration,
        task: F,
    ) -> Result<ScheduledTask>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let primary = Arc::clone(&self.primary);
        let sink = Arc::clone(&self.sink);
        self.timer.schedule_repeating(delay, period, move || {
            let task = Arc::clone(&task);
            if let Err(e) = primary.execute(Box::new(sink.wrap_scheduled_task(move || task()))) {
                warn!("Repeating primary task dropped: {}", e);
            }
        })
    }

    /// Compute a value on the primary thread.
    pub fn supply_sync<T, F>(&self, supplier: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Promise::completed(self, ()).then_apply_sync(move |()| supplier())
    }

    /// Compute a value on a worker.
    pub fn supply_async<T, F>(&self, supplier: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Promise::completed(self, ()).then_apply_async(move |()| supplier())
    }

    /// Compute a value on the primary thread once `delay` has passed.
    pub fn supply_delayed_sync<T, F>(&self, delay: Duration, supplier: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Promise::completed(self, ()).then_apply_delayed_sync(delay, move |()| supplier())
    }

    /// Compute a value on a worker once `delay` has passed.
    pub fn supply_delayed_async<T, F>(&self, delay: Duration, supplier: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Promise::completed(self, ()).then_apply_delayed_async(delay, move |()| supplier())
    }

    /// Compute a value on a worker, then hand it to `then` on the primary
    /// thread.
    ///
    /// If either step fails, the failure is reported as a promise-chain
    /// fault and the returned promise completes exceptionally.
    pub fn supply_async_then_sync<T, S, C>(&self, supplier: S, then: C) -> Promise<()>
    where
        T: Clone + Send + 'static,
        S: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(T) -> Result<()> + Send + 'static,
    {
        self.supply_async(supplier).then_accept_sync(then)
    }

    /// Hand `task` to the executor for `context`, through the timer when
    /// `delay` is set.
    pub(crate) fn submit<F>(
        &self,
        context: ThreadContext,
        delay: Option<Duration>,
        task: F,
    ) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match (context.is_primary(), delay) {
            (true, None) => self.run_sync(task),
            (false, None) => self.run_async(task),
            (true, Some(delay)) => self.run_later_sync(delay, task).map(drop),
            (false, Some(delay)) => self.run_later_async(delay, task).map(drop),
        }
    }

    /// The sink every wrapped task reports to.
    pub fn faults(&self) -> &Arc<FaultSink> {
        &self.sink
    }

    /// Block until the primary loop is parked for the caller.
    ///
    /// From the primary thread this returns immediately. See
    /// [`RendezvousLock`] for the protocol and its limits.
    pub fn rendezvous(&self) -> Result<RendezvousGuard> {
        trace!(context = %self.current_context(), "Requesting rendezvous");
        self.lock.acquire()
    }

    /// Like [`rendezvous`](Self::rendezvous), but gives up once `flag` is
    /// raised.
    pub fn rendezvous_interruptible(&self, flag: &InterruptFlag) -> Result<RendezvousGuard> {
        self.lock.acquire_interruptible(flag)
    }

    /// Classify the calling thread.
    pub fn current_context(&self) -> ThreadContext {
        self.primary.current_context()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("primary", self.primary.primary_thread())
            .field("timer", &self.timer)
            .finish()
    }
}
