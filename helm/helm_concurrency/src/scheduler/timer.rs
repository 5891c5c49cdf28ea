//! Delayed and repeating tasks.
//!
//! A single timer thread keeps a deadline heap and hands due tasks to a
//! [`WorkerExecutor`]. The timer thread itself never runs user code.
//!
//! Repeating tasks are scheduled at a fixed rate. A run that overruns its
//! period does not overlap with the next one: each task holds its own run
//! lock, and at most one further run may wait on it. Runs that would queue
//! behind that are skipped.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use helm_core::error::{ConcurrencyError, Error, Result};
use helm_core::id::TaskId;
use helm_core::terminable::Terminable;
use helm_core::types::cause_from_error;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use super::WorkerExecutor;
use crate::fault::FaultSink;

/// Upper bound on runs of one repeating task that may be in flight at once:
/// one running, one waiting.
const MAX_IN_FLIGHT: usize = 2;

type Job = Box<dyn Fn() + Send + Sync + 'static>;

/// Shared state of one scheduled task
struct TaskState {
    id: TaskId,
    job: Job,
    period: Option<Duration>,
    cancelled: AtomicBool,
    finished: AtomicBool,

    /// Runs submitted but not yet completed
    in_flight: AtomicUsize,

    /// Serialises runs of this task
    run_lock: Mutex<()>,

    runs: AtomicU64,
    skipped: AtomicU64,
}

/// Handle to a delayed or repeating task.
///
/// Terminating the handle cancels the task. A run already in progress
/// completes; no further runs start.
#[derive(Clone)]
pub struct ScheduledTask {
    state: Arc<TaskState>,
}

impl ScheduledTask {
    /// Id of the task.
    pub fn id(&self) -> TaskId {
        self.state.id
    }

    /// Cancel the task. Returns `true` if this call cancelled it.
    pub fn cancel(&self) -> bool {
        let cancelled = !self.state.cancelled.swap(true, Ordering::SeqCst);
        if cancelled {
            debug!("Scheduled task {} cancelled", self.state.id);
        }
        cancelled
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the task repeats.
    pub fn is_repeating(&self) -> bool {
        self.state.period.is_some()
    }

    /// Number of completed runs.
    pub fn run_count(&self) -> u64 {
        self.state.runs.load(Ordering::SeqCst)
    }

    /// Number of repeating runs skipped because earlier runs were still
    /// in flight.
    pub fn skipped_count(&self) -> u64 {
        self.state.skipped.load(Ordering::SeqCst)
    }
}

impl Terminable for ScheduledTask {
    fn terminate(&self) -> Result<()> {
        self.cancel();
        Ok(())
    }

    fn has_terminated(&self) -> bool {
        self.is_cancelled() || self.state.finished.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.state.id)
            .field("period", &self.state.period)
            .field("cancelled", &self.is_cancelled())
            .field("runs", &self.run_count())
            .finish()
    }
}

/// Heap entry; ordered so the earliest deadline is popped first
struct Entry {
    deadline: Instant,
    seq: u64,
    task: Arc<TaskState>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Command {
    Schedule(Instant, Arc<TaskState>),
    Shutdown,
}

/// Dispatches delayed and repeating tasks onto a worker executor.
pub struct Timer {
    commands: Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Timer {
    /// Start the timer thread.
    pub fn start(executor: Arc<dyn WorkerExecutor>, sink: Arc<FaultSink>) -> Result<Self> {
        let (commands, receiver) = unbounded();

        let handle = thread::Builder::new()
            .name("helm-scheduler-timer".to_string())
            .spawn(move || {
                let mut worker = TimerWorker {
                    receiver,
                    executor,
                    sink,
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                };
                worker.run();
            })
            .map_err(|e| ConcurrencyError::SpawnFailed(format!("helm-scheduler-timer: {}", e)))?;

        info!("Scheduler timer started");
        Ok(Self {
            commands,
            handle: Mutex::new(Some(handle)),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Run `task` once on a worker after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<ScheduledTask>
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Mutex::new(Some(task));
        let job: Job = Box::new(move || {
            if let Some(task) = slot.lock().take() {
                task();
            }
        });
        self.submit(delay, None, job)
    }

    /// Run `task` on a worker after `delay`, then every `period`.
    pub fn schedule_repeating<F>(
        &self,
        delay: Duration,
        period: Duration,
        task: F,
    ) -> Result<ScheduledTask>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(Error::runtime(
                "repeating task period must be greater than zero",
            ));
        }
        self.submit(delay, Some(period), Box::new(task))
    }

    fn submit(&self, delay: Duration, period: Option<Duration>, job: Job) -> Result<ScheduledTask> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ConcurrencyError::ShuttingDown.into());
        }
        let deadline = Instant::now()
            .checked_add(delay)
            .ok_or_else(|| Error::runtime(format!("delay {:?} is out of range", delay)))?;

        let state = Arc::new(TaskState {
            id: TaskId::new(),
            job,
            period,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            run_lock: Mutex::new(()),
            runs: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        });

        self.commands
            .send(Command::Schedule(deadline, Arc::clone(&state)))
            .map_err(|_| ConcurrencyError::ShuttingDown)?;

        trace!("Scheduled task {} in {:?} (period {:?})", state.id, delay, period);
        Ok(ScheduledTask { state })
    }

    /// Stop the timer thread. Pending tasks never run.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Shutdown);

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Scheduler timer thread panicked");
            }
        }
        info!("Scheduler timer stopped");
    }

    /// Whether the timer has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// State owned by the timer thread
struct TimerWorker {
    receiver: Receiver<Command>,
    executor: Arc<dyn WorkerExecutor>,
    sink: Arc<FaultSink>,
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerWorker {
    fn run(&mut self) {
        loop {
            let command = match self.heap.peek() {
                Some(next) => {
                    let wait = next.deadline.saturating_duration_since(Instant::now());
                    self.receiver.recv_timeout(wait)
                }
                None => self
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match command {
                Ok(Command::Schedule(deadline, task)) => self.push(deadline, task),
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            self.fire_due();
        }

        debug!("Scheduler timer exiting with {} pending task(s)", self.heap.len());
    }

    fn push(&mut self, deadline: Instant, task: Arc<TaskState>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            task,
        });
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        while self.heap.peek().is_some_and(|next| next.deadline <= now) {
            let Some(entry) = self.heap.pop() else {
                break;
            };

            if entry.task.cancelled.load(Ordering::SeqCst) {
                continue;
            }

            self.dispatch(&entry.task);

            if let Some(period) = entry.task.period {
                // fixed rate; a late timer does not shift later deadlines
                match entry.deadline.checked_add(period) {
                    Some(next) => self.push(next, entry.task),
                    None => {
                        warn!(
                            "Task {} cannot be rescheduled; period {:?} is out of range",
                            entry.task.id, period
                        );
                        entry.task.finished.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    fn dispatch(&self, task: &Arc<TaskState>) {
        if task.in_flight.fetch_add(1, Ordering::SeqCst) >= MAX_IN_FLIGHT {
            task.in_flight.fetch_sub(1, Ordering::SeqCst);
            task.skipped.fetch_add(1, Ordering::SeqCst);
            trace!("Task {} still busy; skipping this run", task.id);
            return;
        }

        let run_task = Arc::clone(task);
        let sink = Arc::clone(&self.sink);
        let submitted = self.executor.execute(Box::new(move || {
            {
                let _running = run_task.run_lock.lock();
                if !run_task.cancelled.load(Ordering::SeqCst) {
                    if sink.run_contained(|| (run_task.job)()) {
                        run_task.runs.fetch_add(1, Ordering::SeqCst);
                    }
                    if run_task.period.is_none() {
                        run_task.finished.store(true, Ordering::SeqCst);
                    }
                }
            }
            run_task.in_flight.fetch_sub(1, Ordering::SeqCst);
        }));

        if let Err(e) = submitted {
            task.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!("Could not hand task {} to a worker: {}", task.id, e);
            if task.period.is_none() {
                task.finished.store(true, Ordering::SeqCst);
            }
            self.sink.report_scheduler_fault(cause_from_error(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Task;

    /// Runs every task on a fresh thread
    struct SpawningExecutor;

    impl WorkerExecutor for SpawningExecutor {
        fn execute(&self, task: Task) -> Result<()> {
            thread::spawn(task);
            Ok(())
        }
    }

    fn timer() -> Timer {
        Timer::start(Arc::new(SpawningExecutor), Arc::new(FaultSink::new())).unwrap()
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_delayed_task_runs_once() {
        let timer = timer();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let task = timer
            .schedule(Duration::from_millis(10), move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || task.has_terminated()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(task.run_count(), 1);
        assert!(!task.is_cancelled());
    }

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        let timer = timer();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, delay) in [("late", 60u64), ("early", 10), ("middle", 30)] {
            let order = order.clone();
            timer
                .schedule(Duration::from_millis(delay), move || order.lock().push(name))
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || order.lock().len() == 3));
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_cancelled_task_never_runs() {
        let timer = timer();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let task = timer
            .schedule(Duration::from_millis(50), move || {
                ran_clone.store(true, Ordering::SeqCst);
            })
            .unwrap();
        task.terminate().unwrap();
        assert!(task.has_terminated());

        thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_repeating_task_stops_after_cancel() {
        let timer = timer();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let task = timer
            .schedule_repeating(Duration::ZERO, Duration::from_millis(5), move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::SeqCst) >= 3
        }));
        assert!(task.cancel());
        assert!(!task.cancel());

        // let any run already handed to a worker finish
        thread::sleep(Duration::from_millis(30));
        let after_cancel = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn test_slow_repeating_task_never_overlaps() {
        let timer = timer();
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let task = {
            let active = active.clone();
            let overlapped = overlapped.clone();
            timer
                .schedule_repeating(Duration::ZERO, Duration::from_millis(2), move || {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
        };

        assert!(wait_until(Duration::from_secs(5), || task.skipped_count() > 0));
        task.cancel();

        assert!(!overlapped.load(Ordering::SeqCst));
        assert!(task.state.in_flight.load(Ordering::SeqCst) <= MAX_IN_FLIGHT);
    }

    #[test]
    fn test_panicking_task_is_reported() {
        let sink = Arc::new(FaultSink::new());
        let timer = Timer::start(Arc::new(SpawningExecutor), sink.clone()).unwrap();

        let task = timer
            .schedule(Duration::ZERO, || panic!("timer task failed"))
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || task.has_terminated()));
        assert_eq!(sink.reported_count(), 1);
        assert_eq!(task.run_count(), 0);
    }

    #[test]
    fn test_schedule_after_shutdown_fails() {
        let timer = timer();
        timer.shutdown();
        assert!(timer.is_shutdown());
        assert!(timer.schedule(Duration::ZERO, || {}).is_err());
    }

    /// Refuses every task
    struct RejectingExecutor;

    impl WorkerExecutor for RejectingExecutor {
        fn execute(&self, _task: Task) -> Result<()> {
            Err(ConcurrencyError::QueueFull.into())
        }
    }

    #[test]
    fn test_rejected_one_shot_task_is_finished_and_reported() {
        let sink = Arc::new(FaultSink::new());
        let timer = Timer::start(Arc::new(RejectingExecutor), sink.clone()).unwrap();

        let task = timer.schedule(Duration::ZERO, || {}).unwrap();

        assert!(wait_until(Duration::from_secs(5), || task.has_terminated()));
        assert!(!task.is_cancelled());
        assert_eq!(task.run_count(), 0);
        assert!(wait_until(Duration::from_secs(5), || sink.reported_count() == 1));
    }

    #[test]
    fn test_out_of_range_delay_rejected() {
        let timer = timer();
        assert!(timer.schedule(Duration::MAX, || {}).is_err());
        assert!(timer
            .schedule_repeating(Duration::MAX, Duration::from_millis(5), || {})
            .is_err());

        // the timer keeps working
        let task = timer.schedule(Duration::ZERO, || {}).unwrap();
        assert!(wait_until(Duration::from_secs(5), || task.has_terminated()));
    }

    #[test]
    fn test_out_of_range_period_ends_task() {
        let timer = timer();
        let task = timer
            .schedule_repeating(Duration::ZERO, Duration::MAX, || {})
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || task.has_terminated()));
        assert!(wait_until(Duration::from_secs(5), || task.run_count() == 1));

        let next = timer.schedule(Duration::ZERO, || {}).unwrap();
        assert!(wait_until(Duration::from_secs(5), || next.has_terminated()));
    }

    #[test]
    fn test_zero_period_rejected() {
        let timer = timer();
        assert!(timer
            .schedule_repeating(Duration::ZERO, Duration::ZERO, || {})
            .is_err());
    }
}
