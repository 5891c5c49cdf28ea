//! Worker thread pool.
//!
//! A fixed set of worker threads draining a bounded queue. Panics raised by
//! tasks are caught on the worker and reported to the fault sink as
//! scheduler faults; the worker carries on with the next task.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use helm_core::error::{ConcurrencyError, Result};
use helm_core::types::cause_from_panic;
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::fault::FaultSink;
use crate::scheduler::{Task, WorkerExecutor};

/// How long an idle worker waits before re-checking the shutdown flag
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Statistics about the thread pool
#[derive(Debug, Default, Clone)]
pub struct ThreadPoolStats {
    /// Number of tasks queued
    pub tasks_queued: usize,

    /// Number of tasks completed
    pub tasks_completed: usize,

    /// Number of tasks that panicked
    pub tasks_panicked: usize,

    /// Total task execution time (microseconds)
    pub total_execution_time_us: u64,

    /// Queue wait time (microseconds)
    pub total_queue_time_us: u64,

    /// Maximum task execution time (microseconds)
    pub max_execution_time_us: u64,
}

/// Configuration for the thread pool
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Maximum size of the task queue
    pub queue_size: usize,

    /// Number of worker threads
    pub worker_threads: usize,

    /// Name prefix for worker threads
    pub thread_name_prefix: String,

    /// Whether to collect performance statistics
    pub collect_stats: bool,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            worker_threads: num_cpus::get(),
            thread_name_prefix: "helm-worker".to_string(),
            collect_stats: true,
        }
    }
}

/// A queued task with its enqueue time
struct QueuedTask {
    func: Task,
    enqueued_at: Instant,
}

/// Counters shared between the pool handle and its workers
#[derive(Default)]
struct Counters {
    tasks_queued: AtomicUsize,
    tasks_completed: AtomicUsize,
    tasks_panicked: AtomicUsize,
    total_execution_time_us: AtomicUsize,
    total_queue_time_us: AtomicUsize,
    max_execution_time_us: AtomicUsize,
}

impl Counters {
    fn record_execution(&self, exec_time: Duration) {
        let exec_time_us = exec_time.as_micros() as usize;
        self.total_execution_time_us
            .fetch_add(exec_time_us, Ordering::Relaxed);
        self.max_execution_time_us
            .fetch_max(exec_time_us, Ordering::Relaxed);
    }
}

/// Everything a worker thread needs
struct WorkerContext {
    id: usize,
    receiver: Receiver<QueuedTask>,
    shutdown_flag: Arc<AtomicBool>,
    collect_stats: bool,
    counters: Arc<Counters>,
    sink: Arc<FaultSink>,
}

/// A fixed-size pool of worker threads
pub struct ThreadPool {
    /// Channel for sending tasks to worker threads
    task_sender: Sender<QueuedTask>,

    /// Worker threads, taken on join
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Number of workers started
    worker_count: usize,

    /// Flag indicating if the pool is shutting down
    is_shutting_down: Arc<AtomicBool>,

    counters: Arc<Counters>,

    config: ThreadPoolConfig,
}

impl ThreadPool {
    /// Create a pool with `threads` workers and default settings otherwise
    pub fn new(threads: usize, sink: Arc<FaultSink>) -> Result<Self> {
        let config = ThreadPoolConfig {
            worker_threads: threads,
            ..Default::default()
        };
        Self::with_config(config, sink)
    }

    /// Create a pool with the specified configuration
    pub fn with_config(config: ThreadPoolConfig, sink: Arc<FaultSink>) -> Result<Self> {
        let (task_sender, task_receiver) = bounded(config.queue_size);
        let is_shutting_down = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        info!(
            "Creating thread pool with {} workers and queue size {}",
            config.worker_threads, config.queue_size
        );

        let mut workers = Vec::with_capacity(config.worker_threads);

        for id in 0..config.worker_threads {
            let thread_name = format!("{}-{}", config.thread_name_prefix, id);
            let ctx = WorkerContext {
                id,
                receiver: task_receiver.clone(),
                shutdown_flag: Arc::clone(&is_shutting_down),
                collect_stats: config.collect_stats,
                counters: Arc::clone(&counters),
                sink: Arc::clone(&sink),
            };

            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || Self::worker_loop(ctx));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // let the workers already started wind down
                    is_shutting_down.store(true, Ordering::SeqCst);
                    return Err(ConcurrencyError::SpawnFailed(format!("{}: {}", thread_name, e))
                        .into());
                }
            }
        }

        Ok(Self {
            task_sender,
            worker_count: workers.len(),
            workers: Mutex::new(workers),
            is_shutting_down,
            counters,
            config,
        })
    }

    /// Worker thread main loop
    fn worker_loop(ctx: WorkerContext) {
        let id = ctx.id;
        debug!("Worker {}: Starting", id);

        while !ctx.shutdown_flag.load(Ordering::Relaxed) {
            let task = match ctx.receiver.recv_timeout(IDLE_POLL) {
                Ok(task) => task,
                // timeout or disconnect; re-check the shutdown flag
                Err(_) => continue,
            };

            let queue_time = task.enqueued_at.elapsed();
            if ctx.collect_stats {
                ctx.counters
                    .total_queue_time_us
                    .fetch_add(queue_time.as_micros() as usize, Ordering::Relaxed);
            }

            trace!(
                "Worker {}: Executing task (queue time: {:.2}ms)",
                id,
                queue_time.as_micros() as f64 / 1000.0
            );

            let exec_start = Instant::now();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task.func));
            let exec_time = exec_start.elapsed();

            if ctx.collect_stats {
                ctx.counters.record_execution(exec_time);
            }

            match result {
                Ok(()) => {
                    trace!(
                        "Worker {}: Task completed in {:.2}ms",
                        id,
                        exec_time.as_micros() as f64 / 1000.0
                    );
                    if ctx.collect_stats {
                        ctx.counters.tasks_completed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(payload) => {
                    if ctx.collect_stats {
                        ctx.counters.tasks_panicked.fetch_add(1, Ordering::Relaxed);
                    }
                    ctx.sink.report_scheduler_fault(cause_from_panic(payload));
                }
            }
        }

        debug!("Worker {}: Shutting down", id);
    }

    /// Submit a task to be executed by the thread pool
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(f))
    }

    fn enqueue(&self, func: Task) -> Result<()> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(ConcurrencyError::ShuttingDown.into());
        }

        let task = QueuedTask {
            func,
            enqueued_at: Instant::now(),
        };

        match self.task_sender.try_send(task) {
            Ok(()) => {
                if self.config.collect_stats {
                    self.counters.tasks_queued.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ConcurrencyError::QueueFull.into()),
            Err(TrySendError::Disconnected(_)) => Err(ConcurrencyError::ShuttingDown.into()),
        }
    }

    /// Get current statistics for the thread pool
    pub fn get_stats(&self) -> ThreadPoolStats {
        if !self.config.collect_stats {
            return ThreadPoolStats::default();
        }

        let counters = &self.counters;
        ThreadPoolStats {
            tasks_queued: counters.tasks_queued.load(Ordering::Relaxed),
            tasks_completed: counters.tasks_completed.load(Ordering::Relaxed),
            tasks_panicked: counters.tasks_panicked.load(Ordering::Relaxed),
            total_execution_time_us: counters.total_execution_time_us.load(Ordering::Relaxed)
                as u64,
            total_queue_time_us: counters.total_queue_time_us.load(Ordering::Relaxed) as u64,
            max_execution_time_us: counters.max_execution_time_us.load(Ordering::Relaxed) as u64,
        }
    }

    /// Stop accepting tasks; workers exit once they next check the flag
    pub fn shutdown(&self) {
        if !self.is_shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutting down thread pool");
        }
    }

    /// Shut down the thread pool and wait for workers to finish.
    ///
    /// Tasks still queued when the workers exit are dropped unrun.
    pub fn shutdown_and_join(&self) {
        self.shutdown();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                // joining ourselves would deadlock
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }

        info!("Thread pool shutdown complete");
    }

    /// Get the number of worker threads
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Check if the thread pool is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Relaxed)
    }
}

impl WorkerExecutor for ThreadPool {
    fn execute(&self, task: Task) -> Result<()> {
        self.enqueue(task)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        debug!("Thread pool dropped - workers will exit when they next check the shutdown flag");
    }
}
