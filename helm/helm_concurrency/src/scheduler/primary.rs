//! Reference primary loop.
//!
//! A single thread that wakes once per tick and runs every task queued
//! before the tick started, in submission order. Tasks queued while a tick
//! is running wait for the next tick. Every task runs fault-contained, so a
//! panicking task never takes the loop down.
//!
//! The loop can either own its thread ([`PrimaryLoop::spawn`]) or be driven
//! by a host that already has one ([`PrimaryLoop::attach`] plus
//! [`PrimaryLoop::tick`]).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use helm_core::context::PrimaryThread;
use helm_core::error::{ConcurrencyError, Result};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use super::{PrimaryExecutor, Task};
use crate::fault::FaultSink;

/// Configuration for a primary loop
#[derive(Debug, Clone)]
pub struct PrimaryLoopConfig {
    /// Time between the starts of two ticks
    pub tick_interval: Duration,

    /// Maximum number of queued tasks
    pub queue_capacity: usize,

    /// Name of the spawned thread
    pub thread_name: String,
}

impl Default for PrimaryLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            queue_capacity: 4096,
            thread_name: "helm-primary".to_string(),
        }
    }
}

/// A tick-driven single-threaded executor.
pub struct PrimaryLoop {
    /// Identity of the loop thread
    primary: PrimaryThread,

    /// Task queue; the sending side is dropped on stop
    sender: RwLock<Option<Sender<Task>>>,
    receiver: Receiver<Task>,

    /// Where task panics are reported
    sink: Arc<FaultSink>,

    /// Whether the loop accepts and runs tasks
    running: AtomicBool,

    /// Completed ticks
    ticks: AtomicU64,

    /// Loop thread, when spawned
    handle: Mutex<Option<JoinHandle<()>>>,

    config: PrimaryLoopConfig,
}

impl PrimaryLoop {
    /// Designate the calling thread as the primary thread.
    ///
    /// The caller is responsible for calling [`tick`](Self::tick)
    /// periodically, or for handing the thread to [`run`](Self::run).
    pub fn attach(config: PrimaryLoopConfig, sink: Arc<FaultSink>) -> Arc<Self> {
        let (sender, receiver) = bounded(config.queue_capacity);
        let primary = PrimaryThread::capture();

        debug!(
            "Primary loop attached to thread {:?} ({:?})",
            primary.id(),
            primary.name()
        );

        Arc::new(Self {
            primary,
            sender: RwLock::new(Some(sender)),
            receiver,
            sink,
            running: AtomicBool::new(true),
            ticks: AtomicU64::new(0),
            handle: Mutex::new(None),
            config,
        })
    }

    /// Start a loop on a new thread.
    pub fn spawn(config: PrimaryLoopConfig, sink: Arc<FaultSink>) -> Result<Arc<Self>> {
        let (ready_tx, ready_rx) = bounded(1);
        let thread_name = config.thread_name.clone();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let primary_loop = Self::attach(config, sink);
                if ready_tx.send(Arc::clone(&primary_loop)).is_err() {
                    return;
                }
                primary_loop.run();
            })
            .map_err(|e| ConcurrencyError::SpawnFailed(format!("{}: {}", thread_name, e)))?;

        let primary_loop: Arc<Self> = ready_rx.recv().map_err(|_| {
            ConcurrencyError::SpawnFailed(format!("{} exited during startup", thread_name))
        })?;
        *primary_loop.handle.lock() = Some(handle);

        info!(
            "Primary loop started on '{}' ({}ms ticks)",
            thread_name,
            primary_loop.config.tick_interval.as_millis()
        );
        Ok(primary_loop)
    }

    /// Drive the loop on the calling thread until [`stop`](Self::stop).
    pub fn run(&self) {
        if !self.primary.is_current() {
            error!("Primary loop run from a thread other than the primary thread");
            return;
        }

        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            // the thread check above makes this infallible
            let _ = self.tick();

            if let Some(rest) = self.config.tick_interval.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }

        let discarded = self.discard_pending();
        debug!("Primary loop exited; {} queued task(s) discarded", discarded);
    }

    /// Run the tasks queued before this call.
    ///
    /// Returns the number of tasks run.
    pub fn tick(&self) -> Result<usize> {
        if !self.primary.is_current() {
            return Err(ConcurrencyError::NotPrimaryThread.into());
        }

        let pending = self.receiver.len();
        let mut ran = 0;
        for _ in 0..pending {
            match self.receiver.try_recv() {
                Ok(task) => {
                    self.sink.run_contained(task);
                    ran += 1;
                }
                Err(_) => break,
            }
        }

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ran > 0 {
            trace!("Tick {}: ran {} task(s)", tick, ran);
        }
        Ok(ran)
    }

    /// Stop accepting tasks and end the loop.
    ///
    /// Joins the loop thread when it was spawned and this is called from
    /// another thread. Tasks still queued are dropped unrun.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping primary loop");

        // late senders see the queue closed instead of filling it
        drop(self.sender.write().take());

        if !self.primary.is_current() {
            if let Some(handle) = self.handle.lock().take() {
                if handle.join().is_err() {
                    error!("Primary loop thread panicked during shutdown");
                }
            }
        }

        let discarded = self.discard_pending();
        if discarded > 0 {
            warn!("{} task(s) submitted during shutdown were dropped", discarded);
        }
    }

    fn discard_pending(&self) -> usize {
        let mut discarded = 0;
        while let Ok(task) = self.receiver.try_recv() {
            drop(task);
            discarded += 1;
        }
        discarded
    }

    /// Whether the loop still accepts tasks.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of completed ticks.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Number of tasks waiting for a tick.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// The loop configuration.
    pub fn config(&self) -> &PrimaryLoopConfig {
        &self.config
    }
}

impl PrimaryExecutor for PrimaryLoop {
    fn primary_thread(&self) -> &PrimaryThread {
        &self.primary
    }

    fn execute(&self, task: Task) -> Result<()> {
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            return Err(ConcurrencyError::ShuttingDown.into());
        };

        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ConcurrencyError::QueueFull.into()),
            Err(TrySendError::Disconnected(_)) => Err(ConcurrencyError::ShuttingDown.into()),
        }
    }
}

impl fmt::Debug for PrimaryLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryLoop")
            .field("primary", &self.primary)
            .field("running", &self.is_running())
            .field("ticks", &self.tick_count())
            .field("pending", &self.pending())
            .finish()
    }
}
