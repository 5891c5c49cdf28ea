//! Rendezvous lock with the primary loop.
//!
//! A worker that needs exclusive access to primary-loop state submits a task
//! to the primary loop. When that task runs it signals "obtained" and then
//! parks the primary thread until the worker signals "done". Between the two
//! signals the worker runs with the primary loop stopped.
//!
//! ```text
//! worker                          primary loop
//! ──────                          ────────────
//! acquire() ── submit task ─────► (next tick)
//!    │ blocks                     task: send "obtained"
//!    ◄──────────────── obtained ──┘ park on "done"
//! critical section                    │ parked
//! release() ────────── done ─────────►┘ resume tick
//! ```
//!
//! Called from the primary thread the lock is obtained immediately with no
//! task submitted; the caller already excludes the loop.
//!
//! The lock is not reentrant. Acquiring it again from a worker that already
//! holds a guard submits a second task that can never run, so the worker
//! blocks forever. There is no timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use helm_core::error::{ConcurrencyError, Result};
use log::{error, trace};

use super::interrupt::InterruptFlag;
use crate::scheduler::PrimaryExecutor;

/// How often an interruptible acquirer re-checks its flag
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// State of a rendezvous handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// The request has been submitted to the primary loop
    Requested,

    /// The primary loop is parked and the holder runs exclusively
    Obtained,

    /// The primary loop has been let go
    Released,
}

/// Acquires exclusive access against a primary loop.
#[derive(Clone)]
pub struct RendezvousLock {
    executor: Arc<dyn PrimaryExecutor>,
}

impl RendezvousLock {
    /// Create a lock against the given primary loop.
    pub fn new(executor: Arc<dyn PrimaryExecutor>) -> Self {
        Self { executor }
    }

    /// Block until the primary loop is parked.
    ///
    /// Fails with [`ConcurrencyError::Interrupted`] if the primary loop
    /// discards the request without running it, and with whatever error the
    /// executor returns if the request cannot be submitted.
    pub fn acquire(&self) -> Result<RendezvousGuard> {
        self.acquire_with(None)
    }

    /// Like [`acquire`](Self::acquire), but gives up when `flag` is raised.
    ///
    /// On interruption the flag is left raised and no lock is held.
    pub fn acquire_interruptible(&self, flag: &InterruptFlag) -> Result<RendezvousGuard> {
        self.acquire_with(Some(flag))
    }

    fn acquire_with(&self, flag: Option<&InterruptFlag>) -> Result<RendezvousGuard> {
        if self.executor.current_context().is_primary() {
            trace!("Rendezvous requested on the primary thread; obtained immediately");
            return Ok(RendezvousGuard {
                state: LockState::Obtained,
                done: None,
            });
        }

        if flag.is_some_and(InterruptFlag::is_interrupted) {
            return Err(ConcurrencyError::Interrupted.into());
        }

        let (obtained_tx, obtained_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        self.executor
            .execute(Box::new(move || park_primary(obtained_tx, done_rx)))?;

        // From here on, dropping the guard lets a parked primary loop go
        let mut guard = RendezvousGuard {
            state: LockState::Requested,
            done: Some(done_tx),
        };

        match flag {
            None => {
                if obtained_rx.recv().is_err() {
                    return Err(ConcurrencyError::Interrupted.into());
                }
            }
            Some(flag) => wait_interruptible(&obtained_rx, flag)?,
        }

        guard.state = LockState::Obtained;
        trace!("Rendezvous obtained");
        Ok(guard)
    }
}

impl fmt::Debug for RendezvousLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousLock")
            .field("primary", self.executor.primary_thread())
            .finish()
    }
}

/// Runs on the primary thread.
fn park_primary(obtained: Sender<()>, done: Receiver<()>) {
    if obtained.send(()).is_err() {
        // the acquirer gave up before we ran
        trace!("Rendezvous request abandoned; not parking");
        return;
    }

    if done.recv().is_err() {
        error!("Rendezvous guard vanished without releasing the primary loop");
    }
}

fn wait_interruptible(obtained: &Receiver<()>, flag: &InterruptFlag) -> Result<()> {
    loop {
        match obtained.recv_timeout(INTERRUPT_POLL_INTERVAL) {
            Ok(()) => return Ok(()),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ConcurrencyError::Interrupted.into());
            }
            Err(RecvTimeoutError::Timeout) => {
                if flag.is_interrupted() {
                    trace!("Rendezvous acquisition interrupted");
                    return Err(ConcurrencyError::Interrupted.into());
                }
            }
        }
    }
}

/// Proof that the primary loop is parked.
///
/// Releasing the guard (explicitly or by dropping it) lets the primary loop
/// resume.
#[must_use = "dropping the guard releases the primary loop immediately"]
pub struct RendezvousGuard {
    state: LockState,
    done: Option<Sender<()>>,
}

impl RendezvousGuard {
    /// Current state of the handle.
    pub fn state(&self) -> LockState {
        self.state
    }

    /// Whether the holder currently excludes the primary loop.
    pub fn is_obtained(&self) -> bool {
        self.state == LockState::Obtained
    }

    /// Let the primary loop resume.
    pub fn release(mut self) {
        self.signal_release();
    }

    fn signal_release(&mut self) {
        if self.state == LockState::Released {
            return;
        }
        if let Some(done) = self.done.take() {
            // the channel holds one slot, so this never blocks
            let _ = done.send(());
        }
        if self.state == LockState::Obtained {
            trace!("Rendezvous released");
        }
        self.state = LockState::Released;
    }
}

impl Drop for RendezvousGuard {
    fn drop(&mut self) {
        self.signal_release();
    }
}

impl fmt::Debug for RendezvousGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousGuard")
            .field("state", &self.state)
            .finish()
    }
}
