//! Task submission facilities.
//!
//! The rest of helm only talks to the host through two traits:
//!
//! - [`PrimaryExecutor`]: run a task on the primary thread at the next tick
//! - [`WorkerExecutor`]: run a task on some worker thread
//!
//! [`PrimaryLoop`] is a reference primary loop and [`Timer`] layers delayed
//! and repeating tasks on top of any worker executor.

pub mod primary;
pub mod timer;

use helm_core::context::{PrimaryThread, ThreadContext};
use helm_core::error::Result;

pub use primary::{PrimaryLoop, PrimaryLoopConfig};
pub use timer::{ScheduledTask, Timer};

/// A boxed unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Submits work to the primary loop.
pub trait PrimaryExecutor: Send + Sync {
    /// Identity of the thread that runs submitted tasks.
    fn primary_thread(&self) -> &PrimaryThread;

    /// Queue `task` to run on the primary thread at the next tick.
    fn execute(&self, task: Task) -> Result<()>;

    /// Classify the calling thread.
    fn current_context(&self) -> ThreadContext {
        self.primary_thread().current_context()
    }
}

/// Submits work to worker threads.
pub trait WorkerExecutor: Send + Sync {
    /// Queue `task` to run on some worker thread.
    fn execute(&self, task: Task) -> Result<()>;
}
