#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Helm Concurrency
//!
//! Execution machinery shared by every helm subsystem:
//!
//! - Fault containment for user callbacks
//! - The rendezvous lock that parks the primary loop for a worker
//! - Primary and worker executor traits, with a reference primary loop
//! - A worker thread pool and a delayed/repeating task timer
//!
//! ## Integration with Other Helm Crates
//!
//! - **helm_core**: errors, thread context and the `Terminable` capability
//! - **helm_runtime**: wires these pieces into a running `Runtime`

/// Fault containment for user callbacks
pub mod fault;

/// Worker thread pool
pub mod pool;

/// Executor traits, the primary loop and the timer
pub mod scheduler;

/// Coordination with the primary loop
pub mod sync;

pub use fault::{FaultObserver, FaultSink};
pub use pool::{ThreadPool, ThreadPoolConfig, ThreadPoolStats};
pub use scheduler::{
    PrimaryExecutor, PrimaryLoop, PrimaryLoopConfig, ScheduledTask, Task, Timer, WorkerExecutor,
};
pub use sync::{InterruptFlag, LockState, RendezvousGuard, RendezvousLock};
