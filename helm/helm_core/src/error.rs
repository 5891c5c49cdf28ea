//! Error types for the helm runtime.
//!
//! Errors are organized by subsystem. The root error type, `Error`, wraps
//! each subsystem-specific error so callers can handle failures uniformly
//! at the top level, or match on the subsystem when they care.

use thiserror::Error;

use crate::types::FaultCause;

/// Root error type for helm.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource lifecycle errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Thread context, scheduling and rendezvous errors
    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// Event dispatch and subscription errors
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// A joined promise did not produce a value
    #[error("Promise error: {0}")]
    Promise(#[from] PromiseError),

    /// General runtime errors
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Errors raised by user-supplied callbacks
    #[error(transparent)]
    Custom(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap an arbitrary error raised by user code.
    pub fn custom<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Custom(Box::new(error))
    }

    /// Build a runtime error from a message.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

/// Errors related to terminables and registries.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A resource was bound into a registry that has already been torn down
    #[error("registry has already been terminated")]
    AlreadyTerminated,

    /// One or more members of a composite failed to close
    #[error("{} terminable(s) failed to close", .0.len())]
    CompositeClosing(Vec<Error>),
}

/// Errors related to thread context and cross-thread coordination.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    /// The waiting thread was interrupted before the operation completed
    #[error("interrupted while waiting for the primary thread")]
    Interrupted,

    /// An operation that must run on the primary thread was called elsewhere
    #[error("operation must be called from the primary thread")]
    NotPrimaryThread,

    /// The executor no longer accepts work
    #[error("executor is shutting down")]
    ShuttingDown,

    /// The executor queue is full
    #[error("executor queue is full")]
    QueueFull,

    /// A thread required by the runtime could not be started
    #[error("failed to spawn thread: {0}")]
    SpawnFailed(String),
}

/// Errors related to events and subscriptions.
#[derive(Debug, Error)]
pub enum EventError {
    /// A subscription was built without a handler
    #[error("subscription for {0} has no handler")]
    MissingHandler(&'static str),

    /// The bus backing a subscription has been dropped
    #[error("event bus is no longer available")]
    BusClosed,
}

/// Why a promise holds no value.
///
/// Cloned into every handle that observes the promise, so the cause is
/// shared rather than owned.
#[derive(Debug, Clone, Error)]
pub enum PromiseError {
    /// The promise was cancelled before it completed
    #[error("promise was cancelled")]
    Cancelled,

    /// A step of the chain failed
    #[error("promise completed exceptionally: {0}")]
    Failed(FaultCause),
}

/// Result type used throughout helm.
pub type Result<T> = std::result::Result<T, Error>;
