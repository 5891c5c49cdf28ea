//! Fault records.
//!
//! A [`Fault`] describes one failure caught at a callback boundary: a
//! scheduled task, a chained continuation or an event handler. Faults are
//! transient; they are built, logged, published and dropped.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::Error;

/// The cause carried by a fault.
pub type FaultCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A panic payload converted into an error value.
#[derive(Debug, Clone, Error)]
#[error("panicked: {message}")]
pub struct PanicError {
    message: String,
}

impl PanicError {
    /// Build from the payload returned by `std::panic::catch_unwind`.
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<unknown panic>".to_string()
        };
        Self { message }
    }

    /// The panic message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Which boundary caught the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// A task run by a scheduler or executor
    SchedulerTask,

    /// A chained continuation
    PromiseChain,

    /// An event handler
    EventHandler,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchedulerTask => write!(f, "scheduler task"),
            Self::PromiseChain => write!(f, "promise chain"),
            Self::EventHandler => write!(f, "event handler"),
        }
    }
}

/// A caught failure together with where it was caught.
#[derive(Debug, Clone)]
pub enum Fault {
    /// A scheduled task failed.
    SchedulerTask {
        /// What went wrong
        cause: FaultCause,
    },

    /// A chained continuation failed.
    PromiseChain {
        /// What went wrong
        cause: FaultCause,
    },

    /// An event handler failed while handling `event`.
    EventHandler {
        /// Type name of the event being handled
        event_type: &'static str,

        /// Debug rendering of the event
        event: String,

        /// What went wrong
        cause: FaultCause,
    },
}

impl Fault {
    /// The boundary this fault was caught at.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::SchedulerTask { .. } => FaultKind::SchedulerTask,
            Self::PromiseChain { .. } => FaultKind::PromiseChain,
            Self::EventHandler { .. } => FaultKind::EventHandler,
        }
    }

    /// The underlying cause.
    pub fn cause(&self) -> &FaultCause {
        match self {
            Self::SchedulerTask { cause }
            | Self::PromiseChain { cause }
            | Self::EventHandler { cause, .. } => cause,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchedulerTask { cause } => {
                write!(f, "exception thrown whilst executing task: {}", cause)
            }
            Self::PromiseChain { cause } => {
                write!(f, "exception thrown whilst executing promise chain: {}", cause)
            }
            Self::EventHandler {
                event_type, cause, ..
            } => write!(f, "exception thrown whilst handling {}: {}", event_type, cause),
        }
    }
}

/// Convert an error into a [`FaultCause`].
pub fn cause_from_error(error: Error) -> FaultCause {
    Arc::new(error)
}

/// Convert a panic payload into a [`FaultCause`].
pub fn cause_from_panic(payload: Box<dyn Any + Send>) -> FaultCause {
    Arc::new(PanicError::from_payload(payload))
}
