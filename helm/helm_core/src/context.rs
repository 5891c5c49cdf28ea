//! Thread context model.
//!
//! Every component that needs to know whether it is running on the primary
//! loop asks a [`PrimaryThread`] handle. The handle is captured once, on the
//! primary thread, when the host starts up; after that the answer is a plain
//! `ThreadId` comparison.

use std::fmt;
use std::thread::{self, ThreadId};

/// The execution context of the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadContext {
    /// The thread that drives the primary loop.
    Primary,

    /// Any other thread.
    Worker,
}

impl ThreadContext {
    /// Whether this is the primary context.
    pub fn is_primary(self) -> bool {
        self == Self::Primary
    }
}

impl fmt::Display for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Identity of the primary-loop thread.
///
/// Cloning the handle is cheap; every clone answers for the same thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryThread {
    id: ThreadId,
    name: Option<String>,
}

impl PrimaryThread {
    /// Designate the calling thread as the primary thread.
    pub fn capture() -> Self {
        let current = thread::current();
        Self {
            id: current.id(),
            name: current.name().map(str::to_string),
        }
    }

    /// The id of the primary thread.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// The name of the primary thread, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Classify the calling thread.
    pub fn current_context(&self) -> ThreadContext {
        if thread::current().id() == self.id {
            ThreadContext::Primary
        } else {
            ThreadContext::Worker
        }
    }

    /// Shorthand for `current_context().is_primary()`.
    pub fn is_current(&self) -> bool {
        self.current_context().is_primary()
    }
}
