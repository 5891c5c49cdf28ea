//! How unregistered handlers leave the dispatch table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Removal strategy for unregistered handlers.
///
/// Chosen once when a bus is built and never re-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnregisterStrategy {
    /// `unregister` removes the handler from the dispatch table at once
    Immediate,

    /// `unregister` only deactivates the handler; the next dispatch of that
    /// event type sweeps it out
    Deferred,
}

impl UnregisterStrategy {
    /// Pick a strategy for a host that can or cannot remove a single handler
    /// from its dispatch table.
    pub fn detect(supports_direct_removal: bool) -> Self {
        if supports_direct_removal {
            Self::Immediate
        } else {
            Self::Deferred
        }
    }
}

impl fmt::Display for UnregisterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Deferred => write!(f, "deferred"),
        }
    }
}
