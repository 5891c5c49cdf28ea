//! Strongly-typed identifiers.
//!
//! Each identifier is a thin wrapper around a UUID with a phantom marker
//! so identifiers for different entities cannot be mixed up.
//!
//! # Examples
//!
//! ```
//! use helm_core::id::{SubscriptionId, TaskId};
//! use std::str::FromStr;
//!
//! let subscription = SubscriptionId::new();
//! let task = TaskId::new();
//! assert_ne!(subscription.to_string(), task.to_string());
//!
//! let id_str = "550e8400-e29b-41d4-a716-446655440000";
//! let parsed = TaskId::from_str(id_str).unwrap();
//! assert_eq!(parsed.to_string(), id_str);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A type-safe identifier based on UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id<T> {
    uuid: Uuid,
    #[serde(skip)]
    _marker: std::marker::PhantomData<T>,
}

impl<T> Id<T> {
    /// Create a new random identifier.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Create an identifier from a specific UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            _marker: std::marker::PhantomData,
        }
    }

    /// Get the underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

impl<T> FromStr for Id<T> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            uuid: Uuid::parse_str(s)?,
            _marker: std::marker::PhantomData,
        })
    }
}

/// Marker type for event subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionMarker;
/// Identifier for an event subscription.
pub type SubscriptionId = Id<SubscriptionMarker>;

/// Marker type for scheduled tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskMarker;
/// Identifier for a delayed or repeating task.
pub type TaskId = Id<TaskMarker>;
