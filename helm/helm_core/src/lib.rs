//! # Helm Core
//!
//! `helm_core` provides the building blocks shared by every helm crate:
//! the error taxonomy, typed identifiers, the [`Terminable`] capability and
//! the registries that tear terminables down, the thread-context model,
//! and fault records.
//!
//! ## Lifecycle model
//!
//! Subsystems bind the resources they create into a [`TerminableRegistry`].
//! When a subsystem shuts down its registry releases everything in reverse
//! bind order:
//!
//! ```text
//! bind(A) ─► bind(B) ─► bind_composite(M{x, y}) ─► bind(C)
//!
//! terminate():  C ─► M (y ─► x) ─► B ─► A
//! ```
//!
//! A failing resource is logged and skipped; the rest are still released.
//!
//! ## Crate Structure
//!
//! - **error**: Error types for all helm components
//! - **id**: Strongly-typed identifier types
//! - **context**: Primary/worker thread classification
//! - **terminable**: The terminable capability, registries and composites
//! - **types**: Fault records

pub mod context;
pub mod error;
pub mod id;
pub mod terminable;
pub mod types;

pub use context::{PrimaryThread, ThreadContext};
pub use error::{ConcurrencyError, Error, EventError, LifecycleError, PromiseError, Result};
pub use id::{SubscriptionId, TaskId};
pub use terminable::{
    CompositeModule, CompositeTerminable, FnTerminable, Terminable, TerminableModule,
    TerminableRegistry, WeakCompositeTerminable,
};
pub use types::{Fault, FaultCause, FaultKind, PanicError};
