//! Fault containment.
//!
//! Failures raised inside user callbacks never reach executor internals.
//! They are caught at the boundary, turned into [`Fault`](helm_core::Fault)
//! records and handed to a [`FaultSink`].

pub mod sink;

pub use sink::{FaultObserver, FaultSink};
