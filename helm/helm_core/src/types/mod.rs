//! Data structures shared across helm crates.

pub mod fault;

pub use fault::{cause_from_error, cause_from_panic, Fault, FaultCause, FaultKind, PanicError};
