//! Cross-thread coordination with the primary loop.
//!
//! - [`RendezvousLock`]: exclusive critical sections against the primary loop
//! - [`InterruptFlag`]: cooperative interruption of a blocked acquirer

pub mod interrupt;
pub mod rendezvous;

pub use interrupt::InterruptFlag;
pub use rendezvous::{LockState, RendezvousGuard, RendezvousLock};
