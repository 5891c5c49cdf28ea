//! Event subscriptions and their cleanup glue.
//!
//! - [`EventBus`]: typed dispatch with fault-contained handlers
//! - [`Subscription`]: a terminable handle to one registered handler
//! - [`UnregisterStrategy`]: how unregistered handlers leave the table
//! - [`FaultEvent`]: contained faults republished as events

pub mod bus;
pub mod faults;
pub mod strategy;
pub mod subscription;

pub use bus::EventBus;
pub use faults::{FaultEvent, FaultForwarder};
pub use strategy::UnregisterStrategy;
pub use subscription::{Subscription, SubscriptionBuilder};
