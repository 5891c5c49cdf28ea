//! Worker threads for off-primary work.

pub mod thread;

pub use thread::{ThreadPool, ThreadPoolConfig, ThreadPoolStats};
