//! System management for the helm runtime
//!
//! This module provides components for system bootstrap, configuration,
//! and shutdown operations.

pub mod bootstrap;
pub mod config;
pub mod shutdown;

// Re-export key types for convenience
pub use bootstrap::{BootstrapError, BootstrapPhase, Components, System};
pub use config::{CleanupConfig, ConfigError, EventConfig, PrimaryConfig, RuntimeConfig, WorkerConfig};
pub use shutdown::{ShutdownManager, ShutdownPhase};
