//! Configuration for the helm runtime
//!
//! Handles loading and managing runtime configuration. Every field has a
//! default, so a config file only needs to name what it changes.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use helm_concurrency::{PrimaryLoopConfig, ThreadPoolConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::events::UnregisterStrategy;

/// Errors that can occur in configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    /// The file is not valid configuration JSON
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker threads
    #[serde(default = "default_worker_threads")]
    pub threads: usize,

    /// Maximum number of queued worker tasks
    #[serde(default = "default_worker_queue_size")]
    pub queue_size: usize,

    /// Name prefix for worker threads
    #[serde(default = "default_worker_thread_prefix")]
    pub thread_name_prefix: String,
}

fn default_worker_threads() -> usize {
    4
}

fn default_worker_queue_size() -> usize {
    1000
}

fn default_worker_thread_prefix() -> String {
    "helm-worker".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_worker_threads(),
            queue_size: default_worker_queue_size(),
            thread_name_prefix: default_worker_thread_prefix(),
        }
    }
}

impl WorkerConfig {
    /// Pool settings for these values.
    pub fn pool_config(&self) -> ThreadPoolConfig {
        ThreadPoolConfig {
            queue_size: self.queue_size,
            worker_threads: self.threads,
            thread_name_prefix: self.thread_name_prefix.clone(),
            collect_stats: true,
        }
    }
}

/// Primary loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryConfig {
    /// Milliseconds between ticks
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Maximum number of tasks waiting for a tick
    #[serde(default = "default_primary_queue_capacity")]
    pub queue_capacity: usize,

    /// Name of the primary thread
    #[serde(default = "default_primary_thread_name")]
    pub thread_name: String,
}

fn default_tick_interval_ms() -> u64 {
    50
}

fn default_primary_queue_capacity() -> usize {
    4096
}

fn default_primary_thread_name() -> String {
    "helm-primary".to_string()
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            queue_capacity: default_primary_queue_capacity(),
            thread_name: default_primary_thread_name(),
        }
    }
}

impl PrimaryConfig {
    /// Loop settings for these values.
    pub fn loop_config(&self) -> PrimaryLoopConfig {
        PrimaryLoopConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            queue_capacity: self.queue_capacity,
            thread_name: self.thread_name.clone(),
        }
    }
}

/// Periodic registry cleanup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Whether the root registry is swept for finished resources
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,

    /// Delay before the first sweep (milliseconds)
    #[serde(default = "default_cleanup_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Time between sweeps (milliseconds)
    #[serde(default = "default_cleanup_period_ms")]
    pub period_ms: u64,
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_cleanup_initial_delay_ms() -> u64 {
    10_000
}

fn default_cleanup_period_ms() -> u64 {
    30_000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            initial_delay_ms: default_cleanup_initial_delay_ms(),
            period_ms: default_cleanup_period_ms(),
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Force an unregister strategy instead of detecting one
    #[serde(default)]
    pub unregister_strategy: Option<UnregisterStrategy>,

    /// Whether contained faults are republished as events
    #[serde(default = "default_forward_faults")]
    pub forward_faults: bool,
}

fn default_forward_faults() -> bool {
    true
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            unregister_strategy: None,
            forward_faults: default_forward_faults(),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker pool
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Primary loop
    #[serde(default)]
    pub primary: PrimaryConfig,

    /// Registry cleanup
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Event bus
    #[serde(default)]
    pub events: EventConfig,

    /// Default log filter, used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Additional configuration
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: WorkerConfig::default(),
            primary: PrimaryConfig::default(),
            cleanup: CleanupConfig::default(),
            events: EventConfig::default(),
            log_level: default_log_level(),
            extra: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file, or defaults when no path is given
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                info!("Loading configuration from {}", path);

                if !Path::new(path).exists() {
                    warn!("Configuration file not found: {}", path);
                    RuntimeConfig::default()
                } else {
                    let content = std::fs::read_to_string(path)
                        .map_err(|e| ConfigError::LoadFailed(e.to_string()))
                        .context(format!("Failed to read configuration file: {}", path))?;

                    Self::from_json(&content)
                        .context(format!("Failed to parse configuration file: {}", path))?
                }
            }
            None => {
                info!("No configuration file specified, using defaults");
                RuntimeConfig::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        let config = serde_json::from_str(content)
            .map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers.threads == 0 {
            return Err(ConfigError::Invalid("Worker threads cannot be zero".to_string()).into());
        }

        if self.workers.queue_size == 0 {
            return Err(
                ConfigError::Invalid("Worker queue size cannot be zero".to_string()).into(),
            );
        }

        if self.primary.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("Tick interval cannot be zero".to_string()).into());
        }

        if self.primary.queue_capacity == 0 {
            return Err(
                ConfigError::Invalid("Primary queue capacity cannot be zero".to_string()).into(),
            );
        }

        if self.primary.thread_name.is_empty() {
            return Err(
                ConfigError::Invalid("Primary thread name cannot be empty".to_string()).into(),
            );
        }

        if self.cleanup.enabled && self.cleanup.period_ms == 0 {
            return Err(ConfigError::Invalid("Cleanup period cannot be zero".to_string()).into());
        }

        if !self.events.forward_faults {
            warn!("Fault forwarding is disabled; faults will only be logged");
        }

        Ok(())
    }

    /// Merge with another configuration
    pub fn merge(&mut self, other: RuntimeConfig) {
        if other.workers.threads > 0 {
            self.workers.threads = other.workers.threads;
        }
        if other.workers.queue_size > 0 {
            self.workers.queue_size = other.workers.queue_size;
        }
        if !other.workers.thread_name_prefix.is_empty() {
            self.workers.thread_name_prefix = other.workers.thread_name_prefix;
        }

        if other.primary.tick_interval_ms > 0 {
            self.primary.tick_interval_ms = other.primary.tick_interval_ms;
        }
        if other.primary.queue_capacity > 0 {
            self.primary.queue_capacity = other.primary.queue_capacity;
        }
        if !other.primary.thread_name.is_empty() {
            self.primary.thread_name = other.primary.thread_name;
        }

        self.cleanup = other.cleanup;

        if other.events.unregister_strategy.is_some() {
            self.events.unregister_strategy = other.events.unregister_strategy;
        }
        self.events.forward_faults = other.events.forward_faults;

        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }

        for (key, value) in other.extra {
            self.extra.insert(key, value);
        }
    }

    /// Delay before the first registry sweep
    pub fn cleanup_initial_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup.initial_delay_ms)
    }

    /// Time between registry sweeps
    pub fn cleanup_period(&self) -> Duration {
        Duration::from_millis(self.cleanup.period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();
        let config_json = r#"
        {
            "workers": { "threads": 2 },
            "primary": { "tick_interval_ms": 10 },
            "cleanup": { "initial_delay_ms": 100, "period_ms": 200 },
            "events": { "unregister_strategy": "deferred" },
            "log_level": "debug"
        }
        "#;
        file.write_all(config_json.as_bytes()).unwrap();

        let path = file.path().to_str().unwrap();
        let config = RuntimeConfig::load(Some(path)).unwrap();

        assert_eq!(config.workers.threads, 2);
        assert_eq!(config.workers.queue_size, 1000);
        assert_eq!(config.primary.tick_interval_ms, 10);
        assert_eq!(config.primary.thread_name, "helm-primary");
        assert_eq!(config.cleanup_initial_delay(), Duration::from_millis(100));
        assert_eq!(config.cleanup_period(), Duration::from_millis(200));
        assert!(config.cleanup.enabled);
        assert_eq!(
            config.events.unregister_strategy,
            Some(UnregisterStrategy::Deferred)
        );
        assert!(config.events.forward_faults);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::load(None).unwrap();

        assert_eq!(config.workers.threads, 4);
        assert_eq!(config.primary.tick_interval_ms, 50);
        assert_eq!(config.cleanup.initial_delay_ms, 10_000);
        assert_eq!(config.cleanup.period_ms, 30_000);
        assert_eq!(config.events.unregister_strategy, None);
        assert!(config.events.forward_faults);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let config = RuntimeConfig::load(path.to_str()).unwrap();
        assert_eq!(config.workers.threads, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = RuntimeConfig::default();
        config.workers.threads = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.primary.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.cleanup.period_ms = 0;
        assert!(config.validate().is_err());
        config.cleanup.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_file_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ \"workers\": ").unwrap();

        let result = RuntimeConfig::load(file.path().to_str());
        let err = result.unwrap_err();
        assert!(err.chain().any(|cause| cause.is::<ConfigError>()));
    }

    #[test]
    fn test_merge_config() {
        let mut base = RuntimeConfig::default();

        let mut override_config = RuntimeConfig::default();
        override_config.workers.threads = 8;
        override_config.primary.thread_name = "host-main".to_string();
        override_config.events.unregister_strategy = Some(UnregisterStrategy::Deferred);
        override_config
            .extra
            .insert("server".to_string(), serde_json::json!("lobby"));

        base.merge(override_config);

        assert_eq!(base.workers.threads, 8);
        assert_eq!(base.primary.thread_name, "host-main");
        assert_eq!(
            base.events.unregister_strategy,
            Some(UnregisterStrategy::Deferred)
        );
        assert_eq!(base.extra["server"], serde_json::json!("lobby"));
    }
}
