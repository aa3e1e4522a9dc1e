//! Configuration for retry, locking, and dependency limits
//!
//! All knobs have defaults, so an empty TOML file (or no file at all) yields
//! a working configuration. Durations are stored as integer milliseconds in
//! the file and exposed as [`Duration`] accessors.
//!
//! Example:
//!
//! ```toml
//! [retry]
//! max_retries = 3
//! base_delay_ms = 100
//! max_delay_ms = 2000
//!
//! [lock]
//! timeout_ms = 5000
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TasklockConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub dependency: DependencyConfig,
}

/// Backoff behavior for retried compare-and-set attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; 3 means up to 4 attempts total
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as jitter, in [0, 1]
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    /// Base delay as a [`Duration`]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap as a [`Duration`]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Resource lock lifetimes and wait bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long a granted lock may be held before it expires
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on one blocking wait for a busy lock
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl LockConfig {
    /// Lock timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Wait bound as a [`Duration`]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Limits on the priority/status dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Deepest nesting level accepted when registering a dependency
    #[serde(default = "default_max_level")]
    pub max_level: u32,
    /// Distinct dependents above which a task counts as a bottleneck
    #[serde(default = "default_bottleneck_threshold")]
    pub bottleneck_threshold: usize,
    /// Hop limit when scanning for alternating dependency chains
    #[serde(default = "default_max_chain_scan")]
    pub max_chain_scan: usize,
    /// Chain length at which a cascade is reported
    #[serde(default = "default_cascade_threshold")]
    pub cascade_threshold: usize,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            max_level: default_max_level(),
            bottleneck_threshold: default_bottleneck_threshold(),
            max_chain_scan: default_max_chain_scan(),
            cascade_threshold: default_cascade_threshold(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_wait_ms() -> u64 {
    1000
}

fn default_max_level() -> u32 {
    3
}

fn default_bottleneck_threshold() -> usize {
    3
}

fn default_max_chain_scan() -> usize {
    6
}

fn default_cascade_threshold() -> usize {
    4
}

impl TasklockConfig {
    /// Loads configuration from a TOML file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_ratio must be between 0 and 1, got {}",
                self.retry.jitter_ratio
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.lock.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "lock.timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
