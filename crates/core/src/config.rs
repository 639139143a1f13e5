//! Configuration management for Beacon.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Largest search radius a request may use, in meters
    pub max_radius_m: f64,
}

/// Timeouts and retry bounds applied to every store call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub send_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_radius_m: 10_000.0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            max_attempts: 3,
            base_backoff_ms: 50,
            max_backoff_ms: 500,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1_024,
            send_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl NotificationConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            store: StoreConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(self.dispatch.max_radius_m.is_finite() && self.dispatch.max_radius_m > 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "dispatch.max_radius_m must be positive, got {}",
                self.dispatch.max_radius_m
            )));
        }
        if self.store.max_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "store.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "store.timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.notifications.workers == 0 || self.notifications.queue_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "notifications.workers and notifications.queue_capacity must be at least 1"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
