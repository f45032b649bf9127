//! Configuration for model caching.

use celestial_abstraction::Device;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What the cache does with a capacity slot whose handle failed to release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePolicy {
    /// Withhold the slot for the rest of the process lifetime.
    #[default]
    Quarantine,
    /// Reuse the slot once the handle has been dropped.
    Reclaim,
}

/// Configuration for the model cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of models to keep loaded at once (default: 2).
    #[serde(default = "default_max_loaded_models")]
    pub max_loaded_models: usize,

    /// Device models are constructed on unless the factory overrides it (default: "cpu").
    #[serde(default = "default_device")]
    pub device: String,

    /// Handling of slots whose release failed (default: quarantine).
    #[serde(default)]
    pub release_policy: ReleasePolicy,
}

fn default_max_loaded_models() -> usize {
    2
}

fn default_device() -> String {
    "cpu".to_string()
}

/// Errors that can occur during cache configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheConfigError {
    /// Invalid max loaded models (must be > 0).
    #[error("Invalid max loaded models: must be greater than 0")]
    InvalidMaxLoadedModels,

    /// The device string does not name a known device.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_loaded_models: default_max_loaded_models(),
            device: default_device(),
            release_policy: ReleasePolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with the given capacity and defaults elsewhere.
    #[must_use]
    pub fn with_capacity(max_loaded_models: usize) -> Self {
        Self { max_loaded_models, ..Self::default() }
    }

    /// Validate the cache configuration.
    ///
    /// # Errors
    /// Returns `CacheConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), CacheConfigError> {
        if self.max_loaded_models == 0 {
            return Err(CacheConfigError::InvalidMaxLoadedModels);
        }

        self.parsed_device()?;

        Ok(())
    }

    /// The configured device, parsed.
    ///
    /// # Errors
    /// Returns `CacheConfigError::InvalidDevice` if the string is not a device.
    pub fn parsed_device(&self) -> Result<Device, CacheConfigError> {
        self.device.parse().map_err(|_| CacheConfigError::InvalidDevice(self.device.clone()))
    }
}
