//! Integrated model settings: capacity, device placement and preloading.

use celestial_abstraction::Device;
use celestial_models::{CacheConfig, LocalTtsType, ReleasePolicy, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CelestialError, Result};

/// The `[integrated_models]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegratedModelsConfig {
    /// Serve the locally hosted models at all (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of models kept loaded at once (default: 2).
    #[serde(default = "default_max_loaded_models")]
    pub max_loaded_models: usize,

    /// Default device models are loaded on, e.g. "cpu", "cuda:0" or "mps" (default: "cpu").
    #[serde(default = "default_device_map")]
    pub device_map: String,

    /// What to do with a slot whose model failed to unload (default: "quarantine").
    #[serde(default)]
    pub release_policy: ReleasePolicy,

    /// Model ids loaded at startup.
    #[serde(default)]
    pub preload: Vec<String>,

    /// Per-model device placement, keyed by model id.
    #[serde(default)]
    pub device_overrides: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_max_loaded_models() -> usize {
    2
}

fn default_device_map() -> String {
    "cpu".to_string()
}

impl Default for IntegratedModelsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_loaded_models: default_max_loaded_models(),
            device_map: default_device_map(),
            release_policy: ReleasePolicy::default(),
            preload: Vec::new(),
            device_overrides: BTreeMap::new(),
        }
    }
}

impl IntegratedModelsConfig {
    /// Cache settings derived from this section.
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_loaded_models: self.max_loaded_models,
            device: self.device_map.clone(),
            release_policy: self.release_policy,
        }
    }

    /// Builds the model service configuration.
    ///
    /// # Errors
    /// Returns an error if the cache settings are invalid, or an override names an
    /// unknown model or device.
    pub fn service_config(&self, batching: bool) -> Result<ServiceConfig> {
        let cache = self.cache_config();
        cache.validate()?;

        let device_overrides = self
            .device_overrides
            .iter()
            .map(|(model_id, device)| {
                let model_type: LocalTtsType = model_id.parse()?;
                let device: Device = device.parse()?;
                Ok((model_type, device))
            })
            .collect::<Result<_>>()?;

        Ok(ServiceConfig { cache, device_overrides, batching })
    }

    /// Validates the section without building anything.
    ///
    /// # Errors
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.service_config(true)?;
        for model_id in &self.preload {
            model_id.parse::<LocalTtsType>()?;
        }
        Ok(())
    }
}

/// Parses a boolean environment value the way shells usually spell them.
pub(crate) fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CelestialError::Config(format!("{name}: expected a boolean, got '{other}'"))),
    }
}
