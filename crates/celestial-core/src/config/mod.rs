//! Configuration module for Celestial Core.
//!
//! Settings come from a TOML file and may be overridden per key through
//! `CELESTIAL_*` environment variables.

pub mod model_cache;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub use model_cache::IntegratedModelsConfig;

use crate::error::{CelestialError, Result};
use model_cache::parse_bool;

/// Directory under the user's home holding the per-user config file.
const USER_CONFIG_DIR: &str = ".config/celestial-tts";

/// Name of the config file in every search location.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "CELESTIAL_";

/// Inference settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Merge concurrent requests with identical parameters (default: true).
    #[serde(default = "default_true")]
    pub batching: bool,
}

fn default_true() -> bool {
    true
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self { batching: true }
    }
}

/// Root configuration for Celestial TTS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Locally hosted models.
    #[serde(default)]
    pub integrated_models: IntegratedModelsConfig,
    /// Inference behaviour.
    #[serde(default)]
    pub inference: InferenceConfig,
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the config file and environment variables.
    ///
    /// An explicit `path` must exist. Otherwise `./config.toml` and then
    /// `~/.config/celestial-tts/config.toml` are tried, and a default file is
    /// written to the first location when neither exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read, parsed or written, or if any
    /// setting is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let lookup = |name: &str| std::env::var(name).ok();
        match path {
            Some(path) => Self::load_file(path, lookup),
            None => Self::load_or_create(&Self::search_paths(), lookup),
        }
    }

    /// Locations searched for a config file, in priority order.
    #[must_use]
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(USER_CONFIG_DIR).join(CONFIG_FILE_NAME));
        }
        paths
    }

    /// Load an existing config file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or invalid.
    pub fn load_file(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if !path.exists() {
            return Err(CelestialError::Config(format!("config file not found: {}", path.display())));
        }

        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        debug!(path = %path.display(), "Loaded configuration file");

        config.apply_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the first existing file among `paths`, or write defaults to the first one.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen file is invalid or the default cannot be written.
    pub fn load_or_create(paths: &[PathBuf], env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(existing) = paths.iter().find(|path| path.exists()) {
            return Self::load_file(existing, env);
        }

        let mut config = Self::default();
        if let Some(target) = paths.first() {
            config.save(target)?;
            info!(path = %target.display(), "Created default configuration file");
        }

        config.apply_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut content = String::from("# Celestial TTS configuration\n\n");
        content.push_str(&toml::to_string_pretty(self)?);
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `CELESTIAL_*` overrides looked up through `env`.
    ///
    /// # Errors
    ///
    /// Returns `CelestialError::Config` if a value cannot be parsed.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| {
            let name = format!("{ENV_PREFIX}{key}");
            env(&name).map(|value| (name, value))
        };
        let models = &mut self.integrated_models;

        if let Some((name, value)) = var("INTEGRATED_MODELS_ENABLED") {
            models.enabled = parse_bool(&name, &value)?;
        }
        if let Some((name, value)) = var("INTEGRATED_MODELS_MAX_LOADED_MODELS") {
            models.max_loaded_models = value.trim().parse().map_err(|_| {
                CelestialError::Config(format!("{name}: expected a positive integer, got '{value}'"))
            })?;
        }
        if let Some((_, value)) = var("INTEGRATED_MODELS_DEVICE_MAP") {
            models.device_map = value.trim().to_string();
        }
        if let Some((_, value)) = var("INTEGRATED_MODELS_PRELOAD") {
            models.preload = value
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some((name, value)) = var("INFERENCE_BATCHING") {
            self.inference.batching = parse_bool(&name, &value)?;
        }
        Ok(())
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<()> {
        self.integrated_models.validate()
    }
}
