//! Error types for Celestial Core.

use celestial_abstraction::ModelError;
use celestial_models::CacheConfigError;
use thiserror::Error;

/// Core error type for Celestial operations.
#[derive(Error, Debug)]
pub enum CelestialError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Default configuration could not be written
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Invalid model cache settings
    #[error("Model cache error: {0}")]
    Cache(#[from] CacheConfigError),

    /// Model-related errors
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}

/// Result type alias for Celestial operations.
pub type Result<T> = std::result::Result<T, CelestialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_celestial_error_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: CelestialError = io_err.into();
        match err {
            CelestialError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_celestial_error_config() {
        let err = CelestialError::Config("Invalid configuration".to_string());
        let msg = format!("{}", err);
        assert!(msg.contains("Configuration error"));
        assert!(msg.contains("Invalid configuration"));
    }

    #[test]
    fn test_celestial_error_from_cache_config() {
        let err: CelestialError = CacheConfigError::InvalidMaxLoadedModels.into();
        assert!(matches!(err, CelestialError::Cache(CacheConfigError::InvalidMaxLoadedModels)));
        assert!(err.to_string().contains("must be greater than 0"));
    }

    #[test]
    fn test_celestial_error_from_toml() {
        let parse_err = toml::from_str::<toml::Table>("max_loaded_models = ").unwrap_err();
        let err: CelestialError = parse_err.into();
        assert!(matches!(err, CelestialError::TomlParse(_)));
    }

    #[test]
    fn test_celestial_error_model() {
        let err: CelestialError = ModelError::UnknownModel("qwen9".to_string()).into();
        let msg = format!("{}", err);
        assert!(msg.contains("Model error"));
        assert!(msg.contains("qwen9"));
    }
}
