//! Celestial Core - process shell for the Celestial TTS model runtime.
//!
//! This crate provides:
//! - Configuration loading (TOML file plus `CELESTIAL_*` environment overrides)
//! - Error handling
//! - Logging setup and the process lifecycle driving the model service
//!
//! # Example
//!
//! ```rust,no_run
//! use celestial_core::{app, config::Config};
//! use celestial_models::MockLoader;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> celestial_core::error::Result<()> {
//!     let config = Config::load(None)?;
//!     let signal = async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     };
//!     app::run(&config, Arc::new(MockLoader::new()), &[], signal).await
//! }
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod logging;

pub use app::App;
pub use config::{Config, InferenceConfig, IntegratedModelsConfig};
pub use error::{CelestialError, Result};
