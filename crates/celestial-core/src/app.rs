//! Process lifecycle: startup, preload, serve, orderly teardown.

use celestial_models::{ModelLoader, ModelService};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;

/// A running Celestial TTS instance.
#[derive(Debug)]
pub struct App {
    service: Option<Arc<ModelService>>,
}

impl App {
    /// Builds the model service and preloads the configured models.
    ///
    /// `extra_preload` is appended to the configured preload list; duplicates are
    /// loaded once. Nothing is built when integrated models are disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a preload fails. Models
    /// already loaded are released before returning.
    pub async fn start(
        config: &Config,
        loader: Arc<dyn ModelLoader>,
        extra_preload: &[String],
    ) -> Result<Self> {
        let models = &config.integrated_models;
        if !models.enabled {
            info!("Integrated models are disabled");
            return Ok(Self { service: None });
        }

        let service =
            Arc::new(ModelService::new(models.service_config(config.inference.batching)?, loader)?);

        let mut preload: Vec<String> = Vec::new();
        for model_id in models.preload.iter().chain(extra_preload) {
            if !preload.contains(model_id) {
                preload.push(model_id.clone());
            }
        }

        if !preload.is_empty() {
            if let Err(err) = service.preload(&preload).await {
                warn!(error = %err, "Preloading failed, releasing loaded models");
                service.shutdown().await;
                return Err(err.into());
            }
        }

        info!(
            capacity = service.capacity(),
            device = %service.device(),
            loaded = ?service.loaded_models(),
            "Celestial TTS ready"
        );
        Ok(Self { service: Some(service) })
    }

    /// The model service, if integrated models are enabled.
    #[must_use]
    pub fn service(&self) -> Option<&Arc<ModelService>> {
        self.service.as_ref()
    }

    /// Releases every loaded model. Returns how many were released.
    pub async fn shutdown(self) -> usize {
        let Some(service) = self.service else {
            return 0;
        };
        info!("Shutting down");
        service.shutdown().await
    }
}

/// Runs until `signal` resolves, then tears down.
///
/// # Errors
///
/// Returns an error if startup fails.
pub async fn run(
    config: &Config,
    loader: Arc<dyn ModelLoader>,
    extra_preload: &[String],
    signal: impl Future<Output = ()>,
) -> Result<()> {
    let app = App::start(config, loader, extra_preload).await?;
    signal.await;
    let released = app.shutdown().await;
    info!(released, "Celestial TTS stopped");
    Ok(())
}
