//! Request-facing facade tying the model cache, factory and batcher together.

use crate::batcher::{BatchFn, InferenceBatcher};
use crate::cache::{CacheConfig, CacheConfigError, CacheStats, ModelCache};
use crate::factory::{LocalTtsType, ModelFactory, ModelLoader};
use crate::handle::LoadedModel;
use celestial_abstraction::{Device, ModelError, ParamsKey, SynthesisOutput, SynthesisRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Batching groups requests per model type and non-text parameters.
type BatchKey = (LocalTtsType, ParamsKey);

/// Configuration of the model service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Capacity, default device and release policy.
    pub cache: CacheConfig,
    /// Devices that specific model types are pinned to.
    pub device_overrides: HashMap<LocalTtsType, Device>,
    /// Merge concurrent requests with identical parameters into one backend call.
    pub batching: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { cache: CacheConfig::default(), device_overrides: HashMap::new(), batching: true }
    }
}

/// Owns the loaded models and serves synthesis requests against them.
///
/// Built once at startup and shared by `Arc` with every request handler.
pub struct ModelService {
    cache: ModelCache<LocalTtsType, ModelFactory>,
    batcher: Option<InferenceBatcher<BatchKey>>,
}

impl ModelService {
    /// Creates a service loading weights through `loader`.
    ///
    /// # Errors
    /// Returns `CacheConfigError` if the cache configuration is invalid.
    pub fn new(config: ServiceConfig, loader: Arc<dyn ModelLoader>) -> Result<Self, CacheConfigError> {
        let factory = config
            .device_overrides
            .into_iter()
            .fold(ModelFactory::new(loader), |factory, (model_type, device)| {
                factory.with_device_override(model_type, device)
            });
        let cache = ModelCache::new(config.cache, factory)?;

        info!(
            capacity = cache.capacity(),
            device = %cache.device(),
            batching = config.batching,
            "Model service ready"
        );

        Ok(Self { cache, batcher: config.batching.then(InferenceBatcher::new) })
    }

    /// Acquires the loaded model for `model_id`, loading it if needed.
    ///
    /// # Errors
    /// Returns `ModelError::UnknownModel` for an unrecognised id, or the mapped
    /// construction error.
    pub async fn model(&self, model_id: &str) -> Result<Arc<LoadedModel>, ModelError> {
        let model_type: LocalTtsType = model_id.parse()?;
        Ok(self.cache.get_or_create(&model_type).await?)
    }

    /// Synthesizes `request` with the model named `model_id`.
    ///
    /// Language and speaker are checked against the model and normalised to its
    /// spelling before inference.
    ///
    /// # Errors
    /// Returns `ModelError` for an invalid request, an unavailable model, or a
    /// failed inference.
    pub async fn synthesize(
        &self,
        model_id: &str,
        request: SynthesisRequest,
    ) -> Result<SynthesisOutput, ModelError> {
        let model_type: LocalTtsType = model_id.parse()?;
        request.validate()?;

        let mut retried = false;
        loop {
            let model = self.cache.get_or_create(&model_type).await?;
            let mut normalized = request.clone();
            normalized.language = model.validate_language(&request.language)?;
            normalized.speaker = model.validate_speaker(&request.speaker)?;

            match self.run(model_type, model, normalized).await {
                // The model was evicted between acquisition and inference.
                Err(ModelError::NotLoaded) if !retried => {
                    debug!(model_type = %model_type, "Model released before inference, reacquiring");
                    retried = true;
                }
                Ok(output) => {
                    debug!(
                        model_type = %model_type,
                        utterances = output.wavs.len(),
                        audio_secs = output.duration_secs(),
                        "Synthesis complete"
                    );
                    return Ok(output);
                }
                result => return result,
            }
        }
    }

    async fn run(
        &self,
        model_type: LocalTtsType,
        model: Arc<LoadedModel>,
        request: SynthesisRequest,
    ) -> Result<SynthesisOutput, ModelError> {
        let Some(batcher) = &self.batcher else {
            return tokio::task::spawn_blocking(move || model.generate_voice(&request))
                .await
                .map_err(|e| ModelError::Inference(format!("inference task panicked: {e}")))?;
        };

        let key = (model_type, request.params_key());
        let texts = request.texts.clone();
        let run: BatchFn = Arc::new(move |texts: Vec<String>| {
            model.generate_voice(&request.clone().with_texts(texts))
        });
        batcher.submit(key, texts, run).await
    }

    /// Loads `model_ids` ahead of the first request.
    ///
    /// Capacity still applies: preloading more models than fit evicts the earliest.
    ///
    /// # Errors
    /// Returns the first `ModelError` encountered; models loaded before it stay loaded.
    pub async fn preload(&self, model_ids: &[String]) -> Result<usize, ModelError> {
        if model_ids.len() > self.cache.capacity() {
            warn!(
                requested = model_ids.len(),
                capacity = self.cache.capacity(),
                "Preloading more models than fit, earliest ones will be evicted"
            );
        }

        let mut loaded = 0;
        for model_id in model_ids {
            self.model(model_id).await?;
            info!(model = %model_id, "Preloaded model");
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Model types currently loaded, least-recently-used first.
    #[must_use]
    pub fn loaded_models(&self) -> Vec<LocalTtsType> {
        self.cache.keys()
    }

    /// Snapshot of cache statistics.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Maximum number of simultaneously loaded models.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Default device models are loaded on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.cache.device()
    }

    /// Releases every loaded model without stopping the service.
    pub async fn unload_all(&self) -> usize {
        self.cache.evict_all().await
    }

    /// Stops accepting requests and releases every loaded model.
    pub async fn shutdown(&self) -> usize {
        let released = self.cache.shutdown().await;
        info!(released, "Model service shut down");
        released
    }
}

impl std::fmt::Debug for ModelService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelService")
            .field("cache", &self.cache)
            .field("batching", &self.batcher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockLoader, MockModel};

    fn service(capacity: usize, batching: bool) -> (ModelService, Arc<MockLoader>) {
        let loader = Arc::new(MockLoader::new());
        let config =
            ServiceConfig { cache: CacheConfig::with_capacity(capacity), batching, ..Default::default() };
        (ModelService::new(config, Arc::clone(&loader) as Arc<dyn ModelLoader>).unwrap(), loader)
    }

    #[tokio::test]
    async fn test_synthesize_with_preset_model() {
        for batching in [true, false] {
            let (service, _) = service(1, batching);
            let request = SynthesisRequest::new("Hello", "EN", "vivian");

            let output = service.synthesize("qwen3-tts-preset", request).await.unwrap();

            assert_eq!(output.wavs.len(), 1);
            assert_eq!(output.wavs[0].len(), MockModel::samples_for("Hello"));
            assert_eq!(service.loaded_models(), vec![LocalTtsType::QwenPreset]);
        }
    }

    #[tokio::test]
    async fn test_synthesize_rejects_bad_input_before_loading() {
        let (service, loader) = service(1, true);

        let unknown = service.synthesize("qwen4", SynthesisRequest::new("hi", "en", "Ryan")).await;
        assert!(matches!(unknown, Err(ModelError::UnknownModel(_))));

        let empty = service.synthesize("qwen3-tts-preset", SynthesisRequest::new(" ", "en", "Ryan")).await;
        assert!(matches!(empty, Err(ModelError::InvalidRequest(_))));

        assert_eq!(loader.loads(), 0);
    }

    #[tokio::test]
    async fn test_synthesize_validates_language_and_speaker() {
        let (service, _) = service(1, true);

        let language = service.synthesize("qwen3-tts-preset", SynthesisRequest::new("hi", "xx", "Ryan")).await;
        assert_eq!(language.unwrap_err().status_code(), 400);

        let speaker = service.synthesize("qwen3-tts-preset", SynthesisRequest::new("hi", "en", "Bob")).await;
        assert!(matches!(speaker, Err(ModelError::UnsupportedSpeaker { .. })));
    }

    #[tokio::test]
    async fn test_preload_respects_capacity() {
        let (service, loader) = service(2, true);
        let ids: Vec<String> = LocalTtsType::ALL.iter().map(ToString::to_string).collect();

        assert_eq!(service.preload(&ids).await.unwrap(), 3);

        assert_eq!(
            service.loaded_models(),
            vec![LocalTtsType::QwenVoiceClone, LocalTtsType::QwenVoiceDesign]
        );
        assert_eq!(loader.loads(), 3);
        assert_eq!(loader.unloads(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_unloads_and_rejects() {
        let (service, loader) = service(2, true);
        service.preload(&["qwen3-tts-voice-design".to_string()]).await.unwrap();

        assert_eq!(service.shutdown().await, 1);
        assert_eq!(loader.unloads(), 1);

        let result = service
            .synthesize("qwen3-tts-voice-design", SynthesisRequest::new("hi", "english", "generated"))
            .await;
        assert_eq!(result.unwrap_err().status_code(), 503);
    }
}
