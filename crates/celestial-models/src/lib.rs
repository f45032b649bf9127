//! Model lifecycle management for Celestial TTS.
//!
//! This crate keeps a bounded number of speech models loaded on a device.
//!
//! # Components
//!
//! - **Factory**: turns a model type and device into a loaded model
//! - **Cache**: bounded LRU cache with single-flight construction
//! - **Batcher**: merges concurrent synthesis calls sharing parameters
//! - **Service**: request-facing facade over the cache and batcher
//! - **Mock**: deterministic backend for testing and development

pub mod batcher;
pub mod cache;
pub mod factory;
pub mod handle;
pub mod service;

use celestial_abstraction::{Device, ModelError, SynthesisOutput, SynthesisRequest, TtsModel};
use std::collections::HashSet;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

pub use batcher::{BatchFn, InferenceBatcher};
pub use cache::{
    CacheConfig, CacheConfigError, CacheStats, CachedModel, ConstructionError, ModelCache,
    ReleaseError, ReleasePolicy, Resource, ResourceKey,
};
pub use factory::{LocalTtsType, ModelFactory, ModelLoader, ResourceFactory};
pub use handle::LoadedModel;
pub use service::{ModelService, ServiceConfig};

/// Sample rate of the audio produced by the mock backend.
pub const MOCK_SAMPLE_RATE: u32 = 24_000;

/// Samples generated per input character by the mock backend (10 ms).
const SAMPLES_PER_CHAR: usize = 240;

/// A mock speech model producing a deterministic tone.
///
/// Output length is proportional to the text length, so tests can check which
/// waveform belongs to which text.
#[derive(Debug)]
pub struct MockModel {
    model_type: LocalTtsType,
    unloads: Arc<AtomicUsize>,
    fail_unload: bool,
}

impl MockModel {
    /// Creates a mock model advertising the languages and speakers of `model_type`.
    #[must_use]
    pub fn new(model_type: LocalTtsType) -> Self {
        Self { model_type, unloads: Arc::new(AtomicUsize::new(0)), fail_unload: false }
    }

    /// Counter incremented every time this model is unloaded.
    #[must_use]
    pub fn unload_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.unloads)
    }

    /// Number of samples the mock produces for `text`.
    #[must_use]
    pub fn samples_for(text: &str) -> usize {
        text.chars().count() * SAMPLES_PER_CHAR
    }
}

impl TtsModel for MockModel {
    fn model_id(&self) -> &str {
        self.model_type.checkpoint()
    }

    fn supported_languages(&self) -> Vec<String> {
        self.model_type.languages().iter().map(ToString::to_string).collect()
    }

    fn supported_speakers(&self) -> Option<Vec<String>> {
        self.model_type.speakers().map(|speakers| speakers.iter().map(ToString::to_string).collect())
    }

    #[allow(clippy::cast_precision_loss)]
    fn generate_voice(&mut self, request: &SynthesisRequest) -> Result<SynthesisOutput, ModelError> {
        debug!(
            model_type = %self.model_type,
            texts = request.texts.len(),
            "MockModel generating voice"
        );

        let pitch = 110.0 + (request.speaker.len() % 8) as f32 * 20.0;
        let wavs = request
            .texts
            .iter()
            .map(|text| {
                (0..Self::samples_for(text))
                    .map(|i| (TAU * pitch * i as f32 / MOCK_SAMPLE_RATE as f32).sin() * 0.25)
                    .collect()
            })
            .collect();

        Ok(SynthesisOutput { wavs, sample_rate: MOCK_SAMPLE_RATE })
    }

    fn unload(&mut self) -> Result<(), ModelError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_unload {
            return Err(ModelError::Inference(format!("{} did not free its memory", self.model_type)));
        }
        Ok(())
    }
}

/// A loader producing [`MockModel`]s, with knobs for failure scenarios.
#[derive(Debug, Default)]
pub struct MockLoader {
    load_delay: Option<Duration>,
    cpu_only: bool,
    failing: HashSet<LocalTtsType>,
    failing_unload: HashSet<LocalTtsType>,
    loads: AtomicUsize,
    unloads: Arc<AtomicUsize>,
}

impl MockLoader {
    /// Creates a loader that succeeds instantly on every device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks every load for `delay`, simulating reading weights from disk.
    #[must_use]
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Rejects every device except the CPU.
    #[must_use]
    pub fn cpu_only(mut self) -> Self {
        self.cpu_only = true;
        self
    }

    /// Fails every load of `model_type`.
    #[must_use]
    pub fn failing_for(mut self, model_type: LocalTtsType) -> Self {
        self.failing.insert(model_type);
        self
    }

    /// Makes models of `model_type` report an error when unloaded.
    #[must_use]
    pub fn failing_unload_for(mut self, model_type: LocalTtsType) -> Self {
        self.failing_unload.insert(model_type);
        self
    }

    /// Number of successful loads so far.
    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of unloads across every model this loader produced.
    #[must_use]
    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for MockLoader {
    fn load(
        &self,
        model_type: LocalTtsType,
        checkpoint: &str,
        device: Device,
    ) -> Result<Box<dyn TtsModel>, ModelError> {
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        if self.failing.contains(&model_type) {
            return Err(ModelError::LoadFailed(format!("mock weights missing for {checkpoint}")));
        }

        self.loads.fetch_add(1, Ordering::SeqCst);
        debug!(model_type = %model_type, device = %device, "MockLoader loaded model");

        Ok(Box::new(MockModel {
            model_type,
            unloads: Arc::clone(&self.unloads),
            fail_unload: self.failing_unload.contains(&model_type),
        }))
    }

    fn supports_device(&self, device: Device) -> bool {
        !self.cpu_only || device == Device::Cpu
    }
}
