//! Model factory for creating loaded speech models from a model type and device.
//!
//! The factory owns the device-mapping policy and the mapping from model type to
//! checkpoint. Loading the weights themselves is delegated to a [`ModelLoader`]
//! backend.

use crate::cache::{ConstructionError, Resource};
use crate::handle::LoadedModel;
use celestial_abstraction::{Device, ModelError, TtsModel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Languages accepted by the preset-voice checkpoint.
const PRESET_LANGUAGES: &[&str] = &["zh", "en", "ja", "ko", "de", "fr", "ru", "pt", "es", "it"];

/// Languages accepted by the voice-clone and voice-design checkpoints.
const NAMED_LANGUAGES: &[&str] = &[
    "auto",
    "chinese",
    "english",
    "french",
    "german",
    "italian",
    "japanese",
    "korean",
    "portuguese",
    "russian",
    "spanish",
];

const PRESET_SPEAKERS: &[&str] =
    &["Vivian", "Serena", "Uncle_Fu", "Dylan", "Eric", "Ryan", "Aiden", "Ono_Anna", "Sohee"];

const DESIGN_SPEAKERS: &[&str] = &["generated"];

/// Local model type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocalTtsType {
    /// Qwen3 TTS with built-in preset voices.
    #[serde(rename = "qwen3-tts-preset")]
    QwenPreset,
    /// Qwen3 TTS base model cloning a reference voice.
    #[serde(rename = "qwen3-tts-voice-clone")]
    QwenVoiceClone,
    /// Qwen3 TTS designing a voice from an instruction.
    #[serde(rename = "qwen3-tts-voice-design")]
    QwenVoiceDesign,
}

impl LocalTtsType {
    /// Every local model type.
    pub const ALL: [Self; 3] = [Self::QwenPreset, Self::QwenVoiceClone, Self::QwenVoiceDesign];

    /// Identifier clients use to select this model.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::QwenPreset => "qwen3-tts-preset",
            Self::QwenVoiceClone => "qwen3-tts-voice-clone",
            Self::QwenVoiceDesign => "qwen3-tts-voice-design",
        }
    }

    /// Checkpoint the weights are loaded from.
    #[must_use]
    pub const fn checkpoint(&self) -> &'static str {
        match self {
            Self::QwenPreset => "Qwen/Qwen3-TTS-12Hz-1.7B-CustomVoice",
            Self::QwenVoiceClone => "Qwen/Qwen3-TTS-12Hz-1.7B-Base",
            Self::QwenVoiceDesign => "Qwen/Qwen3-TTS-12Hz-1.7B-VoiceDesign",
        }
    }

    /// Languages the checkpoint accepts.
    #[must_use]
    pub const fn languages(&self) -> &'static [&'static str] {
        match self {
            Self::QwenPreset => PRESET_LANGUAGES,
            Self::QwenVoiceClone | Self::QwenVoiceDesign => NAMED_LANGUAGES,
        }
    }

    /// Fixed speakers the checkpoint accepts, or `None` for persisted custom speakers.
    #[must_use]
    pub const fn speakers(&self) -> Option<&'static [&'static str]> {
        match self {
            Self::QwenPreset => Some(PRESET_SPEAKERS),
            Self::QwenVoiceDesign => Some(DESIGN_SPEAKERS),
            Self::QwenVoiceClone => None,
        }
    }
}

impl fmt::Display for LocalTtsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocalTtsType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|model_type| model_type.as_str() == s)
            .ok_or_else(|| ModelError::UnknownModel(format!("Unknown local TTS type: {s}")))
    }
}

/// Builds a ready-to-use handle for a key on a device.
///
/// Called by [`crate::ModelCache`] on the blocking pool, never twice concurrently
/// for the same key. Must not leave anything registered when it fails.
pub trait ResourceFactory<K>: Send + Sync + 'static {
    /// The handle type produced.
    type Handle: Resource;

    /// Constructs the handle for `key`.
    ///
    /// # Errors
    /// Returns `ConstructionError` if the key is unknown, the device is unusable,
    /// or the build step fails.
    fn construct(&self, key: &K, device: &Device) -> Result<Self::Handle, ConstructionError>;
}

/// Backend that loads model weights onto a device.
///
/// This is the seam to the neural-network runtime. `load` may block on disk or
/// network I/O and allocate device memory.
pub trait ModelLoader: Send + Sync {
    /// Loads `checkpoint` for `model_type` onto `device`.
    ///
    /// # Errors
    /// Returns a `ModelError` if the weights cannot be loaded.
    fn load(
        &self,
        model_type: LocalTtsType,
        checkpoint: &str,
        device: Device,
    ) -> Result<Box<dyn TtsModel>, ModelError>;

    /// Whether this backend can place models on `device`.
    fn supports_device(&self, _device: Device) -> bool {
        true
    }
}

/// Factory for creating loaded model instances.
pub struct ModelFactory {
    loader: Arc<dyn ModelLoader>,
    device_overrides: HashMap<LocalTtsType, Device>,
}

impl ModelFactory {
    /// Creates a factory loading weights through `loader`.
    #[must_use]
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self { loader, device_overrides: HashMap::new() }
    }

    /// Pins `model_type` to `device` regardless of the cache's default device.
    #[must_use]
    pub fn with_device_override(mut self, model_type: LocalTtsType, device: Device) -> Self {
        self.device_overrides.insert(model_type, device);
        self
    }

    /// Device `model_type` is placed on when the default is `default`.
    #[must_use]
    pub fn resolve_device(&self, model_type: LocalTtsType, default: Device) -> Device {
        self.device_overrides.get(&model_type).copied().unwrap_or(default)
    }
}

impl fmt::Debug for ModelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelFactory")
            .field("device_overrides", &self.device_overrides)
            .finish_non_exhaustive()
    }
}

impl ResourceFactory<LocalTtsType> for ModelFactory {
    type Handle = LoadedModel;

    fn construct(
        &self,
        model_type: &LocalTtsType,
        device: &Device,
    ) -> Result<LoadedModel, ConstructionError> {
        let device = self.resolve_device(*model_type, *device);
        if !self.loader.supports_device(device) {
            error!(model_type = %model_type, device = %device, "Device not supported by backend");
            return Err(ConstructionError::InvalidDevice(device.to_string()));
        }

        debug!(
            model_type = %model_type,
            checkpoint = model_type.checkpoint(),
            device = %device,
            "Loading model weights"
        );

        let started = Instant::now();
        let backend = self
            .loader
            .load(*model_type, model_type.checkpoint(), device)
            .map_err(|err| match err {
                ModelError::InvalidDevice(device) => ConstructionError::InvalidDevice(device),
                other => ConstructionError::Load(other),
            })?;

        info!(
            model_type = %model_type,
            device = %device,
            accelerator = device.is_accelerator(),
            duration_ms = started.elapsed().as_millis(),
            "Model weights loaded"
        );

        Ok(LoadedModel::new(*model_type, device, backend))
    }
}
