//! Model abstraction layer for Celestial TTS.
//!
//! This module defines the core traits and types shared between speech-synthesis
//! backends and the model runtime that loads, caches and drives them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error that can occur when loading or running a speech model.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    /// The model has been unloaded and can no longer serve requests.
    #[error("Model is not loaded")]
    NotLoaded,

    /// The requested model identifier is not known to this runtime.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The compute device string could not be parsed or is unavailable.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// The requested language is not supported by the model.
    #[error("Unsupported language '{language}'. Supported: {supported:?}")]
    UnsupportedLanguage {
        /// The language that was requested.
        language: String,
        /// Languages the model accepts.
        supported: Vec<String>,
    },

    /// The requested speaker is not supported by the model.
    #[error("Unsupported speaker '{speaker}'. Supported: {supported:?}")]
    UnsupportedSpeaker {
        /// The speaker that was requested.
        speaker: String,
        /// Speakers the model accepts.
        supported: Vec<String>,
    },

    /// The synthesis request is malformed (e.g., empty text).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Loading weights or moving them to the device failed.
    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    /// The backend failed while generating audio.
    #[error("Inference error: {0}")]
    Inference(String),

    /// The model could not be made available (construction failed, runtime shutting down).
    #[error("Model unavailable: {0}")]
    Unavailable(String),
}

impl ModelError {
    /// HTTP-class status code the request layer should surface for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::UnknownModel(_)
            | Self::UnsupportedLanguage { .. }
            | Self::UnsupportedSpeaker { .. }
            | Self::InvalidRequest(_) => 400,
            Self::NotLoaded | Self::InvalidDevice(_) | Self::LoadFailed(_) | Self::Unavailable(_) => {
                503
            }
            Self::Inference(_) => 500,
        }
    }
}

/// A compute device a model can be bound to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host CPU.
    #[default]
    Cpu,
    /// CUDA GPU with the given ordinal.
    Cuda(u32),
    /// Apple Metal Performance Shaders.
    Mps,
}

impl Device {
    /// Whether models on this device consume accelerator memory.
    #[must_use]
    pub const fn is_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Mps => write!(f, "mps"),
        }
    }
}

impl FromStr for Device {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            "mps" => Ok(Self::Mps),
            other => other
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse::<u32>().ok())
                .map(Self::Cuda)
                .ok_or_else(|| ModelError::InvalidDevice(s.to_string())),
        }
    }
}

/// Parameters for a single synthesis call.
///
/// `texts` holds one or more utterances; every other field applies to all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Text(s) to synthesize.
    pub texts: Vec<String>,
    /// Language of every utterance.
    pub language: String,
    /// Speaker name (preset voices) or persisted speaker identifier.
    pub speaker: String,
    /// Optional natural-language style instruction.
    #[serde(default)]
    pub instruct: Option<String>,
    /// Top-k sampling parameter.
    #[serde(default)]
    pub top_k: Option<u32>,
    /// Top-p sampling parameter.
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Sampling temperature; higher means more random.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Penalty to reduce repeated codec tokens.
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    /// Maximum number of new codec tokens to generate.
    #[serde(default)]
    pub max_new_tokens: Option<u32>,
}

impl SynthesisRequest {
    /// Creates a request for a single utterance with default sampling parameters.
    #[must_use]
    pub fn new(text: impl Into<String>, language: impl Into<String>, speaker: impl Into<String>) -> Self {
        Self {
            texts: vec![text.into()],
            language: language.into(),
            speaker: speaker.into(),
            instruct: None,
            top_k: None,
            top_p: None,
            temperature: None,
            repetition_penalty: None,
            max_new_tokens: None,
        }
    }

    /// Replaces the utterances of this request.
    #[must_use]
    pub fn with_texts(mut self, texts: Vec<String>) -> Self {
        self.texts = texts;
        self
    }

    /// Sets the style instruction.
    #[must_use]
    pub fn with_instruct(mut self, instruct: impl Into<String>) -> Self {
        self.instruct = Some(instruct.into());
        self
    }

    /// Checks the request is well formed.
    ///
    /// # Errors
    /// Returns `ModelError::InvalidRequest` when there is no text, a text is empty,
    /// or the instruction is present but empty.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.texts.is_empty() {
            return Err(ModelError::InvalidRequest("at least one text is required".to_string()));
        }
        if let Some(index) = self.texts.iter().position(|t| t.trim().is_empty()) {
            return Err(ModelError::InvalidRequest(format!("text at index {index} is empty")));
        }
        if self.instruct.as_deref().is_some_and(str::is_empty) {
            return Err(ModelError::InvalidRequest("instruct must not be empty".to_string()));
        }
        Ok(())
    }

    /// Key identifying every parameter except the texts.
    ///
    /// Two requests with equal keys can be merged into one batched backend call.
    #[must_use]
    pub fn params_key(&self) -> ParamsKey {
        ParamsKey {
            language: self.language.clone(),
            speaker: self.speaker.clone(),
            instruct: self.instruct.clone(),
            top_k: self.top_k,
            top_p: self.top_p.map(f32::to_bits),
            temperature: self.temperature.map(f32::to_bits),
            repetition_penalty: self.repetition_penalty.map(f32::to_bits),
            max_new_tokens: self.max_new_tokens,
        }
    }
}

/// Hashable projection of the non-text fields of a [`SynthesisRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamsKey {
    language: String,
    speaker: String,
    instruct: Option<String>,
    top_k: Option<u32>,
    top_p: Option<u32>,
    temperature: Option<u32>,
    repetition_penalty: Option<u32>,
    max_new_tokens: Option<u32>,
}

/// Audio produced by a synthesis call: one waveform per input text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOutput {
    /// Mono f32 samples, one vector per utterance.
    pub wavs: Vec<Vec<f32>>,
    /// Sample rate shared by every waveform.
    pub sample_rate: u32,
}

impl SynthesisOutput {
    /// Total duration of all waveforms in seconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self) -> f64 {
        let samples: usize = self.wavs.iter().map(Vec::len).sum();
        samples as f64 / f64::from(self.sample_rate)
    }
}

/// A loaded speech-synthesis backend bound to one device.
///
/// Implementations own the model weights. Calls take `&mut self`: the runtime
/// never runs two generations on the same backend at once.
pub trait TtsModel: Send {
    /// Identifier of the checkpoint this backend was loaded from.
    fn model_id(&self) -> &str;

    /// Languages accepted by [`TtsModel::generate_voice`].
    fn supported_languages(&self) -> Vec<String>;

    /// Speakers accepted by [`TtsModel::generate_voice`], or `None` when any
    /// speaker identifier is accepted.
    fn supported_speakers(&self) -> Option<Vec<String>>;

    /// Generates one waveform per text in `request`.
    ///
    /// # Errors
    /// Returns a `ModelError` if generation fails.
    fn generate_voice(&mut self, request: &SynthesisRequest) -> Result<SynthesisOutput, ModelError>;

    /// Frees device and host memory held by the weights.
    ///
    /// Must return only once the memory has actually been released.
    ///
    /// # Errors
    /// Returns a `ModelError` if the backend could not confirm the release.
    fn unload(&mut self) -> Result<(), ModelError>;
}
