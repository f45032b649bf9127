//! Loaded model handle with an explicit, idempotent release.

use crate::cache::{ReleaseError, Resource};
use crate::factory::LocalTtsType;
use celestial_abstraction::{Device, ModelError, SynthesisOutput, SynthesisRequest, TtsModel};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// A speech model loaded onto a device.
///
/// Owns the backend until [`Resource::release`] is called. Generation calls on the
/// same handle run one at a time; a release waits for the running call to finish.
pub struct LoadedModel {
    model_type: LocalTtsType,
    device: Device,
    model_id: String,
    languages: Vec<String>,
    speakers: Option<Vec<String>>,
    backend: Mutex<Option<Box<dyn TtsModel>>>,
}

impl LoadedModel {
    /// Wraps a freshly loaded backend.
    #[must_use]
    pub fn new(model_type: LocalTtsType, device: Device, backend: Box<dyn TtsModel>) -> Self {
        Self {
            model_type,
            device,
            model_id: backend.model_id().to_string(),
            languages: backend.supported_languages(),
            speakers: backend.supported_speakers(),
            backend: Mutex::new(Some(backend)),
        }
    }

    fn backend(&self) -> MutexGuard<'_, Option<Box<dyn TtsModel>>> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The model type this handle was built for.
    #[must_use]
    pub fn model_type(&self) -> LocalTtsType {
        self.model_type
    }

    /// The device holding the weights.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Checkpoint identifier reported by the backend.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Whether the weights are still loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.backend().is_some()
    }

    /// Languages accepted by this model.
    #[must_use]
    pub fn supported_languages(&self) -> &[String] {
        &self.languages
    }

    /// Speakers accepted by this model, `None` when any identifier is accepted.
    #[must_use]
    pub fn supported_speakers(&self) -> Option<&[String]> {
        self.speakers.as_deref()
    }

    /// Resolves `language` to the spelling the backend expects.
    ///
    /// # Errors
    /// Returns `ModelError::UnsupportedLanguage` if the model does not accept it.
    pub fn validate_language(&self, language: &str) -> Result<String, ModelError> {
        self.languages
            .iter()
            .find(|supported| supported.eq_ignore_ascii_case(language))
            .cloned()
            .ok_or_else(|| {
                let mut supported = self.languages.clone();
                supported.sort();
                ModelError::UnsupportedLanguage { language: language.to_string(), supported }
            })
    }

    /// Resolves `speaker` to the spelling the backend expects.
    ///
    /// Speaker names compare case-insensitively.
    ///
    /// # Errors
    /// Returns `ModelError::UnsupportedSpeaker` if the model has a fixed speaker list
    /// that does not contain it, or `InvalidRequest` if it is empty.
    pub fn validate_speaker(&self, speaker: &str) -> Result<String, ModelError> {
        if speaker.trim().is_empty() {
            return Err(ModelError::InvalidRequest("speaker must not be empty".to_string()));
        }
        let Some(speakers) = &self.speakers else {
            return Ok(speaker.to_string());
        };
        speakers
            .iter()
            .find(|supported| supported.eq_ignore_ascii_case(speaker))
            .cloned()
            .ok_or_else(|| {
                let mut supported = speakers.clone();
                supported.sort();
                ModelError::UnsupportedSpeaker { speaker: speaker.to_string(), supported }
            })
    }

    /// Generates one waveform per text in `request`.
    ///
    /// Blocks for the duration of inference; run it on a blocking thread.
    ///
    /// # Errors
    /// Returns `ModelError::NotLoaded` after release, `InvalidRequest` for a malformed
    /// request, or the backend's error.
    pub fn generate_voice(&self, request: &SynthesisRequest) -> Result<SynthesisOutput, ModelError> {
        request.validate()?;
        let mut backend = self.backend();
        let backend = backend.as_mut().ok_or(ModelError::NotLoaded)?;

        debug!(
            model_type = %self.model_type,
            texts = request.texts.len(),
            language = %request.language,
            speaker = %request.speaker,
            "Generating voice"
        );

        let output = backend.generate_voice(request)?;
        if output.wavs.len() != request.texts.len() {
            return Err(ModelError::Inference(format!(
                "backend returned {} waveforms for {} texts",
                output.wavs.len(),
                request.texts.len()
            )));
        }
        Ok(output)
    }
}

impl Resource for LoadedModel {
    fn release(&self) -> Result<(), ReleaseError> {
        let Some(mut backend) = self.backend().take() else {
            return Ok(());
        };

        let result = backend.unload();
        drop(backend);
        info!(model_type = %self.model_type, device = %self.device, "Model unloaded");
        result.map_err(ReleaseError::Backend)
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_type", &self.model_type)
            .field("device", &self.device)
            .field("model_id", &self.model_id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
