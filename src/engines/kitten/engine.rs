use std::path::{Path, PathBuf};

use crate::{BoxError, EngineFactory, SynthesisEngine};

use super::model::{KittenError, KittenModel, ModelFiles, SAMPLE_RATE};
use super::phonemizer::{phonemize, split_sentences, EspeakConfig};

/// Builds one [`KittenEngine`] per speaker slot from a shared model directory.
///
/// # Bundled espeak-ng
///
/// ```rust,no_run
/// use spatial_tts::engines::kitten::KittenFactory;
/// use std::path::PathBuf;
///
/// let factory = KittenFactory::new("/app/models/kitten").with_espeak(
///     Some(PathBuf::from("/app/resources/espeak-ng/espeak-ng")),
///     Some(PathBuf::from("/app/models/kitten/espeak-ng-data")),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct KittenFactory {
    model_dir: PathBuf,
    espeak: EspeakConfig,
    lang: String,
}

impl KittenFactory {
    /// Use `espeak-ng` from PATH, with the model directory's bundled
    /// `espeak-ng-data` when present.
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        let model_dir = model_dir.into();
        let bundled = model_dir.join("espeak-ng-data");
        Self {
            espeak: EspeakConfig {
                bin_path: None,
                data_path: bundled.is_dir().then_some(bundled),
            },
            model_dir,
            lang: "en-us".to_string(),
        }
    }

    /// Override the espeak-ng binary and data paths. `None` keeps the system default.
    pub fn with_espeak(mut self, bin_path: Option<PathBuf>, data_path: Option<PathBuf>) -> Self {
        self.espeak = EspeakConfig {
            bin_path,
            data_path,
        };
        self
    }

    /// espeak-ng voice used for phonemization (default `en-us`).
    pub fn with_language(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }
}

impl EngineFactory for KittenFactory {
    fn prepare(&self) -> Result<(), BoxError> {
        ModelFiles::locate(&self.model_dir)?;
        if !self.espeak.is_available() {
            return Err(KittenError::EspeakNotFound.into());
        }
        Ok(())
    }

    fn create(&self, num_threads: usize) -> Result<Box<dyn SynthesisEngine>, BoxError> {
        let files = ModelFiles::locate(&self.model_dir)?;
        let model = KittenModel::load(&files, num_threads)?;
        Ok(Box::new(KittenEngine {
            model,
            espeak: self.espeak.clone(),
            lang: self.lang.clone(),
        }))
    }
}

/// Kitten text-to-speech engine. Streams one sentence at a time.
pub struct KittenEngine {
    model: KittenModel,
    espeak: EspeakConfig,
    lang: String,
}

impl SynthesisEngine for KittenEngine {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn generate_streaming(
        &mut self,
        text: &str,
        speed: f32,
        voice_id: i32,
        on_progress: &mut dyn FnMut(&[f32], f32) -> bool,
    ) -> Result<(), BoxError> {
        let voices = self.model.voice_count();
        if usize::try_from(voice_id).map_or(true, |id| id >= voices) {
            log::debug!("Voice {voice_id} not among {voices} voices; using voice 0");
        }
        let sentences = split_sentences(text);
        let total = sentences.len().max(1) as f32;

        for (index, sentence) in sentences.iter().enumerate() {
            let ids = phonemize(sentence, &self.lang, self.model.tokens(), &self.espeak)?;
            if ids.is_empty() {
                log::warn!("No phoneme tokens produced for sentence: {sentence:?}");
                continue;
            }
            let progress = (index + 1) as f32 / total;
            let keep_going = self
                .model
                .synthesize_ids(&ids, voice_id, speed, |audio| on_progress(&audio, progress))?;
            if !keep_going {
                break;
            }
        }
        Ok(())
    }
}
