use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};
use ort::execution_providers::CPUExecutionProvider;
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

use super::tokens::load_tokens;
use super::voices::VoiceTable;

/// Style vector dimension for Kitten.
pub const STYLE_DIM: usize = 256;

/// Output sample rate of the Kitten model.
pub const SAMPLE_RATE: u32 = 24000;

/// Longest token sequence fed to the model in one run (before padding).
pub const MAX_TOKENS: usize = 400;

pub const MODEL_FILE: &str = "model.fp16.onnx";
pub const VOICES_FILE: &str = "voices.bin";
pub const TOKENS_FILE: &str = "tokens.txt";

#[derive(thiserror::Error, Debug)]
pub enum KittenError {
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error(
        "espeak-ng not found. Install: Linux: `sudo apt-get install espeak-ng`, \
         macOS: `brew install espeak-ng`, Windows: https://espeak-ng.org/download"
    )]
    EspeakNotFound,
    #[error("Phonemization failed: {0}")]
    PhonemizerFailed(String),
    #[error("Kitten model directory not found: {0}")]
    ModelDirMissing(PathBuf),
    #[error("Missing model file: {0}")]
    MissingFile(PathBuf),
    #[error("Invalid tokens.txt: {0}")]
    Tokens(String),
    #[error("Failed to parse voice file: {0}")]
    VoiceParse(String),
}

/// Paths of everything a Kitten model directory must provide.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub onnx: PathBuf,
    pub voices: PathBuf,
    pub tokens: PathBuf,
}

impl ModelFiles {
    /// Locate and check the model files in `model_dir`.
    pub fn locate(model_dir: &Path) -> Result<Self, KittenError> {
        if !model_dir.is_dir() {
            return Err(KittenError::ModelDirMissing(model_dir.to_path_buf()));
        }
        let onnx = find_onnx_file(model_dir)?;
        let voices = model_dir.join(VOICES_FILE);
        let tokens = model_dir.join(TOKENS_FILE);
        for path in [&voices, &tokens] {
            if !path.is_file() {
                return Err(KittenError::MissingFile(path.clone()));
            }
        }
        Ok(Self {
            onnx,
            voices,
            tokens,
        })
    }
}

/// Loaded ONNX session plus the vocabulary and voices it was trained with.
pub struct KittenModel {
    session: Session,
    voices: VoiceTable,
    tokens: HashMap<char, i64>,
}

impl KittenModel {
    pub fn load(files: &ModelFiles, num_threads: usize) -> Result<Self, KittenError> {
        log::info!("Loading Kitten model from {}", files.onnx.display());
        let session = init_session(&files.onnx, num_threads)?;
        let voices = VoiceTable::load(&files.voices)?;
        let tokens = load_tokens(&files.tokens)?;
        Ok(Self {
            session,
            voices,
            tokens,
        })
    }

    pub fn tokens(&self) -> &HashMap<char, i64> {
        &self.tokens
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Run the model over `ids`, splitting overlong sequences. Each piece's
    /// audio is handed to `emit`; stops early once `emit` returns false.
    pub fn synthesize_ids(
        &mut self,
        ids: &[i64],
        voice_id: i32,
        speed: f32,
        mut emit: impl FnMut(Vec<f32>) -> bool,
    ) -> Result<bool, KittenError> {
        for piece in ids.chunks(MAX_TOKENS) {
            let audio = self.run(piece, voice_id, speed)?;
            if !audio.is_empty() && !emit(audio) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run(&mut self, tokens: &[i64], voice_id: i32, speed: f32) -> Result<Vec<f32>, KittenError> {
        let seq_len = tokens.len() + 2;

        // [[0, t1..tN, 0]]
        let mut padded = vec![0i64; seq_len];
        padded[1..seq_len - 1].copy_from_slice(tokens);
        let tokens_arr = Array2::from_shape_vec((1, seq_len), padded)?;

        let style = self.voices.style(voice_id);
        let style_view = ArrayView2::from_shape((1, STYLE_DIM), style.as_slice())?;
        let speed_arr = ndarray::arr1(&[speed]);

        let inputs = inputs![
            "input_ids" => TensorRef::from_array_view(tokens_arr.view())?,
            "style" => TensorRef::from_array_view(style_view)?,
            "speed" => TensorRef::from_array_view(speed_arr.view())?,
        ];
        let output = self.session.run(inputs)?;

        let first_output = output
            .iter()
            .next()
            .ok_or_else(|| KittenError::Ort(ort::Error::new("No output from model")))?;
        let waveform = first_output.1.try_extract_array::<f32>()?;

        Ok(waveform.iter().copied().collect())
    }
}

/// Prefer `model.fp16.onnx`, else the first `.onnx` file in the directory.
fn find_onnx_file(model_dir: &Path) -> Result<PathBuf, KittenError> {
    let preferred = model_dir.join(MODEL_FILE);
    if preferred.is_file() {
        return Ok(preferred);
    }

    for entry in std::fs::read_dir(model_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("onnx") {
            log::info!("Using ONNX file: {}", path.display());
            return Ok(path);
        }
    }

    Err(KittenError::MissingFile(preferred))
}

fn init_session(onnx_path: &Path, num_threads: usize) -> Result<Session, KittenError> {
    let providers = vec![CPUExecutionProvider::default().build()];
    let threads = num_threads.max(1);

    Ok(Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers(providers)?
        .with_intra_threads(threads)?
        .with_inter_threads(1)?
        .commit_from_file(onnx_path)?)
}

#[cfg(test)]
mod tests {
    use super::{find_onnx_file, KittenError, ModelFiles, MODEL_FILE, TOKENS_FILE, VOICES_FILE};

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelFiles::locate(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, KittenError::ModelDirMissing(_)));
    }

    #[test]
    fn requires_voices_and_tokens() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MODEL_FILE), b"").unwrap();
        let err = ModelFiles::locate(dir.path()).unwrap_err();
        assert!(matches!(err, KittenError::MissingFile(p) if p.ends_with(VOICES_FILE)));

        std::fs::write(dir.path().join(VOICES_FILE), b"").unwrap();
        std::fs::write(dir.path().join(TOKENS_FILE), b"").unwrap();
        let files = ModelFiles::locate(dir.path()).unwrap();
        assert!(files.onnx.ends_with(MODEL_FILE));
    }

    #[test]
    fn falls_back_to_any_onnx_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kitten_tts_nano.onnx"), b"").unwrap();
        let path = find_onnx_file(dir.path()).unwrap();
        assert!(path.ends_with("kitten_tts_nano.onnx"));
    }
}
