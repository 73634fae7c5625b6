//! # spatial-tts
//!
//! Pooled, streaming text-to-speech playback for several simultaneous
//! speakers in a 3D world.
//!
//! ## Features
//!
//! - **Bounded engine pool**: at most `max_speakers` synthesis engines, reused
//!   per speaker and evicted oldest-first under load
//! - **Low-latency streaming**: audio is chunked as the engine produces it and
//!   played while synthesis is still running
//! - **Spatial playback**: remote speakers follow their entity's position and
//!   stop the moment it disappears
//! - **Kitten TTS** (feature `kitten`): ONNX engine using espeak-ng
//! - **Speaker output** (feature `playback`): plays voices on the default
//!   output device through `rodio`
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! spatial-tts = { version = "2026.2", features = ["kitten"] }
//! ```
//!
//! ```ignore
//! use std::sync::Arc;
//! use spatial_tts::{
//!     driver, engines::kitten::KittenFactory, ClientConfig, PlaybackDriver, SoftwareDevice,
//!     SpeakRequestBuilder, SpeakerRegistry, SpeechService,
//! };
//!
//! let config = ClientConfig::default().shared();
//! let (handle, commands) = driver::channel();
//! let factory = Arc::new(KittenFactory::new("models/kitten-nano-en-v0_2-fp16"));
//! let service = SpeechService::new(config.clone(), factory, handle);
//! let mut driver = PlaybackDriver::new(
//!     SoftwareDevice::new(),
//!     SpeakerRegistry::new(),
//!     service.pool(),
//!     config,
//!     commands,
//! );
//!
//! service.speak(SpeakRequestBuilder::default().text("Hello there!").build()?);
//! loop {
//!     driver.tick();
//!     // ...
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cancel;
pub mod chunker;
pub mod config;
pub mod device;
pub mod driver;
pub mod engines;
pub mod pool;
pub mod position;
pub mod service;
pub mod stream;
pub mod worker;

use std::path::Path;

pub use cancel::CancelScope;
pub use chunker::{SampleChunker, STREAM_CHUNK_SAMPLES};
pub use config::{ClientConfig, ConfigError, SharedConfig, ThreadMode};
#[cfg(feature = "playback")]
pub use device::RodioDevice;
pub use device::{AudioDevice, DeviceError, SoftwareDevice, VoiceParams};
pub use driver::{DriverHandle, PlaybackDriver};
pub use pool::{Assignment, SlotPool, Speaker};
pub use position::{SpeakerLocator, SpeakerRegistry, SpeakerState};
pub use service::{SpeakRequest, SpeakRequestBuilder, SpeechService};
pub use stream::{UtteranceStream, VoiceSettings};

/// Error type returned across the engine capability boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Complete output of a non-streaming synthesis call.
#[derive(Debug)]
pub struct SynthesisResult {
    /// Raw audio samples as f32 values
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SynthesisResult {
    /// Write the audio to a 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), BoxError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// A loaded text-to-speech engine instance.
///
/// One instance belongs to one speaker slot and is only ever driven from one
/// worker thread at a time, hence `Send` but not `Sync`.
pub trait SynthesisEngine: Send {
    /// Sample rate of the audio passed to `on_progress`.
    fn sample_rate(&self) -> u32;

    /// Generate speech for `text`, handing audio to `on_progress` as soon as it
    /// is decoded. `on_progress` receives samples in [-1, 1] plus overall
    /// progress in [0, 1]; generation stops early once it returns `false`.
    fn generate_streaming(
        &mut self,
        text: &str,
        speed: f32,
        voice_id: i32,
        on_progress: &mut dyn FnMut(&[f32], f32) -> bool,
    ) -> Result<(), BoxError>;

    /// Synthesize the whole of `text` into memory.
    ///
    /// Default implementation collects `generate_streaming()` output.
    fn synthesize(
        &mut self,
        text: &str,
        speed: f32,
        voice_id: i32,
    ) -> Result<SynthesisResult, BoxError> {
        let mut samples = Vec::new();
        self.generate_streaming(text, speed, voice_id, &mut |chunk, _| {
            samples.extend_from_slice(chunk);
            true
        })?;
        Ok(SynthesisResult {
            samples,
            sample_rate: self.sample_rate(),
        })
    }

    /// Synthesize `text` and write it to a WAV file.
    fn synthesize_to_file(
        &mut self,
        text: &str,
        wav_path: &Path,
        speed: f32,
        voice_id: i32,
    ) -> Result<(), BoxError> {
        self.synthesize(text, speed, voice_id)?.write_wav(wav_path)
    }
}

/// Builds engine instances for speaker slots.
pub trait EngineFactory: Send + Sync {
    /// One-time binding to the backend (asset checks and the like). Called once;
    /// its outcome is latched by the caller.
    fn prepare(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Construct a fresh engine. Expensive; callers serialize these.
    fn create(&self, num_threads: usize) -> Result<Box<dyn SynthesisEngine>, BoxError>;
}

#[cfg(test)]
mod tests {
    use super::{BoxError, SynthesisEngine};

    struct Counting;

    impl SynthesisEngine for Counting {
        fn sample_rate(&self) -> u32 {
            8000
        }

        fn generate_streaming(
            &mut self,
            _text: &str,
            _speed: f32,
            _voice_id: i32,
            on_progress: &mut dyn FnMut(&[f32], f32) -> bool,
        ) -> Result<(), BoxError> {
            for part in 0..4 {
                let samples = [part as f32 / 4.0; 10];
                if !on_progress(&samples, (part + 1) as f32 / 4.0) {
                    break;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn synthesize_collects_streamed_audio() {
        let result = Counting.synthesize("hi", 1.0, 0).unwrap();
        assert_eq!(result.samples.len(), 40);
        assert_eq!(result.sample_rate, 8000);
        assert_eq!(result.samples[39], 0.75);
    }

    #[test]
    fn writes_float_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        Counting.synthesize_to_file("hi", &path, 1.0, 0).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.spec().bits_per_sample, 32);
        assert_eq!(reader.len(), 40);
    }
}
