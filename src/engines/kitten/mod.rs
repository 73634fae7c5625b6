//! KittenTTS nano engine.
//!
//! Runs the Kitten ONNX model through `ort`, phonemizing with espeak-ng. Each
//! speaker slot builds its own [`KittenEngine`] through a shared
//! [`KittenFactory`].
//!
//! # System Requirements
//!
//! **espeak-ng** must be installed, or bundled and passed through
//! [`KittenFactory::with_espeak`]:
//! - **Linux**: `sudo apt-get install espeak-ng`
//! - **macOS**: `brew install espeak-ng`
//! - **Windows**: Download installer from <https://espeak-ng.org/download>
//!
//! # Model Directory Layout
//!
//! ```text
//! models/kitten-nano-en-v0_2-fp16/
//! ├── model.fp16.onnx     # preferred; any other .onnx is used as a fallback
//! ├── voices.bin          # little-endian f32 style vectors, 256 per voice
//! ├── tokens.txt          # "<symbol> <id>" per line
//! └── espeak-ng-data/     # optional bundled espeak-ng data
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use spatial_tts::{engines::kitten::KittenFactory, EngineFactory};
//!
//! let factory = KittenFactory::new("models/kitten-nano-en-v0_2-fp16");
//! factory.prepare()?;
//! let mut engine = factory.create(2)?;
//! let result = engine.synthesize("Hello, world!", 1.0, 0)?;
//! println!("{} samples at {} Hz", result.samples.len(), result.sample_rate);
//! # Ok::<(), spatial_tts::BoxError>(())
//! ```

pub mod engine;
pub mod model;
pub mod phonemizer;
pub mod tokens;
pub mod voices;

pub use engine::{KittenEngine, KittenFactory};
pub use model::KittenError;
