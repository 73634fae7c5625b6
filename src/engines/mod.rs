//! Speech synthesis engines.
//!
//! Each engine provides an [`crate::EngineFactory`] that the speech service
//! uses to build one engine instance per speaker slot.
//!
//! # Available Engines
//!
//! Enable engines via Cargo features:
//! - `kitten` - KittenTTS nano (ONNX format, espeak-ng required)

#[cfg(feature = "kitten")]
pub mod kitten;
