//! # Audio Processing
//!
//! Turning an uploaded file into model input.
//!
//! ## Modules:
//! - **decode**: container/codec decoding, mono mixdown and resampling to 16 kHz
//! - **vad**: energy-based voice activity detection over the decoded samples

pub mod decode;
pub mod vad;

pub use decode::{decode_audio, DecodedAudio};
pub use vad::{EnergyVad, VadSettings};
