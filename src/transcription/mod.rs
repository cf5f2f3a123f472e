//! # Transcription Module
//!
//! Speech-to-text on a single, lazily built inference resource.
//!
//! ## Key Components:
//! - **Lifecycle Manager** (`manager`): lazy construction, device fallback,
//!   in-flight tracking and idle eviction of the resource
//! - **Executor** (`executor`): speech detection and batched recognition on a
//!   leased resource
//! - **Whisper Loader** (`whisper`): Candle-rs Whisper weights fetched through
//!   the Hugging Face hub cache
//! - **Punctuation** (`punctuation`): post-processing of recognized text
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB
//! - **small**: ~244MB, the default
//! - **medium**: ~769MB
//! - **large**: ~1550MB, best accuracy but slowest

pub mod error;
pub mod executor;
pub mod manager;
pub mod punctuation;
pub mod resource;
pub mod whisper;

#[cfg(test)]
pub mod testing;

pub use error::ModelError;
pub use executor::{RawSegment, TranscriptionExecutor};
pub use manager::{IdleMonitor, LifecycleSettings, LifecycleSnapshot, LifecycleState, ModelManager, ResourceLease};
pub use resource::{InferenceResource, ModelBundle, ModelLoader, SAMPLE_RATE};
pub use whisper::WhisperLoader;
