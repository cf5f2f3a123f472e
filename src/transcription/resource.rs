//! # Inference Resource
//!
//! The opaque handle the lifecycle manager owns: a bundle of loaded models
//! (speech detection, recognition, punctuation) bound to one compute device.
//!
//! ## Key Rust Concepts:
//! - **Trait objects**: `Box<dyn ModelBundle>` hides which recognizer is loaded,
//!   so the manager and executor can be tested with fakes
//! - **Mutex around the models**: recognition mutates decoder state (KV cache),
//!   so at most one batch runs on the resource at a time

use crate::device::ComputeDevice;
use chrono::{DateTime, Utc};
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Sample rate every model in the bundle works at.
pub const SAMPLE_RATE: u32 = 16_000;

/// A stretch of detected speech, as sample offsets into 16 kHz mono audio.
pub type SpeechSpan = Range<usize>;

/// The loaded models behind an inference resource.
///
/// Implementations are driven from blocking threads only.
pub trait ModelBundle: Send {
    /// Locate speech in the audio. Spans must be ordered and non-overlapping.
    fn detect_speech(&self, samples: &[f32]) -> Vec<SpeechSpan>;

    /// Recognize one span of speech.
    fn recognize(&mut self, samples: &[f32]) -> anyhow::Result<String>;

    /// Restore or normalize punctuation on recognized text.
    fn punctuate(&self, text: &str) -> String;
}

/// Builds a model bundle on a given device.
///
/// Called from a blocking thread by the lifecycle manager, once per device in
/// the fallback order until one attempt succeeds.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, device: ComputeDevice) -> anyhow::Result<Box<dyn ModelBundle>>;
}

/// Models bound to a device, owned by the lifecycle manager.
pub struct InferenceResource {
    device: ComputeDevice,
    models: Mutex<Box<dyn ModelBundle>>,
    loaded_at: DateTime<Utc>,
}

impl InferenceResource {
    pub fn new(device: ComputeDevice, models: Box<dyn ModelBundle>) -> Self {
        Self {
            device,
            models: Mutex::new(models),
            loaded_at: Utc::now(),
        }
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Exclusive access to the models for one batch of work.
    ///
    /// A panic during an earlier batch poisons the mutex; the models are still
    /// structurally valid (decoder caches are flushed per span) so the guard
    /// is recovered instead of failing every later request.
    pub fn lock_models(&self) -> MutexGuard<'_, Box<dyn ModelBundle>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for InferenceResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceResource")
            .field("device", &self.device)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}
