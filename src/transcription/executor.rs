//! # Transcription Executor
//!
//! Runs recognition on an acquired resource: speech detection, then
//! recognition and punctuation span by span. Spans are processed in batches
//! bounded by total speech duration; each batch holds the resource's model
//! lock on a blocking thread, and the lock is released between batches so
//! concurrent requests interleave.
//!
//! Every blocking closure owns a clone of the caller's lease. If the request
//! is cancelled while a batch runs, the batch still counts as in flight and
//! the resource cannot be evicted under it.

use super::error::ModelError;
use super::manager::ResourceLease;
use super::resource::{SpeechSpan, SAMPLE_RATE};
use crate::device::{classify_failure, FailureClass};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Recognizer output for one speech span, times in seconds from file start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSegment {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct TranscriptionExecutor {
    /// Maximum seconds of speech recognized per batch
    batch_size_s: f64,
}

impl TranscriptionExecutor {
    pub fn new(batch_size_s: f64) -> Self {
        Self { batch_size_s }
    }

    /// Transcribe 16 kHz mono samples on the leased resource.
    ///
    /// ## Returns:
    /// - **Ok(segments)**: ordered, non-overlapping segments with non-blank text
    /// - **Err(InvalidInput)**: the audio has no samples
    /// - **Err(InferenceFailed)**: the recognizer failed; if the device ran out
    ///   of memory the resource is also marked for eviction
    pub async fn run(
        &self,
        lease: &ResourceLease,
        samples: Vec<f32>,
    ) -> Result<Vec<RawSegment>, ModelError> {
        if samples.is_empty() {
            return Err(ModelError::InvalidInput(
                "audio contains no samples".to_string(),
            ));
        }

        let started = Instant::now();
        let audio_secs = samples.len() as f64 / f64::from(SAMPLE_RATE);
        let samples = Arc::new(samples);

        let spans = {
            let work = lease.clone();
            let samples = Arc::clone(&samples);
            tokio::task::spawn_blocking(move || {
                let models = work.resource().lock_models();
                models.detect_speech(&samples)
            })
            .await
            .map_err(|e| ModelError::InferenceFailed(format!("speech detection task failed: {}", e)))?
        };

        if spans.is_empty() {
            debug!(audio_secs, "No speech detected");
            return Ok(Vec::new());
        }

        let batches = plan_batches(spans, self.batch_size_s);
        debug!(batches = batches.len(), "Planned recognition batches");

        let mut segments = Vec::new();
        for batch in batches {
            let work = lease.clone();
            let samples = Arc::clone(&samples);

            let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<RawSegment>> {
                let mut models = work.resource().lock_models();
                let mut out = Vec::with_capacity(batch.len());

                for span in batch {
                    let end = span.end.min(samples.len());
                    if span.start >= end {
                        continue;
                    }

                    let text = models.recognize(&samples[span.start..end])?;
                    let text = models.punctuate(&text);
                    if text.trim().is_empty() {
                        continue;
                    }

                    out.push(RawSegment {
                        start_sec: span.start as f64 / f64::from(SAMPLE_RATE),
                        end_sec: end as f64 / f64::from(SAMPLE_RATE),
                        text,
                    });
                }
                Ok(out)
            })
            .await;

            match outcome {
                Ok(Ok(batch_segments)) => segments.extend(batch_segments),
                Ok(Err(err)) => {
                    if classify_failure(&err) == FailureClass::ResourceExhausted {
                        warn!(device = %lease.device(), "Device exhausted during inference");
                        lease.request_eviction();
                    }
                    return Err(ModelError::InferenceFailed(format!("{:#}", err)));
                }
                Err(join_error) => {
                    return Err(ModelError::InferenceFailed(format!(
                        "inference task failed: {}",
                        join_error
                    )));
                }
            }
        }

        info!(
            device = %lease.device(),
            audio_secs,
            segments = segments.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transcription finished"
        );
        Ok(segments)
    }
}

/// Group spans so each batch carries at most `batch_size_s` of speech. A span
/// longer than the budget gets a batch of its own.
fn plan_batches(spans: Vec<SpeechSpan>, batch_size_s: f64) -> Vec<Vec<SpeechSpan>> {
    let budget = (batch_size_s.max(0.0) * f64::from(SAMPLE_RATE)) as usize;
    let mut batches: Vec<Vec<SpeechSpan>> = Vec::new();
    let mut current: Vec<SpeechSpan> = Vec::new();
    let mut current_len = 0usize;

    for span in spans {
        let len = span.len();
        if !current.is_empty() && current_len + len > budget {
            batches.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += len;
        current.push(span);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
