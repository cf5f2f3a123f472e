//! # Subtitle Module
//!
//! Turns recognizer output into the subtitle document returned to clients:
//! language detection, cue segmentation and style injection.

pub mod language;
pub mod response;
pub mod segmenter;

pub use language::{detect_language, Language};
pub use response::{ErrorResponse, SubtitleResponse, SubtitleStyle, TranscriptionResult};
pub use segmenter::{OversizedPolicy, SegmentationSettings, SubtitleCue};

use crate::device::ComputeDevice;
use crate::transcription::RawSegment;

/// Post-processing applied to every finished transcription.
#[derive(Debug, Clone)]
pub struct SubtitlePipeline {
    pub chinese_ratio_threshold: f64,
    pub segmentation: SegmentationSettings,
    /// Use recognizer timing; when off, cues get synthetic times
    pub enable_timestamp: bool,
    pub style: SubtitleStyle,
}

impl SubtitlePipeline {
    pub fn build(&self, segments: &[RawSegment], device_used: ComputeDevice) -> TranscriptionResult {
        let transcript: String = segments.iter().map(|s| s.text.as_str()).collect();
        let lang = detect_language(&transcript, self.chinese_ratio_threshold);

        let body = if self.enable_timestamp {
            segmenter::segment(segments, &self.segmentation)
        } else {
            segmenter::segment_untimed(&transcript, lang, &self.segmentation)
        };

        TranscriptionResult {
            lang,
            body,
            device_used,
        }
    }

    pub fn respond(&self, result: TranscriptionResult) -> SubtitleResponse {
        SubtitleResponse::new(&self.style, result)
    }

    pub fn error(&self, message: impl Into<String>) -> ErrorResponse {
        ErrorResponse::new(&self.style, message)
    }
}
