//! Wire format of the `/transcribe` response.

use super::language::Language;
use super::segmenter::SubtitleCue;
use crate::device::ComputeDevice;
use serde::{Deserialize, Serialize};

/// Display settings copied into every successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleStyle {
    pub font_size: f64,
    pub font_color: String,
    pub background_alpha: f64,
    pub background_color: String,
    pub stroke: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            font_size: 0.4,
            font_color: "#FFFFFF".to_string(),
            background_alpha: 0.5,
            background_color: "#9C27B0".to_string(),
            stroke: "none".to_string(),
            kind: "manual_transcribe".to_string(),
            version: "v1".to_string(),
        }
    }
}

/// Output of the post-processing pipeline, before styling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionResult {
    pub lang: Language,
    pub body: Vec<SubtitleCue>,
    pub device_used: ComputeDevice,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtitleResponse {
    pub font_size: f64,
    pub font_color: String,
    pub background_alpha: f64,
    pub background_color: String,
    #[serde(rename = "Stroke")]
    pub stroke: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub lang: Language,
    pub version: String,
    pub body: Vec<SubtitleCue>,
    pub device_used: ComputeDevice,
    pub status: &'static str,
}

impl SubtitleResponse {
    pub fn new(style: &SubtitleStyle, result: TranscriptionResult) -> Self {
        Self {
            font_size: style.font_size,
            font_color: style.font_color.clone(),
            background_alpha: style.background_alpha,
            background_color: style.background_color.clone(),
            stroke: style.stroke.clone(),
            kind: style.kind.clone(),
            lang: result.lang,
            version: style.version.clone(),
            body: result.body,
            device_used: result.device_used,
            status: "success",
        }
    }
}

/// Body of every failed request. `type` and `version` echo the subtitle
/// configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub body: Vec<SubtitleCue>,
}

impl ErrorResponse {
    pub fn new(style: &SubtitleStyle, message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
            kind: style.kind.clone(),
            version: style.version.clone(),
            body: Vec::new(),
        }
    }
}
