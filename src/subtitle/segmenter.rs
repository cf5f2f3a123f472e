//! # Subtitle Segmentation
//!
//! Merges recognizer segments into subtitle cues.
//!
//! ## Merge rule:
//! A cue stays open while its duration (last end minus first start) is still
//! below `duration_per_segment`; the next segment is appended only if the
//! merged text stays within `max_segment_length` characters. Otherwise the cue
//! is closed and the segment opens a new one. A segment that is too long on
//! its own always becomes a cue of its own and is handled by the
//! [`OversizedPolicy`].

use super::language::Language;
use crate::transcription::RawSegment;
use serde::{Deserialize, Serialize};

/// Screen position code for bottom-centered subtitles.
pub const CUE_LOCATION: u8 = 2;

/// One subtitle entry in the response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitleCue {
    pub from: f64,
    pub to: f64,
    pub sid: u32,
    pub location: u8,
    pub content: String,
    pub music: u8,
}

/// What to do with a single segment longer than `max_segment_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OversizedPolicy {
    /// Emit the text unmodified as its own cue
    #[default]
    Keep,
    /// Cut the text to `max_segment_length` characters
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentationSettings {
    pub max_segment_length: usize,
    pub duration_per_segment: f64,
    pub oversized: OversizedPolicy,
}

struct OpenCue {
    from: f64,
    to: f64,
    text: String,
}

/// Merge timed segments into cues.
pub fn segment(segments: &[RawSegment], settings: &SegmentationSettings) -> Vec<SubtitleCue> {
    let mut cues = Vec::new();
    let mut open: Option<OpenCue> = None;

    for seg in segments {
        if seg.text.trim().is_empty() {
            continue;
        }

        if let Some(cue) = open.as_mut() {
            let still_short = cue.to - cue.from < settings.duration_per_segment;
            let merged_len = char_len(&format!("{}{}", cue.text, seg.text));

            if still_short && merged_len <= settings.max_segment_length {
                cue.text.push_str(&seg.text);
                cue.to = seg.end_sec;
                continue;
            }
        }

        if let Some(cue) = open.take() {
            push_cue(&mut cues, cue, settings);
        }
        open = Some(OpenCue {
            from: seg.start_sec,
            to: seg.end_sec,
            text: seg.text.clone(),
        });
    }

    if let Some(cue) = open {
        push_cue(&mut cues, cue, settings);
    }
    cues
}

/// Cues for transcripts without usable timing: split on sentence punctuation,
/// merge sentences up to `max_segment_length` and space cues
/// `duration_per_segment` apart.
pub fn segment_untimed(text: &str, lang: Language, settings: &SegmentationSettings) -> Vec<SubtitleCue> {
    let separator = match lang {
        Language::Zh | Language::Ja => "，",
        Language::En | Language::Ko => ", ",
    };

    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        if current.is_empty() {
            current = sentence.to_string();
            continue;
        }

        let merged = format!("{}{}{}", current, separator, sentence);
        if char_len(&merged) <= settings.max_segment_length {
            current = merged;
        } else {
            lines.push(std::mem::replace(&mut current, sentence.to_string()));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }

    let step = settings.duration_per_segment;
    let mut cues = Vec::with_capacity(lines.len());
    for (i, line) in lines.into_iter().enumerate() {
        let cue = OpenCue {
            from: i as f64 * step,
            to: (i + 1) as f64 * step,
            text: line,
        };
        push_cue(&mut cues, cue, settings);
    }
    cues
}

/// Sentence pieces, trimmed and non-empty. Full-width marks always split;
/// ASCII marks split only when followed by whitespace, so "3.5" survives.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '，' | '。' | '！' | '？' | '；' | '：' | '、' => true,
            '.' | ',' | '!' | '?' | ';' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };

        if boundary {
            pieces.push(&text[start..i]);
            start = i + c.len_utf8();
        }
    }
    pieces.push(&text[start..]);

    pieces
        .into_iter()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn push_cue(cues: &mut Vec<SubtitleCue>, cue: OpenCue, settings: &SegmentationSettings) {
    let mut content = cue.text.trim().to_string();
    if content.is_empty() {
        return;
    }

    if settings.oversized == OversizedPolicy::Truncate && char_len(&content) > settings.max_segment_length {
        content = content
            .chars()
            .take(settings.max_segment_length)
            .collect::<String>()
            .trim_end()
            .to_string();
    }

    let from = round2(cue.from.max(0.0));
    let mut to = round2(cue.to);
    if to <= from {
        to = round2(from + 0.01);
    }

    cues.push(SubtitleCue {
        from,
        to,
        sid: cues.len() as u32 + 1,
        location: CUE_LOCATION,
        content,
        music: 0,
    });
}

fn char_len(text: &str) -> usize {
    text.trim().chars().count()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
