//! # Energy Voice Activity Detection
//!
//! Finds speech in 16 kHz mono audio by frame RMS energy. Voiced frames are
//! grouped into regions, regions separated by short pauses are merged, long
//! regions are split so each fits the recognizer's window, and each region is
//! padded a little so word onsets are not clipped.

use crate::transcription::resource::{SpeechSpan, SAMPLE_RATE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSettings {
    /// Frame RMS at or above this counts as voiced
    pub rms_threshold: f32,
    /// Analysis frame length in samples (320 = 20 ms)
    pub frame_samples: usize,
    /// Pauses shorter than this are bridged
    pub merge_gap_ms: u64,
    /// Regions shorter than this (before padding) are dropped
    pub min_speech_ms: u64,
    /// Longest span handed to the recognizer, padding included
    pub max_speech_ms: u64,
    /// Padding added on both sides of each region
    pub pad_ms: u64,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            rms_threshold: 0.01,
            frame_samples: 320,
            merge_gap_ms: 300,
            min_speech_ms: 250,
            max_speech_ms: 30_000,
            pad_ms: 100,
        }
    }
}

/// Stateless energy detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyVad {
    settings: VadSettings,
}

impl EnergyVad {
    pub fn new(settings: VadSettings) -> Self {
        Self { settings }
    }

    /// Speech spans as sample ranges, ordered and non-overlapping.
    pub fn detect(&self, samples: &[f32]) -> Vec<SpeechSpan> {
        let s = &self.settings;
        let frame = s.frame_samples.max(1);

        let mut regions: Vec<SpeechSpan> = Vec::new();
        let mut open: Option<usize> = None;

        for (index, chunk) in samples.chunks(frame).enumerate() {
            let sum_sq: f32 = chunk.iter().map(|x| x * x).sum();
            let rms = (sum_sq / chunk.len() as f32).sqrt();
            let start = index * frame;

            if rms >= s.rms_threshold {
                open.get_or_insert(start);
            } else if let Some(region_start) = open.take() {
                regions.push(region_start..start);
            }
        }
        if let Some(region_start) = open {
            regions.push(region_start..samples.len());
        }

        let regions = merge_by_gap(regions, ms_to_samples(s.merge_gap_ms));
        let min_len = ms_to_samples(s.min_speech_ms);
        let regions: Vec<SpeechSpan> = regions
            .into_iter()
            .filter(|region| region.len() >= min_len)
            .collect();

        let pad_len = ms_to_samples(s.pad_ms);
        let max_len = ms_to_samples(s.max_speech_ms);
        let chunk_len = match max_len.saturating_sub(2 * pad_len) {
            0 => max_len,
            len => len,
        };

        let mut regions = split_long(&regions, chunk_len);
        pad(&mut regions, pad_len, samples.len());
        regions
    }
}

fn ms_to_samples(ms: u64) -> usize {
    (ms * u64::from(SAMPLE_RATE) / 1000) as usize
}

fn merge_by_gap(regions: Vec<SpeechSpan>, max_gap: usize) -> Vec<SpeechSpan> {
    let mut merged: Vec<SpeechSpan> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            Some(current) if region.start <= current.end + max_gap => {
                current.end = current.end.max(region.end);
            }
            _ => merged.push(region),
        }
    }
    merged
}

fn split_long(regions: &[SpeechSpan], max_len: usize) -> Vec<SpeechSpan> {
    if max_len == 0 {
        return regions.to_vec();
    }

    let mut out = Vec::with_capacity(regions.len());
    for region in regions {
        let mut cursor = region.start;
        while cursor < region.end {
            let chunk_end = (cursor + max_len).min(region.end);
            out.push(cursor..chunk_end);
            cursor = chunk_end;
        }
    }
    out
}

/// Pad each region without letting neighbours overlap or run past the audio.
fn pad(regions: &mut [SpeechSpan], pad: usize, total: usize) {
    let count = regions.len();
    for i in 0..count {
        let floor = if i == 0 { 0 } else { regions[i - 1].end };
        let ceiling = if i + 1 < count {
            regions[i + 1].start
        } else {
            total
        };
        let region = &mut regions[i];
        region.start = region.start.saturating_sub(pad).max(floor);
        region.end = (region.end + pad).min(ceiling);
    }
}
