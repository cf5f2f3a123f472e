//! Upload decoding: any container symphonia understands, mixed down to mono
//! and resampled to 16 kHz f32.

use crate::transcription::resource::SAMPLE_RATE;
use anyhow::{anyhow, Context, Result};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decoded upload, ready for the recognizer.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub source_sample_rate: u32,
    pub channels: usize,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / f64::from(SAMPLE_RATE)
    }
}

/// Decode audio bytes into 16 kHz mono samples.
///
/// ## Parameters:
/// - **data**: raw file contents
/// - **filename**: upload filename, used only for its extension as a probe hint
/// - **mime_type**: upload content type, also a hint
pub fn decode_audio(data: Vec<u8>, filename: Option<&str>, mime_type: Option<&str>) -> Result<DecodedAudio> {
    if data.is_empty() {
        return Err(anyhow!("uploaded file is empty"));
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());
    let hint = probe_hint(filename, mime_type);

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("unrecognized audio format")?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no audio track found"))?;

    let codec_params = track.codec_params.clone();
    let track_id = track.id;
    let source_rate = codec_params.sample_rate.unwrap_or(SAMPLE_RATE);
    let channels = codec_params.channels.map_or(1, |c| c.count()).max(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .context("unsupported audio codec")?;

    let mut mono: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(anyhow!("failed to read audio packet: {}", e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt frame is skipped, the rest of the stream is still usable
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(anyhow!("failed to decode audio: {}", e)),
        };

        let spec = *decoded.spec();
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);

        let frame_channels = spec.channels.count().max(1);
        if frame_channels > 1 {
            mono.extend(
                buffer
                    .samples()
                    .chunks(frame_channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame_channels as f32),
            );
        } else {
            mono.extend_from_slice(buffer.samples());
        }
    }

    if mono.is_empty() {
        return Err(anyhow!("no audio samples decoded"));
    }

    let samples = if source_rate != SAMPLE_RATE {
        resample(&mono, source_rate, SAMPLE_RATE)?
    } else {
        mono
    };

    Ok(DecodedAudio {
        samples,
        source_sample_rate: source_rate,
        channels,
    })
}

fn probe_hint(filename: Option<&str>, mime_type: Option<&str>) -> Hint {
    let mut hint = Hint::new();

    if let Some(ext) = filename
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
    {
        hint.with_extension(&ext.to_lowercase());
    }

    if let Some(mime) = mime_type {
        hint.mime_type(mime);
    }

    hint
}

/// Resample mono audio with a windowed-sinc resampler.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let chunk_size = 1024;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| anyhow!("failed to create resampler: {}", e))?;

    let expected = (samples.len() as u64 * u64::from(to_rate)).div_ceil(u64::from(from_rate)) as usize;
    let mut output = Vec::with_capacity(expected + chunk_size);

    for chunk in samples.chunks(chunk_size) {
        let mut input = chunk.to_vec();
        // Last chunk is zero padded
        input.resize(chunk_size, 0.0);

        let wave = vec![input];
        let resampled = resampler
            .process(&wave, None)
            .map_err(|e| anyhow!("resampling failed: {}", e))?;

        if let Some(channel) = resampled.first() {
            output.extend_from_slice(channel);
        }
    }

    // Drop the tail produced by the zero padding
    output.truncate(expected);
    Ok(output)
}
