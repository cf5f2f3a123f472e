//! # Whisper Model Bundle
//!
//! The production [`ModelLoader`]: fetches a Whisper checkpoint from the
//! HuggingFace Hub, loads it with Candle on the requested device and pairs it
//! with the energy VAD and the configured punctuator.
//!
//! ## Loading Process:
//! 1. Resolve the checkpoint name (`small`, `openai/whisper-small`, ...)
//! 2. Fetch `config.json`, `tokenizer.json` and `model.safetensors` (cache first
//!    when updates are disabled)
//! 3. Build the Slaney mel filterbank for the model's mel bin count
//! 4. Memory-map the weights onto the device
//!
//! Out-of-memory errors from step 4 surface unchanged so the lifecycle
//! manager can fall back to the next device.

use super::punctuation::Punctuator;
use super::resource::{ModelBundle, ModelLoader, SpeechSpan, SAMPLE_RATE};
use crate::audio::{EnergyVad, VadSettings};
use crate::device::ComputeDevice;
use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use std::path::PathBuf;
use std::str::FromStr;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Named Whisper checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v3",
        }
    }
}

impl FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

/// HuggingFace repository for a configured model name: either a size alias or
/// a full `owner/repo` id.
pub fn resolve_repo(name: &str) -> Result<String> {
    if let Ok(size) = name.parse::<ModelSize>() {
        return Ok(size.repo_name().to_string());
    }
    if name.split('/').count() == 2 && !name.starts_with('/') && !name.ends_with('/') {
        return Ok(name.to_string());
    }
    bail!("Model name '{}' is neither a size nor an owner/repo id", name)
}

/// Speech detector selected by `model.vad_model`.
pub fn resolve_vad(name: &str) -> Result<EnergyVad> {
    match name.to_lowercase().as_str() {
        "energy" => Ok(EnergyVad::new(VadSettings::default())),
        other => bail!("Unknown VAD model: {}", other),
    }
}

/// Everything needed to build a Whisper bundle on some device.
#[derive(Debug, Clone)]
pub struct WhisperLoader {
    repo: String,
    language: Option<String>,
    vad: EnergyVad,
    punctuator: Punctuator,
    /// Check the hub for newer files instead of trusting the local cache
    refresh: bool,
    cache_dir: Option<PathBuf>,
}

impl WhisperLoader {
    pub fn new(
        model_name: &str,
        vad_model: &str,
        punc_model: &str,
        language: Option<String>,
        disable_update: bool,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            repo: resolve_repo(model_name)?,
            language,
            vad: resolve_vad(vad_model)?,
            punctuator: punc_model.parse().map_err(|e: String| anyhow!(e))?,
            refresh: !disable_update,
            cache_dir,
        })
    }

    fn api_repo(&self) -> Result<ApiRepo> {
        let mut builder = ApiBuilder::new().with_progress(false);

        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }

        let cache_dir = self.cache_dir.clone().or_else(|| {
            std::env::var("HF_HUB_CACHE")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HF_HOME").map(|home| PathBuf::from(home).join("hub")))
                .ok()
        });
        if let Some(dir) = cache_dir {
            debug!("Using model cache dir: {:?}", dir);
            builder = builder.with_cache_dir(dir);
        }

        let api = builder.build().context("failed to create HuggingFace API client")?;
        Ok(api.model(self.repo.clone()))
    }

    fn fetch(&self, repo: &ApiRepo, file: &str) -> Result<PathBuf> {
        let path = if self.refresh {
            repo.download(file)
        } else {
            repo.get(file)
        };
        path.with_context(|| format!("failed to fetch {} from {}", file, self.repo))
    }
}

impl ModelLoader for WhisperLoader {
    fn load(&self, device: ComputeDevice) -> Result<Box<dyn ModelBundle>> {
        info!(repo = %self.repo, %device, "Loading Whisper model");
        let started = std::time::Instant::now();

        let repo = self.api_repo()?;
        let config_path = self.fetch(&repo, "config.json")?;
        let tokenizer_path = self.fetch(&repo, "tokenizer.json")?;
        let weights_path = self.fetch(&repo, "model.safetensors")?;

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&config_path).context("failed to open model config")?,
        )
        .context("failed to parse model config")?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;

        let candle_device = device
            .to_candle()
            .with_context(|| format!("failed to open {}", device))?;

        // SAFETY: the weights file lives in the hub cache and is not modified
        // while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &candle_device)?
        };
        let model = m::model::Whisper::load(&vb, config.clone())
            .with_context(|| format!("failed to load weights on {}", device))?;

        let recognizer = WhisperRecognizer::new(
            model,
            config,
            tokenizer,
            candle_device,
            self.language.as_deref(),
        )?;

        info!(
            repo = %self.repo,
            %device,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Whisper model loaded"
        );

        Ok(Box::new(WhisperBundle {
            recognizer,
            vad: self.vad,
            punctuator: self.punctuator,
        }))
    }
}

/// Loaded Whisper model plus decoding state.
pub struct WhisperRecognizer {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    mel_filters: Vec<f32>,
    /// Start-of-transcript, optional language, task and no-timestamps tokens
    prompt: Vec<u32>,
    eot_token: u32,
    /// First timestamp token; everything from here up is a timestamp
    timestamp_begin: u32,
}

impl WhisperRecognizer {
    fn new(
        model: m::model::Whisper,
        config: Config,
        tokenizer: Tokenizer,
        device: Device,
        language: Option<&str>,
    ) -> Result<Self> {
        let sot = token_id(&tokenizer, m::SOT_TOKEN)?;
        let eot_token = token_id(&tokenizer, m::EOT_TOKEN)?;
        let no_timestamps = token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?;

        // Without a language the model predicts the language and task
        // tokens itself.
        let mut prompt = vec![sot];
        if let Some(lang) = language {
            let lang_token = token_id(&tokenizer, &format!("<|{}|>", lang))?;
            prompt.push(lang_token);
            prompt.push(token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?);
            prompt.push(no_timestamps);
        }

        let mel_filters = mel_filterbank(
            SAMPLE_RATE as usize,
            m::N_FFT,
            config.num_mel_bins,
            0.0,
            SAMPLE_RATE as f32 / 2.0,
        );

        Ok(Self {
            model,
            config,
            tokenizer,
            device,
            mel_filters,
            prompt,
            eot_token,
            timestamp_begin: no_timestamps + 1,
        })
    }

    /// Log-mel features, capped at one 30 s window.
    fn mel(&self, samples: &[f32]) -> Result<Tensor> {
        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;

        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        Ok(mel.narrow(2, 0, frames.min(m::N_FRAMES))?)
    }

    /// Greedy decode of one span (at most 30 s).
    pub fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
        let mel = self.mel(samples)?;
        let audio_features = self.model.encoder.forward(&mel, true)?;

        let mut tokens = self.prompt.clone();
        let prompt_len = tokens.len();
        let max_steps = self.config.max_target_positions / 2;

        for step in 0..max_steps {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&input, &audio_features, step == 0)?;

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let next = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            if next == self.eot_token || is_repetitive(&tokens[prompt_len..], next) {
                break;
            }
            tokens.push(next);
        }

        let text_tokens: Vec<u32> = tokens[prompt_len..]
            .iter()
            .copied()
            .filter(|&token| token < self.timestamp_begin)
            .collect();

        self.tokenizer
            .decode(&text_tokens, true)
            .map_err(|e| anyhow!("tokenizer decode error: {}", e))
    }
}

/// Whisper recognizer with VAD and punctuation attached.
pub struct WhisperBundle {
    recognizer: WhisperRecognizer,
    vad: EnergyVad,
    punctuator: Punctuator,
}

impl ModelBundle for WhisperBundle {
    fn detect_speech(&self, samples: &[f32]) -> Vec<SpeechSpan> {
        self.vad.detect(samples)
    }

    fn recognize(&mut self, samples: &[f32]) -> Result<String> {
        self.recognizer.transcribe(samples)
    }

    fn punctuate(&self, text: &str) -> String {
        self.punctuator.apply(text)
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("token '{}' not found in vocabulary", token))
}

/// Stop decoding loops: the same token three times running, or the last three
/// tokens repeating the three before them.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let n = tokens.len();
    if n >= 2 && tokens[n - 2..] == [next, next] {
        return true;
    }
    if n >= 5 {
        let mut tail = tokens[n - 2..].to_vec();
        tail.push(next);
        if tail == tokens[n - 5..n - 2] {
            return true;
        }
    }
    false
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;

    if hz < min_log_hz {
        hz / f_sp
    } else {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;

    if mel < min_log_mel {
        mel * f_sp
    } else {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    }
}

/// Slaney-normalized triangular filterbank, `n_mels x (n_fft / 2 + 1)` row-major.
fn mel_filterbank(sample_rate: usize, n_fft: usize, n_mels: usize, fmin: f32, fmax: f32) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f32 / 2.0;
    let mel_min = hz_to_mel_slaney(fmin.max(0.0));
    let mel_max = hz_to_mel_slaney(fmax.min(nyquist).max(fmin));

    let hz_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
        .map(mel_to_hz_slaney)
        .collect();
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|i| nyquist * i as f32 / (n_freqs - 1).max(1) as f32)
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (left, center, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let lower_width = (center - left).max(1e-12);
        let upper_width = (right - center).max(1e-12);
        let enorm = if right > left { 2.0 / (right - left) } else { 0.0 };

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / lower_width;
            let upper = (right - freq) / upper_width;
            filters[m * n_freqs + k] = lower.min(upper).max(0.0) * enorm;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_repo() {
        assert_eq!(resolve_repo("small").unwrap(), "openai/whisper-small");
        assert_eq!(resolve_repo("LARGE").unwrap(), "openai/whisper-large-v3");
        assert_eq!(
            resolve_repo("distil-whisper/distil-large-v3").unwrap(),
            "distil-whisper/distil-large-v3"
        );
        assert!(resolve_repo("paraformer-zh").is_err());
        assert!(resolve_repo("a/b/c").is_err());
    }

    #[test]
    fn test_resolve_vad() {
        assert!(resolve_vad("energy").is_ok());
        assert!(resolve_vad("fsmn-vad").is_err());
    }

    #[test]
    fn test_loader_rejects_unknown_punctuation() {
        let err = WhisperLoader::new("tiny", "energy", "ct-punc", None, true, None).unwrap_err();
        assert!(err.to_string().contains("punctuation"));
    }

    #[test]
    fn test_mel_filterbank_shape() {
        let filters = mel_filterbank(16_000, 400, 80, 0.0, 8_000.0);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|v| *v >= 0.0));

        // Every filter has some response
        for row in filters.chunks(201) {
            assert!(row.iter().any(|v| *v > 0.0));
        }
    }

    #[test]
    fn test_slaney_scale_round_trips() {
        for hz in [0.0f32, 440.0, 1000.0, 4000.0, 8000.0] {
            let back = mel_to_hz_slaney(hz_to_mel_slaney(hz));
            assert!((back - hz).abs() < 0.5, "{hz} -> {back}");
        }
    }

    #[test]
    fn test_repetition_guard() {
        assert!(!is_repetitive(&[1, 2], 3));
        assert!(is_repetitive(&[4, 7, 7], 7));
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5], 6));
    }
}
