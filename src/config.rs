//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - Configuration files (`config.yaml`, `config.toml` or `config.json`)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the `config` crate deserializes the merged sources straight into these structs
//! - **Layered sources**: each source only overrides the keys it actually sets
//! - **Result<T, E>**: a bad value stops start-up with a readable error
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_MODEL__DEVICE`, etc.)
//! 3. Configuration file (`config.*` in the working directory)
//! 4. Default values (defined in the Default impl)

use crate::device::DevicePreference;
use crate::subtitle::{OversizedPolicy, SegmentationSettings, SubtitleStyle};
use crate::transcription::punctuation::Punctuator;
use crate::transcription::whisper::{resolve_repo, resolve_vad};
use crate::transcription::LifecycleSettings;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one part of the service: the HTTP server and model
/// lifecycle, the recognizer, the subtitle post-processing, the response
/// styling and API access.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub processing: ProcessingConfig,
    pub subtitle: SubtitleStyle,
    pub api: ApiConfig,
}

/// Server and model lifecycle settings.
///
/// ## Fields:
/// - `host` / `port`: where the HTTP server listens
/// - `idle_timeout`: seconds without use before the model is unloaded
/// - `check_interval`: seconds between idle checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub idle_timeout: u64,
    pub check_interval: u64,
}

/// Recognizer settings.
///
/// ## Fields:
/// - `name`: Whisper size (`tiny` .. `large`) or a HuggingFace `owner/repo` id
/// - `vad_model`: speech detector, currently only `energy`
/// - `punc_model`: `native` keeps the recognizer's punctuation, `cjk-fullwidth`
///   switches to full-width marks after CJK text
/// - `disable_update`: trust the local model cache instead of checking the hub
/// - `language`: force a decoding language; unset lets the model decide
/// - `device`: `auto`, `cpu` or `cuda`
/// - `min_free_memory_mb`: in `auto` mode, skip the GPU when it reports less free memory
/// - `cache_dir`: model cache location, defaults to the HuggingFace cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub vad_model: String,
    pub punc_model: String,
    pub disable_update: bool,
    pub language: Option<String>,
    pub device: DevicePreference,
    pub min_free_memory_mb: u64,
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Seconds of speech recognized per batch
    pub batch_size_s: f64,
    /// Maximum characters per subtitle cue
    pub max_segment_length: usize,
    /// Target seconds per subtitle cue
    pub duration_per_segment: f64,
    /// Share of CJK ideographs from which text counts as Chinese
    pub chinese_ratio_threshold: f64,
    pub enable_timestamp: bool,
    pub oversized_segment_policy: OversizedPolicy,
    /// Upload size limit in megabytes
    pub max_upload_mb: usize,
}

/// API access settings. An empty token disables authentication.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    pub token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            idle_timeout: 300,
            check_interval: 10,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "small".to_string(),
            vad_model: "energy".to_string(),
            punc_model: "cjk-fullwidth".to_string(),
            disable_update: true,
            language: None,
            device: DevicePreference::Auto,
            min_free_memory_mb: 2048,
            cache_dir: None,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size_s: 300.0,
            max_segment_length: 20,
            duration_per_segment: 3.0,
            chinese_ratio_threshold: 0.3,
            enable_timestamp: true,
            oversized_segment_policy: OversizedPolicy::Keep,
            max_upload_mb: 200,
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__IDLE_TIMEOUT=600`: Keep the model loaded for ten idle minutes
    /// - `APP_MODEL__DEVICE=cpu`: Never try the GPU
    /// - `APP_PROCESSING__MAX_SEGMENT_LENGTH=30`: Longer cues
    /// - `APP_API__TOKEN=secret`: Require `Authorization: Bearer secret`
    /// - `PORT=3000`: Special case for deployment platforms
    ///
    /// Nested keys use a double underscore so that field names such as
    /// `idle_timeout` keep their own single underscores.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port and lifecycle timings are non-zero
    /// - Model, VAD and punctuation names are known
    /// - Segmentation limits are positive and the language threshold is a ratio
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.server.idle_timeout == 0 {
            return Err(anyhow!("Idle timeout must be greater than 0"));
        }

        if self.server.check_interval == 0 {
            return Err(anyhow!("Check interval must be greater than 0"));
        }

        resolve_repo(&self.model.name)?;
        resolve_vad(&self.model.vad_model)?;
        self.model
            .punc_model
            .parse::<Punctuator>()
            .map_err(|e| anyhow!(e))?;

        if !(self.processing.batch_size_s > 0.0) {
            return Err(anyhow!("Batch size must be greater than 0 seconds"));
        }

        if self.processing.max_segment_length == 0 {
            return Err(anyhow!("Max segment length must be greater than 0"));
        }

        if !(self.processing.duration_per_segment > 0.0) {
            return Err(anyhow!("Duration per segment must be greater than 0 seconds"));
        }

        if !(0.0..=1.0).contains(&self.processing.chinese_ratio_threshold) {
            return Err(anyhow!("Chinese ratio threshold must be between 0 and 1"));
        }

        if self.processing.max_upload_mb == 0 {
            return Err(anyhow!("Max upload size must be greater than 0"));
        }

        Ok(())
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            idle_timeout: Duration::from_secs(self.server.idle_timeout),
            check_interval: Duration::from_secs(self.server.check_interval),
        }
    }

    pub fn segmentation_settings(&self) -> SegmentationSettings {
        SegmentationSettings {
            max_segment_length: self.processing.max_segment_length,
            duration_per_segment: self.processing.duration_per_segment,
            oversized: self.processing.oversized_segment_policy,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.processing.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn auth_enabled(&self) -> bool {
        !self.api.token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.idle_timeout, 300);
        assert_eq!(config.server.check_interval, 10);
        assert_eq!(config.processing.max_segment_length, 20);
        assert_eq!(config.subtitle.kind, "manual_transcribe");
        assert!(!config.auth_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.check_interval = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.processing.chinese_ratio_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.vad_model = "fsmn-vad".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.name = "not a model".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lifecycle_settings() {
        let mut config = AppConfig::default();
        config.server.idle_timeout = 60;
        config.server.check_interval = 5;

        let settings = config.lifecycle_settings();
        assert_eq!(settings.idle_timeout, Duration::from_secs(60));
        assert_eq!(settings.check_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_sections_deserialize_from_partial_source() {
        let config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .add_source(config::File::from_str(
                "model:\n  device: cpu\nprocessing:\n  oversized_segment_policy: truncate\nsubtitle:\n  type: auto_transcribe\n",
                config::FileFormat::Yaml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.model.device, DevicePreference::Cpu);
        assert_eq!(config.processing.oversized_segment_policy, OversizedPolicy::Truncate);
        assert_eq!(config.subtitle.kind, "auto_transcribe");
        assert_eq!(config.subtitle.version, "v1");
        assert_eq!(config.server.port, 8000);
    }
}
