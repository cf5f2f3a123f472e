//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: every worker thread of the server holds the same model manager
//!   and the same metrics, not copies of them
//! - **Memory safety**: the manager (and with it the loaded model) is dropped
//!   when the last reference goes away
//!
//! ### RwLock for metrics
//! - Requests only ever add to counters, and `/metrics` reads them
//! - A poisoned lock is recovered instead of propagating the panic; counters
//!   are plain numbers and stay meaningful
//!
//! ### What is *not* behind a lock
//! - `config`, `executor` and `pipeline` are read-only after start-up
//! - `models` does its own synchronization (see `transcription::manager`)

use crate::config::AppConfig;
use crate::device::ComputeDevice;
use crate::subtitle::{Language, SubtitlePipeline};
use crate::transcription::{ModelManager, TranscriptionExecutor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Owner of the single inference resource
    pub models: Arc<ModelManager>,
    pub executor: TranscriptionExecutor,
    pub pipeline: SubtitlePipeline,
    pub metrics: Arc<RwLock<ServiceMetrics>>,
    pub start_time: Instant,
}

/// Counters collected across all requests.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: overall load and reliability
/// - **transcriptions / failed_transcriptions**: how often the model was actually used
/// - **audio_seconds**: total audio transcribed, for capacity planning
/// - **by_language / by_device**: what is being transcribed, and whether the
///   GPU fallback is kicking in
#[derive(Debug, Default, Clone, Serialize)]
pub struct ServiceMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub transcriptions: u64,
    pub failed_transcriptions: u64,
    pub audio_seconds: f64,
    pub by_language: HashMap<String, u64>,
    pub by_device: HashMap<String, u64>,
    /// Key: endpoint name (e.g., "POST /transcribe")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Wire the request-side components from configuration around an already
    /// built model manager.
    pub fn new(config: AppConfig, models: Arc<ModelManager>) -> Self {
        let executor = TranscriptionExecutor::new(config.processing.batch_size_s);
        let pipeline = SubtitlePipeline {
            chinese_ratio_threshold: config.processing.chinese_ratio_threshold,
            segmentation: config.segmentation_settings(),
            enable_timestamp: config.processing.enable_timestamp,
            style: config.subtitle.clone(),
        };

        Self {
            config: Arc::new(config),
            models,
            executor,
            pipeline,
            metrics: Arc::new(RwLock::new(ServiceMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Record one finished HTTP request (called by the metrics middleware).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_transcription(&self, lang: Language, device: ComputeDevice, audio_seconds: f64) {
        let mut metrics = self.write_metrics();
        metrics.transcriptions += 1;
        metrics.audio_seconds += audio_seconds;
        *metrics.by_language.entry(lang.to_string()).or_default() += 1;
        *metrics.by_device.entry(device.as_str().to_string()).or_default() += 1;
    }

    pub fn record_transcription_failure(&self) {
        self.write_metrics().failed_transcriptions += 1;
    }

    /// Copy of the current metrics, so no lock is held while serializing.
    pub fn metrics_snapshot(&self) -> ServiceMetrics {
        self.read_metrics().clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, ServiceMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, ServiceMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServiceMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
