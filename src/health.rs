use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let config = &state.config;
    let model = state.models.status();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "auth_enabled": config.auth_enabled()
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "transcriptions": metrics.transcriptions
        },
        "memory": get_memory_info(),
        "model": {
            "name": config.model.name,
            "device_preference": config.model.device,
            "lifecycle": model
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let uptime_seconds = state.uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "transcription": {
            "completed": metrics.transcriptions,
            "failed": metrics.failed_transcriptions,
            "audio_seconds": metrics.audio_seconds,
            "by_language": metrics.by_language,
            "by_device": metrics.by_device
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "model": state.models.status()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let bytes = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|kb| kb.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = bytes();
                } else if line.starts_with("VmSize:") {
                    vm_size = bytes();
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::device::ComputeDevice;
    use crate::transcription::testing::{FakeLoader, FixedProbe};
    use crate::transcription::ModelManager;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn state() -> AppState {
        let config = AppConfig::default();
        let models = ModelManager::new(
            Arc::new(FakeLoader::new()),
            Arc::new(FixedProbe(vec![ComputeDevice::Cpu])),
            config.lifecycle_settings(),
        );
        AppState::new(config, models)
    }

    #[actix_web::test]
    async fn test_health_reports_unloaded_model() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model"]["lifecycle"]["state"], "unloaded");
        assert_eq!(body["model"]["lifecycle"]["in_flight"], 0);
        assert_eq!(body["model"]["device_preference"], "auto");
    }

    #[actix_web::test]
    async fn test_metrics_include_transcription_counts() {
        let state = state();
        state.record_transcription(crate::subtitle::Language::Ja, ComputeDevice::Cpu, 4.0);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["transcription"]["completed"], 1);
        assert_eq!(body["transcription"]["by_language"]["ja"], 1);
        assert_eq!(body["transcription"]["audio_seconds"], 4.0);
    }
}
