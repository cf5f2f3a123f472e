//! # Model Lifecycle Handlers
//!
//! ## Available Endpoints:
//! - `GET /models/status` - lifecycle snapshot of the inference resource
//! - `POST /models/unload` - ask for the resource to be released

use crate::state::AppState;
use crate::transcription::LifecycleState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// Report what the lifecycle manager is doing right now.
///
/// ## Response:
/// ```json
/// {
///   "model": "small",
///   "device_preference": "auto",
///   "lifecycle": {
///     "state": "ready",
///     "device": "cuda",
///     "in_flight": 1,
///     "idle_seconds": 0.4,
///     ...
///   }
/// }
/// ```
pub async fn model_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "model": state.config.model.name,
        "device_preference": state.config.model.device,
        "lifecycle": state.models.status()
    }))
}

/// Release the resource now if nothing is using it, otherwise as soon as the
/// last in-flight request finishes. The next transcription loads it again.
///
/// A model that is still loading is left alone: the requests waiting on it
/// get it, and the idle monitor takes over from there.
pub async fn unload_model(state: web::Data<AppState>) -> HttpResponse {
    let skipped = match state.models.state() {
        LifecycleState::Ready => None,
        LifecycleState::Loading => Some("Model is still loading, nothing to unload"),
        LifecycleState::Unloading => Some("Model is already being unloaded"),
        LifecycleState::Unloaded => Some("Model is not loaded"),
    };
    if let Some(message) = skipped {
        return HttpResponse::Ok().json(json!({
            "status": "success",
            "evicted": false,
            "pending": false,
            "message": message
        }));
    }

    state.models.request_eviction();
    let evicted = state.models.evict_if_idle();
    let in_flight = state.models.in_flight();
    info!(evicted, in_flight, "Model unload requested over HTTP");

    let message = if evicted {
        "Model unloaded".to_string()
    } else {
        format!("Model will be unloaded after {} in-flight request(s)", in_flight)
    };

    HttpResponse::Ok().json(json!({
        "status": "success",
        "evicted": evicted,
        "pending": !evicted,
        "message": message
    }))
}
