//! # Transcription Endpoint
//!
//! `POST /transcribe` with a multipart body whose `file` field holds the audio.
//!
//! ## Request flow:
//! 1. Read the upload, enforcing `processing.max_upload_mb`
//! 2. Decode and resample to 16 kHz mono on a blocking thread
//! 3. Acquire the inference resource (loading it if needed)
//! 4. Run recognition, then release the resource
//! 5. Post-process into subtitle cues and inject the configured style
//!
//! Decoding happens before the resource is acquired, so unreadable uploads
//! are rejected without ever loading the model.

use crate::audio::decode_audio;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::subtitle::SubtitleResponse;
use crate::transcription::ModelError;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt;
use tracing::{info, warn};

struct Upload {
    filename: Option<String>,
    content_type: Option<String>,
    data: Vec<u8>,
}

pub async fn transcribe(state: web::Data<AppState>, payload: Multipart) -> HttpResponse {
    match run_transcription(&state, payload).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(err) => {
            if matches!(err, AppError::Model(_)) {
                state.record_transcription_failure();
            }
            warn!(error = %err, "Transcription request failed");
            err.render(&state.pipeline.style)
        }
    }
}

async fn run_transcription(state: &AppState, payload: Multipart) -> AppResult<SubtitleResponse> {
    let upload = read_upload(payload, state.config.max_upload_bytes()).await?;
    info!(
        filename = upload.filename.as_deref().unwrap_or("<unnamed>"),
        bytes = upload.data.len(),
        "Received audio upload"
    );

    let Upload {
        filename,
        content_type,
        data,
    } = upload;
    let audio = tokio::task::spawn_blocking(move || {
        decode_audio(data, filename.as_deref(), content_type.as_deref())
    })
    .await
    .map_err(|e| AppError::Internal(format!("decode task failed: {}", e)))?
    .map_err(|e| ModelError::InvalidInput(format!("{:#}", e)))?;

    let audio_seconds = audio.duration_secs();

    let lease = state.models.acquire().await?;
    let device = lease.device();
    let segments = state.executor.run(&lease, audio.samples).await;
    lease.release();
    let segments = segments?;

    let result = state.pipeline.build(&segments, device);
    info!(
        lang = %result.lang,
        %device,
        cues = result.body.len(),
        audio_seconds,
        "Subtitles ready"
    );
    state.record_transcription(result.lang, device, audio_seconds);

    Ok(state.pipeline.respond(result))
}

/// Read the `file` field, ignoring any other fields.
async fn read_upload(mut payload: Multipart, limit: usize) -> AppResult<Upload> {
    while let Some(mut field) = payload.try_next().await? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let content_type = field.content_type().map(|mime| mime.essence_str().to_string());

        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            if data.len() + chunk.len() > limit {
                return Err(AppError::PayloadTooLarge(format!(
                    "upload exceeds {} MB",
                    limit / (1024 * 1024)
                )));
            }
            data.extend_from_slice(&chunk);
        }

        if data.is_empty() {
            return Err(ModelError::InvalidInput("uploaded file is empty".to_string()).into());
        }

        return Ok(Upload {
            filename,
            content_type,
            data,
        });
    }

    Err(AppError::BadRequest("missing multipart field `file`".to_string()))
}
