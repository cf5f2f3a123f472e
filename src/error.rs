//! # Error Handling
//!
//! HTTP-facing error type and how it is converted to responses.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of failure
//! - **Wrapping**: `AppError::Model` carries the core [`ModelError`] untouched so
//!   the status code can be derived from it
//!
//! ### Traits for Error Conversion
//! - **From trait**: `?` turns model, multipart and anyhow errors into `AppError`
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings
//!
//! ## Response body
//! Every failure uses the subtitle error shape:
//! ```json
//! {"status": "error", "message": "...", "type": "manual_transcribe", "version": "v1", "body": []}
//! ```

use crate::subtitle::{ErrorResponse, SubtitleStyle};
use crate::transcription::ModelError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use std::fmt;

/// Errors a request can end with.
///
/// ## Error Categories:
/// - **Unauthorized**: missing or wrong bearer token (401)
/// - **BadRequest**: malformed multipart body or missing `file` field (400)
/// - **PayloadTooLarge**: upload exceeds `processing.max_upload_mb` (413)
/// - **Model**: failures from the lifecycle manager or the executor
/// - **Internal**: anything else that went wrong on our side (500)
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    BadRequest(String),
    PayloadTooLarge(String),
    Model(ModelError),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::Model(err) => write!(f, "{}", err),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Render the error with the configured subtitle `type` and `version`.
    pub fn render(&self, style: &SubtitleStyle) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse::new(style, self.to_string()))
    }
}

/// ## HTTP Status Code Mapping:
/// - InvalidInput / BadRequest → 400
/// - Unauthorized → 401
/// - PayloadTooLarge → 413
/// - ResourceExhausted / ConstructionFatal → 503 (the model could not be loaded)
/// - InferenceFailed / Internal → 500
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Model(ModelError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            AppError::Model(ModelError::ResourceExhausted { .. })
            | AppError::Model(ModelError::ConstructionFatal { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Model(ModelError::InferenceFailed(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Used when no configuration is at hand; handlers call [`AppError::render`].
    fn error_response(&self) -> HttpResponse {
        self.render(&SubtitleStyle::default())
    }
}

impl From<ModelError> for AppError {
    fn from(err: ModelError) -> Self {
        AppError::Model(err)
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Invalid multipart body: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
