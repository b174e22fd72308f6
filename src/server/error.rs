//! Turning failures into JSON error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::queues::job::{ErrorKind, OcrError};

/// Errors returned by our HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A job failed, or never got started.
    #[error(transparent)]
    Ocr(#[from] OcrError),

    /// The request itself was malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Ocr(err) => match err.kind() {
                ErrorKind::EngineUnavailable => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "NOT_CONFIGURED",
                    err.to_string(),
                ),
                ErrorKind::AdmissionTimeout => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_BUSY",
                    "OCR service busy, please try again later".to_owned(),
                ),
                ErrorKind::ProcessingTimeout => (
                    StatusCode::REQUEST_TIMEOUT,
                    "PROCESSING_TIMEOUT",
                    err.to_string(),
                ),
                ErrorKind::EngineExecutionError => {
                    tracing::error!(error = %err, "OCR failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "OCR_FAILED",
                        err.to_string(),
                    )
                }
                ErrorKind::TempFileError => {
                    tracing::error!(error = %err, "Internal error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_owned(),
                    )
                }
                ErrorKind::UnsupportedFormat | ErrorKind::EmptyPayload => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", err.to_string())
                }
                ErrorKind::PoolClosed => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SHUTTING_DOWN",
                    err.to_string(),
                ),
            },
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, Json(body)).into_response()
    }
}
