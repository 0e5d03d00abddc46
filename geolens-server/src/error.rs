//! Error types for geolens-server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// HTTP-facing service errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("File must be an image")]
    NotAnImage,

    #[error("File too large")]
    FileTooLarge,

    #[error("Invalid image file: {0}")]
    InvalidImage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Street-view lookup unavailable: {0}")]
    StreetViewUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// API error response.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServerError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            ServerError::NotAnImage => (StatusCode::BAD_REQUEST, "NOT_AN_IMAGE"),
            ServerError::FileTooLarge => (StatusCode::BAD_REQUEST, "FILE_TOO_LARGE"),
            ServerError::InvalidImage(_) => (StatusCode::BAD_REQUEST, "INVALID_IMAGE"),
            ServerError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ServerError::StreetViewUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STREET_VIEW_UNAVAILABLE")
            }
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = serde_json::json!({
            "success": false,
            "error": ApiError {
                code: code.to_string(),
                message: self.to_string(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Failures raised inside a pipeline or conversation stage.
///
/// Each variant maps to exactly one `error` event on the session stream;
/// malformed coordinate output is not an error (the recovery parser degrades
/// to passing raw text through instead).
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("No image uploaded for this session")]
    ImageNotFound,

    #[error("A stage is already running for this session")]
    StageBusy,

    #[error("Collaborator call failed: {0}")]
    Collaborator(String),
}

impl From<geolens_common::Error> for StageError {
    fn from(err: geolens_common::Error) -> Self {
        match err {
            geolens_common::Error::NotFound(_) => Self::ImageNotFound,
            other => Self::Collaborator(other.to_string()),
        }
    }
}
