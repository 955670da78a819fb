use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::ingest::{IngestError, ParseError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid upload: {0}")]
    Validation(#[from] ParseError),
    #[error("{0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<IngestError> for ApiError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::Invalid(parse) => ApiError::Validation(parse),
            IngestError::Storage(storage) => ApiError::Internal(storage),
        }
    }
}

/// Converts the error taxonomy into HTTP responses: row-level problems never
/// reach here, upload-fatal validation is a 400, storage failures are a 500
/// with the detail kept in the logs.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Internal(error) => {
                tracing::error!(error = ?error, "request failed on storage");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "an internal error occurred".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
