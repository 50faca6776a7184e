use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use taskdeck_db::merge::MergeError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing or invalid bearer token")]
    Unauthorized,
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

// Malformed or missing request bodies are validation failures, same as a
// bad organization id, so they get the JSON error envelope instead of
// axum's plain-text rejection.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Merge(MergeError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Merge(MergeError::Validation(_))
            | ApiError::Merge(MergeError::InvalidState(_)) => StatusCode::BAD_REQUEST,
            ApiError::Merge(MergeError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Merge(MergeError::Forbidden(_)) => StatusCode::FORBIDDEN,
            ApiError::Merge(MergeError::Store(_)) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {:#}", self);
        }
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}
