use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::{CodecError, ValidationError};
use courier_store::StoreError;

/// Reasons a message is not fanned out at all.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Undecodable envelope: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid envelope: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to persist message: {0}")]
    Persist(#[source] StoreError),

    #[error("Message id {0:?} is already stored with different content")]
    IdConflict(String),

    #[error("Failed to resolve recipients: {0}")]
    Recipients(#[source] StoreError),
}

/// Reasons a sync request is not served.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Malformed sync request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported sync action: {0:?}")]
    UnsupportedAction(String),

    #[error("Sync request without identity or gateway")]
    MissingTarget,

    #[error("Failed to drain offline queue: {0}")]
    Drain(#[source] StoreError),
}

/// Errors returned by the HTTP API.
#[derive(Debug, Error)]
pub enum LogicError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl IntoResponse for LogicError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            LogicError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            LogicError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            LogicError::Store(_) | LogicError::Codec(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
