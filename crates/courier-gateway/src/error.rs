use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_broker::BrokerError;
use courier_shared::{CodecError, TokenError, ValidationError};
use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Missing access token")]
    MissingToken,

    #[error("Invalid access token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid envelope: {0}")]
    Validation(#[from] ValidationError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Hub is shut down")]
    HubClosed,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatewayError::MissingToken | GatewayError::InvalidToken(_) => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            GatewayError::BadRequest(_)
            | GatewayError::Codec(_)
            | GatewayError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            GatewayError::HubClosed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Gateway is shutting down".to_string(),
            ),
            GatewayError::Broker(_) | GatewayError::Store(_) => (
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
