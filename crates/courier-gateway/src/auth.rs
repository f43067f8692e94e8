//! Resolves the bearer token presented on the websocket upgrade to the
//! connection's identity.

use axum::http::{header, HeaderMap};

use courier_shared::token::verify_token;
use courier_shared::{AccessToken, UserId};

use crate::error::GatewayError;

pub struct Authenticator {
    issuer_pubkey: [u8; 32],
}

impl Authenticator {
    pub fn new(issuer_pubkey: [u8; 32]) -> Self {
        Self { issuer_pubkey }
    }

    /// The `Authorization` header wins over the `token` query parameter.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<UserId, GatewayError> {
        let raw = bearer_from_headers(headers)
            .or(query_token)
            .filter(|t| !t.trim().is_empty())
            .ok_or(GatewayError::MissingToken)?;

        let token = AccessToken::from_bearer(raw)?;
        Ok(verify_token(&token, &self.issuer_pubkey)?)
    }
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::AUTHORIZATION)?.to_str().ok()
}
