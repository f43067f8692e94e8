use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

// Token signed by the auth service; the gateway checks it before upgrading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl AccessToken {
    /// Encode for an `Authorization: Bearer` header or `token` query param.
    pub fn to_bearer(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn from_bearer(value: &str) -> Result<Self, TokenError> {
        let value = value.trim();
        let value = value.strip_prefix("Bearer ").unwrap_or(value);
        let json = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|_| TokenError::Malformed)?;
        serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)
    }
}

// payload = user_id || expires_at (rfc3339)
fn signing_payload(user_id: &UserId, expires_at: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(user_id.as_str().as_bytes());
    payload.push(0);
    payload.extend_from_slice(expires_at.to_rfc3339().as_bytes());
    payload
}

pub fn issue_token(user_id: &UserId, ttl: Duration, issuer: &SigningKey) -> AccessToken {
    let expires_at = Utc::now() + ttl;
    let signature = issuer.sign(&signing_payload(user_id, &expires_at));

    AccessToken {
        user_id: user_id.clone(),
        expires_at,
        signature: signature.to_bytes().to_vec(),
    }
}

/// Check expiry and signature; on success the token's user id is the
/// connection identity for its whole lifetime.
pub fn verify_token(token: &AccessToken, issuer_pubkey: &[u8; 32]) -> Result<UserId, TokenError> {
    if token.user_id.is_empty() {
        return Err(TokenError::Malformed);
    }
    if Utc::now() > token.expires_at {
        return Err(TokenError::Expired);
    }

    let verifying_key =
        VerifyingKey::from_bytes(issuer_pubkey).map_err(|_| TokenError::InvalidIssuerKey)?;
    let signature =
        Signature::from_slice(&token.signature).map_err(|_| TokenError::BadSignature)?;

    verifying_key
        .verify(&signing_payload(&token.user_id, &token.expires_at), &signature)
        .map_err(|_| TokenError::BadSignature)?;

    Ok(token.user_id.clone())
}

/// Parse a 64-character hex string into a 32-byte key.
pub fn parse_hex_key(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }
    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
