use thiserror::Error;

/// Failure to turn wire bytes into an [`Envelope`](crate::Envelope) or back.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Empty frame")]
    Empty,

    #[error("Missing binary envelope header")]
    NotBinary,

    #[error("Envelope too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: u64 },

    #[error("Unsupported binary schema version {0}")]
    UnsupportedVersion(u8),

    #[error("Binary decode failed: {0}")]
    Binary(#[from] bincode::Error),

    #[error("Text decode failed: {0}")]
    Text(#[from] serde_json::Error),

    #[error("Unknown content type {0}")]
    UnknownContentType(i64),

    #[error("Unknown message type {0}")]
    UnknownMessageType(i64),

    #[error("Invalid body for content type {content_type}: {reason}")]
    InvalidBody { content_type: u8, reason: String },

    #[error("Frame is neither a binary nor a text envelope ({binary}; {text})")]
    Unrecognized { binary: String, text: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token")]
    Malformed,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token signature")]
    BadSignature,

    #[error("Invalid issuer key")]
    InvalidIssuerKey,
}

/// An envelope that decoded fine but cannot be routed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing sender id")]
    MissingSender,

    #[error("Missing conversation id")]
    MissingConversation,

    #[error("Private message without recipient id")]
    MissingRecipient,

    #[error("Group message without group id")]
    MissingGroup,
}
