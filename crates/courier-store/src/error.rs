use thiserror::Error;

use courier_shared::CodecError;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored envelope could not be decoded or encoded.
    #[error("Envelope codec error: {0}")]
    Codec(#[from] CodecError),

    /// A thread panicked while holding the database lock.
    #[error("Database lock poisoned")]
    Poisoned,

    /// Backend unreachable or refusing work.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
