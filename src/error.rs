use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server-side error taxonomy from the wire protocol (see `wire` module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerErrorCode {
    ClientStateOutOfSync,
    RequestIntegrityFailed,
    ResponseIntegrityFailed,
    InvalidOperation,
    DatabaseError,
    InvalidClientId,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("transaction missing required store '{required}' opened in '{mode}' mode")]
    Transaction {
        required: &'static str,
        mode: &'static str,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("corrupt logical clock value: {0}")]
    ClockCorruption(i64),

    #[error("server reported error: {0:?}")]
    ServerState(ServerErrorCode),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid state: {0}")]
    State(&'static str),
}

pub type Result<T> = std::result::Result<T, SyncError>;
