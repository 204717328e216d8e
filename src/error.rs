//! Error types for contact-hub

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Neither email nor phone number was supplied.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient lock/serialization conflict. Retried by the service layer.
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A group without a primary, a linkage chain, or a self link.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether retrying the whole transaction may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }

    /// Message safe to show to an end user.
    pub fn public_message(&self) -> String {
        match self {
            StorageError::InvariantViolation(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Map a rusqlite error into a [`StorageError`], keeping lock contention
/// distinguishable from hard failures.
pub fn sql(context: &'static str) -> impl FnOnce(rusqlite::Error) -> StorageError {
    move |e| classify(context, e)
}

fn classify(context: &str, e: rusqlite::Error) -> StorageError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StorageError::Conflict(format!("{}: {}", context, e))
        }
        _ => StorageError::Storage(format!("{}: {}", context, e)),
    }
}
