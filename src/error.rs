//! Error types for the ei core.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ei error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Persona not found
    #[error("persona not found: {id}")]
    PersonaNotFound { id: String },

    /// Persona is archived and cannot take part in conversation
    #[error("persona is archived: {id}")]
    PersonaArchived { id: String },

    /// Alias already claimed by another persona
    #[error("alias already in use: {alias}")]
    DuplicateAlias { alias: String },

    /// Message not found
    #[error("message not found: {id}")]
    MessageNotFound { id: String },

    /// Quote offsets or references are invalid
    #[error("invalid quote: {0}")]
    InvalidQuote(String),

    /// Malformed queue payload or model output
    #[error("validation error: {0}")]
    Validation(String),

    /// Persistence collaborator failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Remote sync failure
    #[error("sync error: {0}")]
    Sync(String),

    /// Local and remote state diverged and need arbitration
    #[error("state conflict: remote updated {remote} is newer than local {local}")]
    SyncConflict {
        local: chrono::DateTime<chrono::Utc>,
        remote: chrono::DateTime<chrono::Utc>,
    },

    /// Model-call collaborator failure
    #[error("model error: {0}")]
    Model(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    /// Classify the error for the `on_error` callback.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::PersonaNotFound { .. } | Error::MessageNotFound { .. } => ErrorCode::NotFound,
            Error::PersonaArchived { .. }
            | Error::DuplicateAlias { .. }
            | Error::InvalidQuote(_)
            | Error::Validation(_)
            | Error::Serialization(_) => ErrorCode::ValidationError,
            Error::Storage(_) | Error::Io(_) | Error::Yaml(_) | Error::Config(_) => ErrorCode::StorageIo,
            Error::Sync(_) => ErrorCode::SyncFailed,
            Error::SyncConflict { .. } => ErrorCode::SyncConflict,
            Error::Model(_) => ErrorCode::ModelCall,
        }
    }
}

/// Error codes surfaced to callers through `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Model response was cut off mid-generation.
    Truncated,
    /// Malformed payload or model output; the item was dropped.
    ValidationError,
    /// Local and remote state diverged.
    SyncConflict,
    /// Remote sync collaborator failed.
    SyncFailed,
    /// Persistence collaborator failed.
    StorageIo,
    /// Model-call collaborator failed; the item was retried or given up.
    ModelCall,
    /// Referenced entity does not exist.
    NotFound,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Truncated => "TRUNCATED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::SyncConflict => "SYNC_CONFLICT",
            ErrorCode::SyncFailed => "SYNC_FAILED",
            ErrorCode::StorageIo => "STORAGE_IO",
            ErrorCode::ModelCall => "MODEL_CALL",
            ErrorCode::NotFound => "NOT_FOUND",
        };
        f.write_str(s)
    }
}

/// Result type alias for ei.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Validation("bad".into()).code(), ErrorCode::ValidationError);
        assert_eq!(Error::Storage("disk".into()).code(), ErrorCode::StorageIo);
        assert_eq!(Error::PersonaNotFound { id: "p".into() }.code(), ErrorCode::NotFound);
        assert_eq!(Error::Model("timeout".into()).code(), ErrorCode::ModelCall);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::ValidationError.to_string(), "VALIDATION_ERROR");
        assert_eq!(ErrorCode::StorageIo.to_string(), "STORAGE_IO");
    }
}
