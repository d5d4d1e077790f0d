use thiserror::Error;

/// Failures raised by a [`Storage`](crate::storage::Storage) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient backend failure; the only kind `RetryingStorage` retries.
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Stored value for '{key}' could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Storage operation not supported: {0}")]
    Unsupported(&'static str),
}

/// Errors surfaced by [`Policy`](crate::Policy) implementations.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Snapshot deserialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Policy is missing a required dependency: {0}")]
    NotConfigured(&'static str),
    #[error("Invalid action: {0}")]
    InvalidAction(String),
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// Failure of a single feature extractor.
#[derive(Debug, Error)]
#[error("Feature extractor '{extractor}' failed: {message}")]
pub struct ExtractError {
    pub extractor: String,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, PolicyError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
