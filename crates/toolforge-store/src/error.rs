//! Error types for toolforge-store

use thiserror::Error;

/// Errors returned by [`ToolStore`](crate::ToolStore) implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No record exists under the requested id
    #[error("tool not found: {id}")]
    NotFound { id: String },

    /// A record already exists under the id being inserted
    #[error("tool already exists: {id}")]
    AlreadyExists { id: String },

    /// Tool id is not `name@major.minor.patch`
    #[error("invalid tool id: {0}")]
    InvalidId(String),

    /// Version string is not `major.minor.patch`
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// Stored source no longer matches the digest recorded at insert time
    #[error("digest mismatch for {id}: expected {expected}, found {actual}")]
    DigestMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;
