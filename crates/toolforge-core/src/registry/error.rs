//! Error types for the tool registry.

use toolforge_store::StorageError;

use crate::domain::Fault;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Another writer claimed the version this registration computed.
    #[error("version conflict registering {name}@{version}")]
    Conflict { name: String, version: String },

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid tool name: {0}")]
    InvalidName(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("registry task failed: {0}")]
    Task(String),
}

impl RegistryError {
    /// The fault recorded for this error in a request's diagnostics.
    pub fn to_fault(&self) -> Option<Fault> {
        match self {
            RegistryError::Conflict { name, version } => Some(Fault::RegistryConflict {
                name: name.clone(),
                version: version.clone(),
            }),
            _ => None,
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
