//! Error types for the sandbox module.
//!
//! These are infrastructure failures (the worker could not be started or
//! observed). Faults caused by the artifact itself are reported as
//! [`ExecutionFault`](crate::domain::ExecutionFault) values instead.

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn worker `{interpreter}`: {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("worker I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed harness report: {0}")]
    Harness(String),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
