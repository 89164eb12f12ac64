//! Sandbox: resource-bounded execution of validated artifacts.
//!
//! The orchestrator talks to an isolation backend only through the
//! [`SandboxBackend`] capability trait (`execute`, `terminate`, `usage`).
//! [`ProcessSandbox`] is the subprocess backend.
//!
//! # Modules
//!
//! - [`backend`]: `SandboxBackend` trait, `ExecutionId`
//! - [`policy`]: `ExecutionPolicy` limits
//! - [`execution`]: `ExecutionResult`, `ResourceUsage`
//! - [`process`]: `ProcessSandbox`
//! - [`harness`]: the in-worker Python harness
//! - [`error`]: `SandboxError` / `SandboxResult`

pub mod backend;
pub mod error;
pub mod execution;
pub mod harness;
pub mod policy;
pub mod process;

pub use backend::{ExecutionId, SandboxBackend};
pub use error::{SandboxError, SandboxResult};
pub use execution::{ExecutionResult, ExecutionStatus, ResourceUsage};
pub use policy::{ExecutionPolicy, FilesystemMode};
pub use process::ProcessSandbox;
