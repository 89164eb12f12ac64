//! Domain models for toolforge.
//!
//! Canonical definitions for the core entities:
//! - `TaskRequest`: what the caller asked for, with optional io-type hints
//! - `CandidateArtifact` / `ValidatedArtifact`: synthesized code before and after the gates
//! - `Fault`: the typed fault taxonomy shared by every component

pub mod artifact;
pub mod fault;
pub mod task;

pub use artifact::{CandidateArtifact, Provenance, ValidatedArtifact};
pub use fault::{ExecutionFault, Fault, FaultKind, SourceLocation, TimeoutKind, ValidationFault};
pub use task::{IoSpec, IoType, TaskRequest};
