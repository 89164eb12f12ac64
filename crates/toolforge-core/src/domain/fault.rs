//! Typed fault taxonomy.
//!
//! A fault is a recoverable-or-terminal condition reported as a value. Every
//! component maps its failures into [`Fault`] before they reach the
//! orchestrator's state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 1-based position in artifact source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Faults raised by the validation gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFault {
    #[error("syntax error at {location}: {message}")]
    Syntax {
        location: SourceLocation,
        message: String,
    },

    #[error("disallowed modules: {}", offending.join(", "))]
    Policy { offending: Vec<String> },

    #[error("forbidden pattern `{pattern}` at {location}")]
    Security {
        pattern: String,
        location: SourceLocation,
    },

    #[error("contract mismatch: expected {expected}, declared {declared}")]
    Contract { expected: String, declared: String },
}

/// Which limit a timeout tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    Wall,
    Cpu,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Wall => f.write_str("wall"),
            TimeoutKind::Cpu => f.write_str("cpu"),
        }
    }
}

/// Faults raised by the sandbox for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFault {
    #[error("{limit} time limit of {limit_ms}ms exceeded")]
    Timeout { limit: TimeoutKind, limit_ms: u64 },

    #[error("memory limit of {limit_bytes} bytes exceeded")]
    MemoryExceeded { limit_bytes: u64 },

    #[error("runtime fault: {trace}")]
    RuntimeFault { trace: String },

    #[error("policy violation at runtime: {detail}")]
    PolicyViolationAtRuntime { detail: String },

    #[error("worker terminated")]
    Terminated,
}

/// Every fault the orchestrator can record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fault {
    #[error(transparent)]
    Validation(ValidationFault),

    #[error("repair budget exhausted after {attempts} attempt(s): {last}")]
    ValidationExhausted {
        attempts: u32,
        last: ValidationFault,
    },

    #[error(transparent)]
    Execution(ExecutionFault),

    #[error("synthesis did not return within {timeout_ms}ms")]
    SynthesisTimeout { timeout_ms: u64 },

    #[error("synthesis failed: {reason}")]
    SynthesisFailed { reason: String },

    #[error("circuit open after {consecutive_failures} consecutive execution faults")]
    CircuitOpen { consecutive_failures: u32 },

    #[error("request cancelled")]
    Cancelled,

    #[error("version race registering {name}@{version}")]
    RegistryConflict { name: String, version: String },
}

impl From<ValidationFault> for Fault {
    fn from(f: ValidationFault) -> Self {
        Fault::Validation(f)
    }
}

impl From<ExecutionFault> for Fault {
    fn from(f: ExecutionFault) -> Self {
        Fault::Execution(f)
    }
}

/// Flat fault kind, for counting and matching diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    SyntaxFault,
    PolicyFault,
    SecurityFault,
    ContractFault,
    ValidationExhausted,
    Timeout,
    MemoryExceeded,
    RuntimeFault,
    PolicyViolationAtRuntime,
    Terminated,
    SynthesisTimeout,
    SynthesisFailed,
    CircuitOpenFault,
    Cancelled,
    RegistryConflict,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ValidationFault {
    pub fn kind(&self) -> FaultKind {
        match self {
            ValidationFault::Syntax { .. } => FaultKind::SyntaxFault,
            ValidationFault::Policy { .. } => FaultKind::PolicyFault,
            ValidationFault::Security { .. } => FaultKind::SecurityFault,
            ValidationFault::Contract { .. } => FaultKind::ContractFault,
        }
    }
}

impl ExecutionFault {
    pub fn kind(&self) -> FaultKind {
        match self {
            ExecutionFault::Timeout { .. } => FaultKind::Timeout,
            ExecutionFault::MemoryExceeded { .. } => FaultKind::MemoryExceeded,
            ExecutionFault::RuntimeFault { .. } => FaultKind::RuntimeFault,
            ExecutionFault::PolicyViolationAtRuntime { .. } => FaultKind::PolicyViolationAtRuntime,
            ExecutionFault::Terminated => FaultKind::Terminated,
        }
    }
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::Validation(v) => v.kind(),
            Fault::ValidationExhausted { .. } => FaultKind::ValidationExhausted,
            Fault::Execution(e) => e.kind(),
            Fault::SynthesisTimeout { .. } => FaultKind::SynthesisTimeout,
            Fault::SynthesisFailed { .. } => FaultKind::SynthesisFailed,
            Fault::CircuitOpen { .. } => FaultKind::CircuitOpenFault,
            Fault::Cancelled => FaultKind::Cancelled,
            Fault::RegistryConflict { .. } => FaultKind::RegistryConflict,
        }
    }
}
