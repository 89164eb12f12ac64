//! Execution outcome types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ExecutionFault;

/// Resources consumed by one run. Partial values are reported for runs that
/// were cut short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_ms: u64,
    pub memory_peak_bytes: u64,
    pub wall_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Fault { fault: ExecutionFault },
}

/// Always-populated result of a sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(flatten)]
    pub status: ExecutionStatus,
    /// Returned value on success.
    pub value: Option<Value>,
    /// Error detail or captured stderr on failure.
    pub error: Option<String>,
    pub usage: ResourceUsage,
    /// OS pid of the worker, when one was started.
    pub worker_pid: Option<u32>,
}

impl ExecutionResult {
    pub fn ok(value: Value, usage: ResourceUsage) -> Self {
        Self {
            status: ExecutionStatus::Ok,
            value: Some(value),
            error: None,
            usage,
            worker_pid: None,
        }
    }

    pub fn fault(fault: ExecutionFault, error: Option<String>, usage: ResourceUsage) -> Self {
        Self {
            status: ExecutionStatus::Fault { fault },
            value: None,
            error,
            usage,
            worker_pid: None,
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.worker_pid = pid;
        self
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, ExecutionStatus::Ok)
    }

    pub fn fault_ref(&self) -> Option<&ExecutionFault> {
        match &self.status {
            ExecutionStatus::Ok => None,
            ExecutionStatus::Fault { fault } => Some(fault),
        }
    }

    pub fn status_label(&self) -> String {
        match &self.status {
            ExecutionStatus::Ok => "ok".to_string(),
            ExecutionStatus::Fault { fault } => fault.kind().to_string(),
        }
    }
}
