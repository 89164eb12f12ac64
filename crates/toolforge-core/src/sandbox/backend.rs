//! Capability interface implemented by isolation backends.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::execution::{ExecutionResult, ResourceUsage};
use super::policy::ExecutionPolicy;
use crate::domain::ValidatedArtifact;

/// Handle for one execution, chosen by the caller so it can terminate the
/// run while `execute` is still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An isolation backend.
///
/// `execute` never fails: infrastructure problems are reported as a
/// `RuntimeFault` result so the caller always gets an [`ExecutionResult`].
/// When `execute` returns, the worker is gone and its scratch space released.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn execute(
        &self,
        id: ExecutionId,
        artifact: &ValidatedArtifact,
        args: &Value,
        policy: &ExecutionPolicy,
    ) -> ExecutionResult;

    /// Force-kill a running execution. Returns `false` if `id` is not running.
    /// The pending `execute` call then resolves with a `Terminated` fault.
    async fn terminate(&self, id: ExecutionId) -> bool;

    /// Usage observed so far for a running execution.
    async fn usage(&self, id: ExecutionId) -> Option<ResourceUsage>;
}
