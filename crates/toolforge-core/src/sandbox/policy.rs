//! Execution policy: resource limits and isolation settings for one run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Filesystem view granted to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemMode {
    /// Reads anywhere the OS allows; writes only under the scratch directory.
    ReadOnlyWithScratch,
}

/// Limits enforced on a sandboxed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    /// `RLIMIT_CPU` soft limit, whole seconds.
    pub cpu_time_limit_secs: u64,
    /// `RLIMIT_AS` limit.
    pub memory_limit_bytes: u64,
    /// Hard wall deadline after which the worker is killed.
    pub wall_time_limit_ms: u64,
    pub network_enabled: bool,
    /// Hosts reachable when `network_enabled`; empty means any.
    pub allowed_hosts: Vec<String>,
    pub filesystem: FilesystemMode,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            cpu_time_limit_secs: 30,
            memory_limit_bytes: 512 * 1024 * 1024,
            wall_time_limit_ms: 60_000,
            network_enabled: false,
            allowed_hosts: Vec::new(),
            filesystem: FilesystemMode::ReadOnlyWithScratch,
        }
    }
}

impl ExecutionPolicy {
    pub fn wall_time_limit(&self) -> Duration {
        Duration::from_millis(self.wall_time_limit_ms)
    }

    pub fn with_wall_time_limit(mut self, limit: Duration) -> Self {
        self.wall_time_limit_ms = limit.as_millis() as u64;
        self
    }

    pub fn with_cpu_time_limit_secs(mut self, secs: u64) -> Self {
        self.cpu_time_limit_secs = secs;
        self
    }

    pub fn with_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_network(mut self, enabled: bool, allowed_hosts: Vec<String>) -> Self {
        self.network_enabled = enabled;
        self.allowed_hosts = allowed_hosts;
        self
    }
}
