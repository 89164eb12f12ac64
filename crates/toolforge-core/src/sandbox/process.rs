//! Subprocess isolation backend.
//!
//! Each execution gets a fresh scratch directory and a `python3 -I` worker.
//! CPU and address-space limits are applied by the kernel through rlimits set
//! in the harness; the wall deadline is enforced here by killing the worker.
//! The worker is always reaped and the scratch directory removed before
//! `execute` returns.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend::{ExecutionId, SandboxBackend};
use super::error::{SandboxError, SandboxResult};
use super::execution::{ExecutionResult, ResourceUsage};
use super::harness::{self, HarnessReport, ARTIFACT_FILE, HARNESS_FILE, HARNESS_SOURCE};
use super::policy::ExecutionPolicy;
use crate::domain::{ExecutionFault, TimeoutKind, ValidatedArtifact};
use crate::metrics::METRICS;
use crate::obs;

/// Captured stdout/stderr beyond this many bytes is discarded.
const OUTPUT_CAP: usize = 1024 * 1024;
/// Grace period for pipe readers after the worker is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

struct ActiveWorker {
    cancel: CancellationToken,
    started: Instant,
    pid: Option<u32>,
}

/// How the wait on the worker ended.
#[derive(Debug)]
enum WaitEnd {
    Exited(ExitStatus),
    WallTimeout,
    Terminated,
}

/// Runs validated artifacts in `python3` subprocesses.
pub struct ProcessSandbox {
    interpreter: String,
    work_dir: Option<PathBuf>,
    active: Mutex<HashMap<ExecutionId, ActiveWorker>>,
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new("python3")
    }
}

/// Removes the active-map entry on every exit path.
struct ActiveGuard<'a> {
    sandbox: &'a ProcessSandbox,
    id: ExecutionId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.sandbox.active().remove(&self.id);
    }
}

impl ProcessSandbox {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            work_dir: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Create scratch directories under `dir` instead of the system temp dir.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Number of executions currently holding a worker.
    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<ExecutionId, ActiveWorker>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scratch_dir(&self) -> SandboxResult<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("toolforge-");
        let dir = match &self.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(SandboxError::Scratch)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        };
        dir.map_err(SandboxError::Scratch)
    }

    async fn run(
        &self,
        id: ExecutionId,
        artifact: &ValidatedArtifact,
        args: &Value,
        policy: &ExecutionPolicy,
        cancel: &CancellationToken,
        started: Instant,
    ) -> SandboxResult<ExecutionResult> {
        let scratch = self.scratch_dir()?;
        tokio::fs::write(scratch.path().join(ARTIFACT_FILE), artifact.source()).await?;
        tokio::fs::write(scratch.path().join(HARNESS_FILE), HARNESS_SOURCE).await?;
        let payload =
            serde_json::to_vec(args).map_err(|e| SandboxError::Harness(e.to_string()))?;

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-I")
            .arg(HARNESS_FILE)
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("LANG", "C.UTF-8")
            .env("TOOLFORGE_SCRATCH", scratch.path())
            .env("TOOLFORGE_ENTRY", artifact.entry_point())
            .env("TOOLFORGE_CPU_LIMIT", policy.cpu_time_limit_secs.to_string())
            .env("TOOLFORGE_MEMORY_LIMIT", policy.memory_limit_bytes.to_string())
            .env(
                "TOOLFORGE_NETWORK",
                if policy.network_enabled { "1" } else { "0" },
            )
            .env("TOOLFORGE_ALLOWED_HOSTS", policy.allowed_hosts.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            interpreter: self.interpreter.clone(),
            source,
        })?;
        let pid = child.id();
        if let Some(worker) = self.active().get_mut(&id) {
            worker.pid = pid;
        }
        debug!(execution_id = %id, pid = ?pid, "worker spawned");

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // A worker that dies early closes the pipe; nothing to report.
                let _ = stdin.write_all(&payload).await;
            });
        }
        let stdout_task = child.stdout.take().map(|r| tokio::spawn(read_capped(r)));
        let stderr_task = child.stderr.take().map(|r| tokio::spawn(read_capped(r)));

        let deadline = tokio::time::sleep(policy.wall_time_limit());
        tokio::pin!(deadline);
        let end = tokio::select! {
            biased;
            status = child.wait() => WaitEnd::Exited(status?),
            _ = cancel.cancelled() => WaitEnd::Terminated,
            _ = &mut deadline => WaitEnd::WallTimeout,
        };
        if !matches!(end, WaitEnd::Exited(_)) {
            // kill() sends SIGKILL and waits, so the worker is reaped here.
            if let Err(e) = child.kill().await {
                warn!(execution_id = %id, error = %e, "failed to kill worker");
            }
        }
        let wall_ms = started.elapsed().as_millis() as u64;

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        drop(scratch);

        let report = harness::parse_report(&stdout);
        Ok(classify(end, report, &stderr, policy, wall_ms).with_pid(pid))
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = OUTPUT_CAP.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}

async fn collect(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Map how the worker ended, plus its report, to an execution result.
fn classify(
    end: WaitEnd,
    report: Option<HarnessReport>,
    stderr: &str,
    policy: &ExecutionPolicy,
    wall_ms: u64,
) -> ExecutionResult {
    let reported = report.as_ref().and_then(|r| r.usage).unwrap_or_default();
    let usage = ResourceUsage {
        cpu_ms: reported.cpu_ms,
        memory_peak_bytes: reported.memory_peak_bytes,
        wall_ms,
    };
    let captured = (!stderr.trim().is_empty()).then(|| tail(stderr, 20));
    let memory = ExecutionFault::MemoryExceeded {
        limit_bytes: policy.memory_limit_bytes,
    };

    let status = match end {
        WaitEnd::WallTimeout => {
            let fault = ExecutionFault::Timeout {
                limit: TimeoutKind::Wall,
                limit_ms: policy.wall_time_limit_ms,
            };
            return ExecutionResult::fault(fault, captured, usage);
        }
        WaitEnd::Terminated => {
            return ExecutionResult::fault(ExecutionFault::Terminated, captured, usage)
        }
        WaitEnd::Exited(status) => status,
    };

    if let Some(report) = report {
        let message = report.message.clone().unwrap_or_default();
        return match (report.status.as_str(), report.kind.as_deref()) {
            ("ok", _) => ExecutionResult::ok(report.value.unwrap_or(Value::Null), usage),
            (_, Some("memory")) => ExecutionResult::fault(memory, Some(message), usage),
            (_, Some("policy")) => ExecutionResult::fault(
                ExecutionFault::PolicyViolationAtRuntime {
                    detail: message.clone(),
                },
                Some(message),
                usage,
            ),
            _ if message.contains("MemoryError") => {
                ExecutionResult::fault(memory, Some(message), usage)
            }
            _ => {
                let trace = report
                    .trace
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| message.clone());
                ExecutionResult::fault(
                    ExecutionFault::RuntimeFault { trace },
                    Some(message),
                    usage,
                )
            }
        };
    }

    match exit_signal(&status) {
        Some(SIGXCPU) | Some(SIGKILL) => ExecutionResult::fault(
            ExecutionFault::Timeout {
                limit: TimeoutKind::Cpu,
                limit_ms: policy.cpu_time_limit_secs * 1000,
            },
            captured,
            usage,
        ),
        _ if stderr.contains("MemoryError") => ExecutionResult::fault(memory, captured, usage),
        _ => {
            let trace = captured
                .clone()
                .unwrap_or_else(|| format!("worker exited with {status}"));
            ExecutionResult::fault(ExecutionFault::RuntimeFault { trace }, captured, usage)
        }
    }
}

#[cfg(target_os = "linux")]
fn live_usage(pid: u32) -> (u64, u64) {
    // USER_HZ is 100 on every mainstream Linux ABI.
    const TICKS_PER_SEC: u64 = 100;
    let cpu_ms = std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            // Fields after the parenthesised command name; utime and stime
            // are the 12th and 13th of those.
            let rest = stat.rsplit_once(')')?.1;
            let fields: Vec<&str> = rest.split_whitespace().collect();
            let utime: u64 = fields.get(11)?.parse().ok()?;
            let stime: u64 = fields.get(12)?.parse().ok()?;
            Some((utime + stime) * 1000 / TICKS_PER_SEC)
        })
        .unwrap_or(0);
    let peak = std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| {
            let line = status.lines().find(|l| l.starts_with("VmHWM:"))?;
            let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
            Some(kb * 1024)
        })
        .unwrap_or(0);
    (cpu_ms, peak)
}

#[cfg(not(target_os = "linux"))]
fn live_usage(_pid: u32) -> (u64, u64) {
    (0, 0)
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    async fn execute(
        &self,
        id: ExecutionId,
        artifact: &ValidatedArtifact,
        args: &Value,
        policy: &ExecutionPolicy,
    ) -> ExecutionResult {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        self.active().insert(
            id,
            ActiveWorker {
                cancel: cancel.clone(),
                started,
                pid: None,
            },
        );
        let _guard = ActiveGuard { sandbox: self, id };

        let result = match self.run(id, artifact, args, policy, &cancel, started).await {
            Ok(result) => result,
            Err(e) => {
                warn!(execution_id = %id, error = %e, "sandbox infrastructure failure");
                ExecutionResult::fault(
                    ExecutionFault::RuntimeFault {
                        trace: e.to_string(),
                    },
                    Some(e.to_string()),
                    ResourceUsage {
                        wall_ms: started.elapsed().as_millis() as u64,
                        ..ResourceUsage::default()
                    },
                )
            }
        };

        METRICS.inc_sandbox_runs();
        obs::emit_sandbox_finished(
            &id.to_string(),
            &result.status_label(),
            result.usage.wall_ms,
            result.usage.cpu_ms,
        );
        result
    }

    async fn terminate(&self, id: ExecutionId) -> bool {
        match self.active().get(&id) {
            Some(worker) => {
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn usage(&self, id: ExecutionId) -> Option<ResourceUsage> {
        let active = self.active();
        let worker = active.get(&id)?;
        let (cpu_ms, memory_peak_bytes) = worker.pid.map(live_usage).unwrap_or((0, 0));
        Some(ResourceUsage {
            cpu_ms,
            memory_peak_bytes,
            wall_ms: worker.started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(v: Value) -> Option<HarnessReport> {
        Some(serde_json::from_value(v).unwrap())
    }

    #[cfg(unix)]
    fn exited(code: i32) -> WaitEnd {
        use std::os::unix::process::ExitStatusExt;
        WaitEnd::Exited(ExitStatus::from_raw(code << 8))
    }

    #[cfg(unix)]
    fn signalled(sig: i32) -> WaitEnd {
        use std::os::unix::process::ExitStatusExt;
        WaitEnd::Exited(ExitStatus::from_raw(sig))
    }

    #[test]
    fn wall_timeout_classified() {
        let p = ExecutionPolicy::default();
        let r = classify(WaitEnd::WallTimeout, None, "", &p, 60_010);
        assert_eq!(
            r.fault_ref(),
            Some(&ExecutionFault::Timeout {
                limit: TimeoutKind::Wall,
                limit_ms: 60_000
            })
        );
        assert_eq!(r.usage.wall_ms, 60_010);
    }

    #[test]
    fn terminated_classified() {
        let p = ExecutionPolicy::default();
        let r = classify(WaitEnd::Terminated, None, "", &p, 5);
        assert_eq!(r.fault_ref(), Some(&ExecutionFault::Terminated));
    }

    #[cfg(unix)]
    #[test]
    fn ok_report_carries_value_and_usage() {
        let p = ExecutionPolicy::default();
        let r = classify(
            exited(0),
            report(json!({"status": "ok", "value": 14, "usage": {"cpu_ms": 12, "memory_peak_bytes": 4096}})),
            "",
            &p,
            40,
        );
        assert!(r.is_ok());
        assert_eq!(r.value, Some(json!(14)));
        assert_eq!(r.usage.cpu_ms, 12);
        assert_eq!(r.usage.wall_ms, 40);
    }

    #[cfg(unix)]
    #[test]
    fn report_kinds_map_to_faults() {
        let p = ExecutionPolicy::default();
        let policy = classify(
            exited(0),
            report(json!({"status": "error", "kind": "policy", "message": "write outside scratch: /etc/x"})),
            "",
            &p,
            1,
        );
        assert!(matches!(
            policy.fault_ref(),
            Some(ExecutionFault::PolicyViolationAtRuntime { .. })
        ));

        let memory = classify(
            exited(0),
            report(json!({"status": "error", "kind": "memory", "message": "MemoryError"})),
            "",
            &p,
            1,
        );
        assert!(matches!(memory.fault_ref(), Some(ExecutionFault::MemoryExceeded { .. })));

        let runtime = classify(
            exited(0),
            report(json!({"status": "error", "kind": "runtime", "message": "ZeroDivisionError: division by zero", "trace": "Traceback ..."})),
            "",
            &p,
            1,
        );
        assert_eq!(
            runtime.fault_ref(),
            Some(&ExecutionFault::RuntimeFault {
                trace: "Traceback ...".into()
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn cpu_signal_without_report_is_cpu_timeout() {
        let p = ExecutionPolicy::default().with_cpu_time_limit_secs(2);
        let r = classify(signalled(SIGXCPU), None, "", &p, 2_100);
        assert_eq!(
            r.fault_ref(),
            Some(&ExecutionFault::Timeout {
                limit: TimeoutKind::Cpu,
                limit_ms: 2_000
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn crash_without_report_is_runtime_fault_with_stderr() {
        let p = ExecutionPolicy::default();
        let r = classify(exited(1), None, "Fatal Python error: boom\n", &p, 3);
        match r.fault_ref() {
            Some(ExecutionFault::RuntimeFault { trace }) => assert!(trace.contains("boom")),
            other => panic!("expected runtime fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminate_unknown_id_is_false() {
        let sandbox = ProcessSandbox::default();
        assert!(!sandbox.terminate(ExecutionId::new()).await);
        assert!(sandbox.usage(ExecutionId::new()).await.is_none());
    }
}
