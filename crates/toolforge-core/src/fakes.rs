//! Scripted fakes for the synthesis and sandbox seams (testing only)
//!
//! `ScriptedSynthesizer` and `ScriptedSandbox` replay queued outcomes in
//! order, so orchestrator behavior can be driven without a model or a
//! Python interpreter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::{ExecutionFault, ValidatedArtifact};
use crate::sandbox::{ExecutionId, ExecutionPolicy, ExecutionResult, ResourceUsage, SandboxBackend};
use crate::synthesis::{SynthesisError, SynthesisSpec, Synthesizer};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub enum ScriptedSynthesis {
    Source(String),
    Fail(String),
    /// Never completes.
    Hang,
}

/// Synthesizer that replays queued responses.
///
/// Once the queue is empty the fallback is used; without one, synthesis
/// fails with `Unsupported`.
#[derive(Debug, Default)]
pub struct ScriptedSynthesizer {
    script: Mutex<VecDeque<ScriptedSynthesis>>,
    fallback: Option<ScriptedSynthesis>,
    specs: Mutex<Vec<SynthesisSpec>>,
    delay: Option<Duration>,
}

impl ScriptedSynthesizer {
    pub fn new(script: impl IntoIterator<Item = ScriptedSynthesis>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Returns `source` for every call.
    pub fn always(source: impl Into<String>) -> Self {
        Self::default().with_fallback(ScriptedSynthesis::Source(source.into()))
    }

    pub fn with_fallback(mut self, fallback: ScriptedSynthesis) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.specs).len()
    }

    /// Every spec received, in call order.
    pub fn specs(&self) -> Vec<SynthesisSpec> {
        lock(&self.specs).clone()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn synthesize(&self, spec: &SynthesisSpec) -> Result<String, SynthesisError> {
        lock(&self.specs).push(spec.clone());
        let next = lock(&self.script)
            .pop_front()
            .or_else(|| self.fallback.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match next {
            Some(ScriptedSynthesis::Source(source)) => Ok(source),
            Some(ScriptedSynthesis::Fail(reason)) => Err(SynthesisError::Unsupported(reason)),
            Some(ScriptedSynthesis::Hang) => std::future::pending().await,
            None => Err(SynthesisError::Unsupported("script exhausted".to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Ok(Value),
    Fault(ExecutionFault),
    /// Runs until terminated.
    Hang,
}

/// Sandbox backend that replays queued runs instead of starting workers.
///
/// Each run takes `delay` (if set) and can be terminated while pending.
/// An empty queue falls back to the fallback run, or to a runtime fault.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    script: Mutex<VecDeque<ScriptedRun>>,
    fallback: Option<ScriptedRun>,
    delay: Option<Duration>,
    running: Mutex<HashMap<ExecutionId, CancellationToken>>,
    executed: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new(script: impl IntoIterator<Item = ScriptedRun>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn always(run: ScriptedRun) -> Self {
        Self::default().with_fallback(run)
    }

    pub fn with_fallback(mut self, fallback: ScriptedRun) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.executed).len()
    }

    /// Entry points executed, in call order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn running(&self) -> usize {
        lock(&self.running).len()
    }

    /// Highest number of executions observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn wait(&self, token: &CancellationToken, run: &ScriptedRun) -> bool {
        let hang = matches!(run, ScriptedRun::Hang);
        let delay = self.delay;
        tokio::select! {
            _ = token.cancelled() => false,
            _ = async {
                match delay {
                    Some(d) => tokio::time::sleep(d).await,
                    None => tokio::task::yield_now().await,
                }
                if hang {
                    std::future::pending::<()>().await;
                }
            } => true,
        }
    }
}

#[async_trait]
impl SandboxBackend for ScriptedSandbox {
    async fn execute(
        &self,
        id: ExecutionId,
        artifact: &ValidatedArtifact,
        _args: &Value,
        _policy: &ExecutionPolicy,
    ) -> ExecutionResult {
        lock(&self.executed).push(artifact.entry_point().to_string());
        let token = CancellationToken::new();
        lock(&self.running).insert(id, token.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let run = lock(&self.script)
            .pop_front()
            .or_else(|| self.fallback.clone());
        let usage = ResourceUsage {
            cpu_ms: 1,
            memory_peak_bytes: 1024,
            wall_ms: self.delay.map(|d| d.as_millis() as u64).unwrap_or(0),
        };

        let result = match run {
            None => ExecutionResult::fault(
                ExecutionFault::RuntimeFault {
                    trace: "script exhausted".to_string(),
                },
                None,
                usage,
            ),
            Some(run) => {
                if self.wait(&token, &run).await {
                    match run {
                        ScriptedRun::Ok(value) => ExecutionResult::ok(value, usage),
                        ScriptedRun::Fault(fault) => {
                            ExecutionResult::fault(fault.clone(), Some(fault.to_string()), usage)
                        }
                        ScriptedRun::Hang => {
                            ExecutionResult::fault(ExecutionFault::Terminated, None, usage)
                        }
                    }
                } else {
                    ExecutionResult::fault(ExecutionFault::Terminated, None, usage)
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.running).remove(&id);
        result
    }

    async fn terminate(&self, id: ExecutionId) -> bool {
        match lock(&self.running).get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn usage(&self, id: ExecutionId) -> Option<ResourceUsage> {
        lock(&self.running)
            .contains_key(&id)
            .then(ResourceUsage::default)
    }
}
