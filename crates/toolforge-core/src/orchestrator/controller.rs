//! Request controller: drives one task through the phase machine.
//!
//! ```text
//! RECEIVED ─► PLANNING ─► SYNTHESIZING ─► VALIDATING ─► EXECUTING ─► VERIFYING ─► RESPONDING
//!    │            ▲             ▲   │            │            │            │
//!    │            │             └───┘ repair     │            │            └─► DEGRADED
//!    │            └──────────── retry after backoff ──────────┘
//!    └─► EXECUTING (registry reuse)        any phase ─► FAILED
//! ```
//!
//! Repairs and retries are explicit bounded loops. Every fault raised along
//! the way is kept in the request's diagnostics.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use toolforge_store::ToolId;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use super::backoff::RetryPolicy;
use super::breaker::{Admission, CircuitBreaker, TrialPermit};
use super::state::{AgentState, Diagnostic, Phase, Transition};
use super::verify::verify;
use crate::config::AgentConfig;
use crate::domain::{
    CandidateArtifact, Fault, FaultKind, Provenance, SourceLocation, TaskRequest,
    ValidatedArtifact, ValidationFault,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::planner::{EpisodicMemory, Fingerprint, PlanContext, PlanStep, Planner};
use crate::registry::{NewTool, RegistryError, RegistryResult, SearchQuery, ToolRegistry};
use crate::sandbox::{ExecutionId, ExecutionPolicy, ExecutionResult, ResourceUsage, SandboxBackend};
use crate::synthesis::{SynthesisSpec, Synthesizer};
use crate::validation::ValidationPipeline;

/// State shared by every request: registry, breaker, and episodic memory.
#[derive(Debug, Clone)]
pub struct SharedContext {
    pub registry: Arc<ToolRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub memory: Arc<EpisodicMemory>,
}

impl SharedContext {
    pub fn new(config: &AgentConfig, registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            breaker: Arc::new(CircuitBreaker::from_config(&config.breaker)),
            memory: Arc::new(EpisodicMemory::new(config.planner.episodic_limit)),
        }
    }

    /// Opens the registry named by `config.registry`.
    pub fn from_config(config: &AgentConfig) -> RegistryResult<Self> {
        let registry = ToolRegistry::from_config(config.registry.clone())?;
        Ok(Self::new(config, Arc::new(registry)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Degraded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Degraded => "degraded",
            TaskStatus::Failed => "failed",
        }
    }
}

/// What `handle_request` returns. Always populated, never an error.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub request_id: Uuid,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub diagnostics: Vec<Diagnostic>,
    pub feedback: Vec<String>,
    pub tool_id: Option<ToolId>,
    /// Answered by a registered tool without synthesis.
    pub reused: bool,
    pub history: Vec<Transition>,
    pub plans: Vec<PlanStep>,
    /// Execution attempts started.
    pub attempts: u32,
    /// Usage of the last execution.
    pub usage: Option<ResourceUsage>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn fault_kinds(&self) -> Vec<FaultKind> {
        self.diagnostics.iter().map(|d| d.fault.kind()).collect()
    }

    /// Phases visited, starting with `RECEIVED`.
    pub fn phases(&self) -> Vec<Phase> {
        let mut phases = vec![Phase::Received];
        phases.extend(self.history.iter().map(|t| t.to));
        phases
    }
}

enum Stop {
    Cancelled,
    /// Consumes one execution attempt.
    Retry(Fault),
    /// Terminal.
    Exhausted(Fault),
}

/// The request's cancellation token fired while a worker was running.
struct Cancelled;

enum ToolSource {
    Reused(ToolId),
    Synthesized(ValidatedArtifact),
}

type Finish = (TaskStatus, Option<Value>);

/// Mutable bookkeeping for one request.
struct Run {
    state: AgentState,
    trial: Option<TrialPermit>,
    feedback: Vec<String>,
    attempts: u32,
    usage: Option<ResourceUsage>,
    tool_id: Option<ToolId>,
    reused: bool,
}

impl Run {
    fn new(request_id: Uuid) -> Self {
        Self {
            state: AgentState::new(request_id),
            trial: None,
            feedback: Vec::new(),
            attempts: 0,
            usage: None,
            tool_id: None,
            reused: false,
        }
    }

    fn cancelled(&mut self) -> Finish {
        self.state.record_fault(self.attempts, Fault::Cancelled);
        self.state.transition(Phase::Failed, "cancelled");
        (TaskStatus::Failed, None)
    }

    fn finish(self, (status, result): Finish) -> TaskOutcome {
        let request_id = self.state.request_id();
        let (history, diagnostics, plans) = self.state.into_parts();
        TaskOutcome {
            request_id,
            status,
            result,
            diagnostics,
            feedback: self.feedback,
            tool_id: self.tool_id,
            reused: self.reused,
            history,
            plans,
            attempts: self.attempts,
            usage: self.usage,
        }
    }
}

pub struct Orchestrator {
    config: AgentConfig,
    shared: SharedContext,
    synthesizer: Arc<dyn Synthesizer>,
    sandbox: Arc<dyn SandboxBackend>,
    planner: Planner,
    pipeline: ValidationPipeline,
    policy: ExecutionPolicy,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: AgentConfig,
        shared: SharedContext,
        synthesizer: Arc<dyn Synthesizer>,
        sandbox: Arc<dyn SandboxBackend>,
    ) -> Self {
        Self {
            planner: Planner::new(&config, Arc::clone(&shared.memory)),
            pipeline: ValidationPipeline::new(config.validation_policy()),
            policy: config.execution_policy(),
            retry: RetryPolicy::from_config(&config.retry),
            permits: Arc::new(Semaphore::new(config.agent.max_concurrent_requests.max(1))),
            config,
            shared,
            synthesizer,
            sandbox,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn shared(&self) -> &SharedContext {
        &self.shared
    }

    pub async fn handle_request(&self, task: TaskRequest) -> TaskOutcome {
        self.handle_request_with_cancel(task, CancellationToken::new())
            .await
    }

    /// Like [`handle_request`](Self::handle_request); cancelling `cancel`
    /// kills any running worker and fails the request with `Cancelled`.
    pub async fn handle_request_with_cancel(
        &self,
        task: TaskRequest,
        cancel: CancellationToken,
    ) -> TaskOutcome {
        let request_id = task.id.to_string();
        let span = obs::request_span(&request_id);
        async move {
            let started = Instant::now();
            METRICS.inc_requests();
            obs::emit_request_started(&request_id, &task.description);

            let mut run = Run::new(task.id);
            let finish = self.drive(&task, &cancel, &mut run).await;
            let outcome = run.finish(finish);

            obs::emit_request_finished(
                &request_id,
                outcome.status.as_str(),
                outcome.attempts,
                started.elapsed().as_millis() as u64,
            );
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, task: &TaskRequest, cancel: &CancellationToken, run: &mut Run) -> Finish {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return run.cancelled(),
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };

        match self.shared.breaker.admit() {
            Admission::Closed => {}
            Admission::Trial(permit) => {
                debug!("admitted as half-open trial");
                run.trial = Some(permit);
            }
            Admission::Rejected {
                consecutive_failures,
            } => {
                run.state.record_fault(
                    0,
                    Fault::CircuitOpen {
                        consecutive_failures,
                    },
                );
                run.feedback
                    .push("execution is paused after repeated faults; retry later".to_string());
                run.state.transition(Phase::Degraded, "circuit open");
                return (TaskStatus::Degraded, None);
            }
        }

        let fingerprint = Fingerprint::of(&task.description);
        let args = task.args.clone().unwrap_or(Value::Null);
        let mut last_fault: Option<Fault> = None;

        if let Some((tool_id, artifact, score)) = self.find_reusable(task).await {
            METRICS.inc_reused();
            run.attempts = 1;
            run.state.transition(
                Phase::Executing,
                format!("reusing {tool_id} (score {score:.2})"),
            );
            let result = match self.execute(&artifact, &args, cancel, run).await {
                Ok(result) => result,
                Err(Cancelled) => return run.cancelled(),
            };
            match result.fault_ref() {
                None => {
                    self.record_execution(run, true);
                    run.reused = true;
                    let value = result.value.unwrap_or(Value::Null);
                    return self
                        .conclude(task, run, value, ToolSource::Reused(tool_id), &fingerprint)
                        .await;
                }
                Some(fault) => {
                    let fault = Fault::from(fault.clone());
                    self.record_execution(run, false);
                    self.record_stats(&tool_id, false).await;
                    self.shared.memory.record_failure(&fingerprint, &fault);
                    run.state.record_fault(run.attempts, fault.clone());
                    last_fault = Some(fault);
                }
            }
        }

        let max_attempts = self.config.agent.max_retries.max(1);
        let mut floor = None;

        while run.attempts < max_attempts {
            run.attempts += 1;
            let attempt = run.attempts;

            if attempt == 1 {
                run.state.transition(Phase::Planning, "first attempt");
            } else {
                run.state.retry_count += 1;
                if run.trial.is_none() && self.shared.breaker.is_open() {
                    run.state.record_fault(
                        attempt,
                        Fault::CircuitOpen {
                            consecutive_failures: self.shared.breaker.consecutive_failures(),
                        },
                    );
                    run.state
                        .transition(Phase::Degraded, "circuit opened between attempts");
                    return (TaskStatus::Degraded, None);
                }
                let delay = self.retry.delay(run.state.retry_count - 1);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return run.cancelled(),
                    _ = tokio::time::sleep(delay) => {}
                }
                run.state.transition(
                    Phase::Planning,
                    format!("attempt {attempt} after {}ms backoff", delay.as_millis()),
                );
            }

            let step = self.planner.plan(
                task,
                &PlanContext {
                    retry_count: run.state.retry_count,
                    floor,
                    last_fault: last_fault.as_ref(),
                },
            );
            floor = Some(step.strategy);
            run.state.record_plan(step.clone());

            let validated = match self
                .synthesize_and_validate(task, &step, attempt, &fingerprint, cancel, run)
                .await
            {
                Ok(validated) => validated,
                Err(Stop::Cancelled) => return run.cancelled(),
                Err(Stop::Exhausted(fault)) => {
                    run.state.record_fault(attempt, fault);
                    run.state
                        .transition(Phase::Failed, "repair budget exhausted");
                    return (TaskStatus::Failed, None);
                }
                Err(Stop::Retry(fault)) => {
                    self.shared.memory.record_failure(&fingerprint, &fault);
                    run.state.record_fault(attempt, fault.clone());
                    last_fault = Some(fault);
                    continue;
                }
            };

            run.state.transition(
                Phase::Executing,
                format!("{} via {}", validated.entry_point(), step.strategy),
            );
            let result = match self.execute(&validated, &args, cancel, run).await {
                Ok(result) => result,
                Err(Cancelled) => return run.cancelled(),
            };

            match result.fault_ref() {
                None => {
                    self.record_execution(run, true);
                    let value = result.value.unwrap_or(Value::Null);
                    return self
                        .conclude(
                            task,
                            run,
                            value,
                            ToolSource::Synthesized(validated),
                            &fingerprint,
                        )
                        .await;
                }
                Some(fault) => {
                    if let Some(detail) = &result.error {
                        debug!(attempt, detail = %detail, "execution fault detail");
                    }
                    let fault = Fault::from(fault.clone());
                    self.record_execution(run, false);
                    self.shared.memory.record_failure(&fingerprint, &fault);
                    run.state.record_fault(attempt, fault.clone());
                    last_fault = Some(fault);
                }
            }
        }

        run.state.transition(
            Phase::Failed,
            format!("retry budget of {max_attempts} attempt(s) exhausted"),
        );
        (TaskStatus::Failed, None)
    }

    /// Synthesize, then validate; repair within the request's budget.
    async fn synthesize_and_validate(
        &self,
        task: &TaskRequest,
        step: &PlanStep,
        attempt: u32,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<ValidatedArtifact, Stop> {
        let mut spec = step.spec.clone();
        let mut round = 0u32;
        loop {
            let note = if round == 0 {
                format!("{} (confidence {:.2})", step.strategy, step.confidence)
            } else {
                format!("repair {round}")
            };
            run.state.transition(Phase::Synthesizing, note);
            let source = self.synthesize(&spec, cancel).await?;
            METRICS.inc_synthesized();

            let candidate = CandidateArtifact::new(
                source,
                Provenance {
                    strategy: step.strategy,
                    attempt,
                    repair: round,
                },
            );
            run.state
                .transition(Phase::Validating, candidate.digest().short());
            let report = self.pipeline.validate(&candidate, &task.io);
            if let Some(validated) = report.approve(&candidate) {
                return Ok(validated);
            }

            let fault = report.fault().cloned().unwrap_or_else(|| ValidationFault::Syntax {
                location: SourceLocation { line: 1, column: 1 },
                message: "artifact declares no entry point".to_string(),
            });
            METRICS.inc_validation_faults();
            self.shared
                .memory
                .record_failure(fingerprint, &Fault::from(fault.clone()));
            run.state.record_fault(attempt, Fault::from(fault.clone()));

            if run.state.repair_count >= self.config.agent.max_repair_attempts {
                return Err(Stop::Exhausted(Fault::ValidationExhausted {
                    attempts: run.state.repair_count + 1,
                    last: fault,
                }));
            }
            run.state.repair_count += 1;
            round += 1;
            spec = spec.with_feedback(fault.to_string());
        }
    }

    async fn synthesize(
        &self,
        spec: &SynthesisSpec,
        cancel: &CancellationToken,
    ) -> Result<String, Stop> {
        let timeout_ms = self.config.agent.synthesis_timeout_ms;
        let call = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.synthesizer.synthesize(spec),
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Stop::Cancelled),
            outcome = call => match outcome {
                Err(_) => Err(Stop::Retry(Fault::SynthesisTimeout { timeout_ms })),
                Ok(Err(e)) => {
                    warn!(synthesizer = self.synthesizer.name(), error = %e, "synthesis failed");
                    Err(Stop::Retry(Fault::SynthesisFailed { reason: e.to_string() }))
                }
                Ok(Ok(source)) => Ok(source),
            },
        }
    }

    /// Run in the sandbox. On cancellation the worker is terminated and
    /// reaped before returning.
    async fn execute(
        &self,
        artifact: &ValidatedArtifact,
        args: &Value,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<ExecutionResult, Cancelled> {
        let id = ExecutionId::new();
        let execution = self.sandbox.execute(id, artifact, args, &self.policy);
        tokio::pin!(execution);
        let result = tokio::select! {
            biased;
            result = &mut execution => result,
            _ = cancel.cancelled() => {
                if self.sandbox.terminate(id).await {
                    let reaped = execution.await;
                    run.usage = Some(reaped.usage);
                }
                return Err(Cancelled);
            }
        };
        run.usage = Some(result.usage);
        Ok(result)
    }

    fn record_execution(&self, run: &mut Run, success: bool) {
        match run.trial.take() {
            Some(trial) => trial.resolve(success),
            None if success => self.shared.breaker.record_success(),
            None => self.shared.breaker.record_failure(),
        }
    }

    /// Verify, then respond or degrade. Accepted synthesized tools are registered.
    async fn conclude(
        &self,
        task: &TaskRequest,
        run: &mut Run,
        value: Value,
        source: ToolSource,
        fingerprint: &Fingerprint,
    ) -> Finish {
        run.state.transition(Phase::Verifying, "");
        let confidence = match &source {
            ToolSource::Reused(_) => None,
            ToolSource::Synthesized(_) => run.state.last_confidence,
        };
        let verification = verify(&value, &task.io, confidence);
        run.feedback.extend(verification.feedback);

        let threshold = self.config.agent.acceptance_threshold;
        if verification.score < threshold {
            if let ToolSource::Reused(id) = &source {
                self.record_stats(id, false).await;
            }
            run.state.transition(
                Phase::Degraded,
                format!(
                    "verification score {:.2} below {threshold:.2}",
                    verification.score
                ),
            );
            return (TaskStatus::Degraded, Some(value));
        }

        self.shared.memory.record_success(fingerprint);
        let tool_id = match source {
            ToolSource::Reused(id) => Some(id),
            ToolSource::Synthesized(artifact) => self.register(task, artifact, run).await,
        };
        if let Some(id) = &tool_id {
            self.record_stats(id, true).await;
        }
        run.tool_id = tool_id;
        run.state.transition(Phase::Responding, "");
        (TaskStatus::Success, Some(value))
    }

    async fn with_registry<T, F>(&self, f: F) -> RegistryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ToolRegistry) -> RegistryResult<T> + Send + 'static,
    {
        let registry = Arc::clone(&self.shared.registry);
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .map_err(|e| RegistryError::Task(e.to_string()))?
    }

    async fn find_reusable(&self, task: &TaskRequest) -> Option<(ToolId, ValidatedArtifact, f64)> {
        let query = SearchQuery::new(task.description.clone())
            .with_io(task.io.clone())
            .limit(3);
        let threshold = self.config.agent.reuse_threshold;
        let found = self
            .with_registry(move |registry| {
                let results = registry.search(&query);
                for (score, record) in results.iter() {
                    if score < threshold {
                        break;
                    }
                    match record {
                        Ok(record) => {
                            let artifact = ValidatedArtifact::from_record(&record);
                            return Ok(Some((record.id().clone(), artifact, score)));
                        }
                        Err(e) => warn!(error = %e, "skipping unreadable tool"),
                    }
                }
                Ok(None)
            })
            .await;
        found.unwrap_or_else(|e| {
            warn!(error = %e, "registry lookup failed");
            None
        })
    }

    async fn register(
        &self,
        task: &TaskRequest,
        artifact: ValidatedArtifact,
        run: &mut Run,
    ) -> Option<ToolId> {
        let tool = NewTool::new(artifact.entry_point(), task.description.clone());
        let name = tool.name.clone();
        match self
            .with_registry(move |registry| registry.register(&artifact, tool))
            .await
        {
            Ok(record) => Some(record.id().clone()),
            Err(e) => {
                obs::emit_registration_failed(&name, &e);
                if let Some(fault) = e.to_fault() {
                    run.state.record_fault(run.attempts, fault);
                }
                run.feedback.push(format!("result was not cataloged: {e}"));
                None
            }
        }
    }

    async fn record_stats(&self, id: &ToolId, success: bool) {
        let target = id.clone();
        if let Err(e) = self
            .with_registry(move |registry| registry.update_stats(&target, success))
            .await
        {
            warn!(tool_id = %id, error = %e, "failed to update tool stats");
        }
    }
}
