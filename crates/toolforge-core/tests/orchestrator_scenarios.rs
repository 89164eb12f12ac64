//! End-to-end request scenarios driven through scripted synthesis and
//! sandbox fakes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use toolforge_core::fakes::{ScriptedRun, ScriptedSandbox, ScriptedSynthesis, ScriptedSynthesizer};
use toolforge_core::orchestrator::BreakerState;
use toolforge_core::{
    AgentConfig, ExecutionFault, Fault, FaultKind, Fingerprint, IoSpec, IoType, Orchestrator, Phase,
    SharedContext, Strategy, TaskOutcome, TaskRequest, TaskStatus, TimeoutKind, ToolRegistry,
    ValidationFault, Version,
};

const SUM_LIST: &str = "\
def sum_list(numbers: list) -> int:
    total = 0
    for n in numbers:
        total += n
    return total
";

const SUM_LIST_WITH_SOCKET: &str = "\
import socket

def sum_list(numbers: list) -> int:
    return sum(numbers)
";

struct Harness {
    orchestrator: Orchestrator,
    shared: SharedContext,
    synth: Arc<ScriptedSynthesizer>,
    sandbox: Arc<ScriptedSandbox>,
}

fn fast_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 4;
    config.retry.jitter = 0.0;
    config
}

fn harness(config: AgentConfig, synth: ScriptedSynthesizer, sandbox: ScriptedSandbox) -> Harness {
    let registry = Arc::new(ToolRegistry::in_memory(config.registry.clone()));
    let shared = SharedContext::new(&config, registry);
    let synth = Arc::new(synth);
    let sandbox = Arc::new(sandbox);
    let orchestrator = Orchestrator::new(config, shared.clone(), synth.clone(), sandbox.clone());
    Harness {
        orchestrator,
        shared,
        synth,
        sandbox,
    }
}

fn list_to_int() -> IoSpec {
    IoSpec::new(Some(IoType::List), Some(IoType::Int))
}

fn sum_task() -> TaskRequest {
    TaskRequest::new("return the sum of a list of numbers")
        .with_args(json!([2, 3, 4, 5]))
        .with_io(list_to_int())
}

fn last_phase(outcome: &TaskOutcome) -> Phase {
    *outcome.phases().last().unwrap()
}

#[tokio::test]
async fn sum_task_is_synthesized_executed_and_registered() {
    let h = harness(
        fast_config(),
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::new([ScriptedRun::Ok(json!(14))]),
    );

    let outcome = h.orchestrator.handle_request(sum_task()).await;

    assert_eq!(outcome.status, TaskStatus::Success);
    assert_eq!(outcome.result, Some(json!(14)));
    assert!(outcome.diagnostics.is_empty());
    assert!(!outcome.reused);
    assert_eq!(
        outcome.phases(),
        vec![
            Phase::Received,
            Phase::Planning,
            Phase::Synthesizing,
            Phase::Validating,
            Phase::Executing,
            Phase::Verifying,
            Phase::Responding,
        ]
    );

    let id = outcome.tool_id.expect("tool registered");
    assert_eq!(id.name(), "sum_list");
    assert_eq!(id.version(), Version::INITIAL);
    let meta = h.shared.registry.get_metadata(&id).unwrap();
    assert_eq!(meta.usage_count, 1);
    assert!(meta.success_rate > 0.99);
    assert_eq!(h.sandbox.executed(), vec!["sum_list"]);
}

#[tokio::test]
async fn policy_fault_is_repaired_with_feedback() {
    let h = harness(
        fast_config(),
        ScriptedSynthesizer::new([
            ScriptedSynthesis::Source(SUM_LIST_WITH_SOCKET.into()),
            ScriptedSynthesis::Source(SUM_LIST.into()),
        ]),
        ScriptedSandbox::new([ScriptedRun::Ok(json!(14))]),
    );

    let outcome = h.orchestrator.handle_request(sum_task()).await;

    assert_eq!(outcome.status, TaskStatus::Success);
    assert_eq!(
        outcome.diagnostics[0].fault,
        Fault::Validation(ValidationFault::Policy {
            offending: vec!["socket".to_string()]
        })
    );
    assert_eq!(outcome.diagnostics[0].phase, Phase::Validating);
    assert_eq!(outcome.fault_kinds(), vec![FaultKind::PolicyFault]);

    let specs = h.synth.specs();
    assert_eq!(specs.len(), 2);
    assert!(specs[0].repair_feedback.is_none());
    assert!(specs[1].repair_feedback.as_deref().unwrap().contains("socket"));
    // The repair stays within the same execution attempt.
    assert_eq!(outcome.attempts, 1);
    assert_eq!(h.sandbox.calls(), 1);
}

#[tokio::test]
async fn repeated_timeouts_exhaust_the_retry_budget() {
    let h = harness(
        fast_config(),
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::always(ScriptedRun::Fault(ExecutionFault::Timeout {
            limit: TimeoutKind::Wall,
            limit_ms: 60_000,
        })),
    );

    let outcome = h.orchestrator.handle_request(sum_task()).await;

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.result, None);
    assert_eq!(outcome.fault_kinds(), vec![FaultKind::Timeout; 3]);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(h.sandbox.calls(), 3);
    assert_eq!(last_phase(&outcome), Phase::Failed);
    assert!(outcome.tool_id.is_none());
    assert!(h.shared.registry.is_empty());

    let strategies: Vec<Strategy> = outcome.plans.iter().map(|p| p.strategy).collect();
    assert_eq!(
        strategies,
        vec![
            Strategy::Direct,
            Strategy::MultiPathSearch,
            Strategy::ReflectiveRetry
        ]
    );
}

#[tokio::test]
async fn breaker_short_circuits_after_consecutive_runtime_faults() {
    let mut config = fast_config();
    config.agent.max_retries = 1;
    config.breaker.failure_threshold = 5;
    let h = harness(
        config,
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::always(ScriptedRun::Fault(ExecutionFault::RuntimeFault {
            trace: "ZeroDivisionError".into(),
        })),
    );

    for _ in 0..5 {
        let outcome = h.orchestrator.handle_request(sum_task()).await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.fault_kinds(), vec![FaultKind::RuntimeFault]);
    }
    assert_eq!(h.shared.breaker.state(), BreakerState::Open);

    let outcome = h.orchestrator.handle_request(sum_task()).await;
    assert_eq!(outcome.status, TaskStatus::Degraded);
    assert_eq!(outcome.fault_kinds(), vec![FaultKind::CircuitOpenFault]);
    assert_eq!(outcome.phases(), vec![Phase::Received, Phase::Degraded]);
    assert!(!outcome.feedback.is_empty());
    assert_eq!(h.sandbox.calls(), 5);
    assert_eq!(h.synth.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn half_open_trial_closes_the_breaker() {
    let mut config = fast_config();
    config.agent.max_retries = 1;
    config.breaker.failure_threshold = 1;
    config.breaker.recovery_timeout_ms = 60_000;
    let h = harness(
        config,
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::new([
            ScriptedRun::Fault(ExecutionFault::RuntimeFault {
                trace: "boom".into(),
            }),
            ScriptedRun::Ok(json!(14)),
        ]),
    );

    assert_eq!(
        h.orchestrator.handle_request(sum_task()).await.status,
        TaskStatus::Failed
    );
    assert_eq!(
        h.orchestrator.handle_request(sum_task()).await.status,
        TaskStatus::Degraded
    );

    tokio::time::advance(Duration::from_secs(61)).await;

    let trial = h.orchestrator.handle_request(sum_task()).await;
    assert_eq!(trial.status, TaskStatus::Success);
    assert_eq!(h.shared.breaker.state(), BreakerState::Closed);
    assert_eq!(h.sandbox.calls(), 2);
}

#[tokio::test]
async fn similar_task_reuses_registered_tool() {
    let h = harness(
        fast_config(),
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::new([ScriptedRun::Ok(json!(14)), ScriptedRun::Ok(json!(9))]),
    );

    let first = h.orchestrator.handle_request(sum_task()).await;
    assert_eq!(first.status, TaskStatus::Success);

    let again = TaskRequest::new("sum a list of numbers")
        .with_args(json!([4, 5]))
        .with_io(list_to_int());
    let second = h.orchestrator.handle_request(again).await;

    assert_eq!(second.status, TaskStatus::Success);
    assert!(second.reused);
    assert_eq!(second.result, Some(json!(9)));
    assert_eq!(second.tool_id, first.tool_id);
    assert_eq!(
        second.phases(),
        vec![
            Phase::Received,
            Phase::Executing,
            Phase::Verifying,
            Phase::Responding
        ]
    );
    assert!(second.plans.is_empty());
    assert_eq!(h.synth.calls(), 1);
    assert_eq!(h.sandbox.calls(), 2);

    let meta = h
        .shared
        .registry
        .get_metadata(second.tool_id.as_ref().unwrap())
        .unwrap();
    assert_eq!(meta.usage_count, 2);
}

#[tokio::test]
async fn wrong_result_type_degrades_without_registering() {
    let h = harness(
        fast_config(),
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::new([ScriptedRun::Ok(json!("fourteen"))]),
    );

    let outcome = h.orchestrator.handle_request(sum_task()).await;

    assert_eq!(outcome.status, TaskStatus::Degraded);
    assert_eq!(outcome.result, Some(json!("fourteen")));
    assert!(outcome
        .feedback
        .iter()
        .any(|f| f == "expected a result of type int"));
    assert_eq!(last_phase(&outcome), Phase::Degraded);
    assert!(outcome.tool_id.is_none());
    assert!(h.shared.registry.is_empty());
}

#[tokio::test]
async fn low_confidence_plan_degrades_a_well_typed_result() {
    let mut config = fast_config();
    config.agent.confidence_threshold = 0.0;
    let h = harness(
        config,
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::new([ScriptedRun::Ok(json!(14))]),
    );
    let fingerprint = Fingerprint::of(&sum_task().description);
    let fault = Fault::from(ExecutionFault::RuntimeFault {
        trace: "TypeError".into(),
    });
    for _ in 0..5 {
        h.shared.memory.record_failure(&fingerprint, &fault);
    }

    let outcome = h.orchestrator.handle_request(sum_task()).await;

    assert_eq!(outcome.status, TaskStatus::Degraded);
    assert_eq!(outcome.result, Some(json!(14)));
    assert_eq!(outcome.plans[0].strategy, Strategy::Direct);
    assert!(outcome.plans[0].confidence < 0.1);
    assert!(outcome
        .feedback
        .iter()
        .any(|f| f.starts_with("plan confidence")));
    assert!(outcome.tool_id.is_none());
    assert!(h.shared.registry.is_empty());
}

#[tokio::test]
async fn repair_budget_exhaustion_fails_with_every_fault() {
    let mut config = fast_config();
    config.agent.max_repair_attempts = 2;
    let h = harness(
        config,
        ScriptedSynthesizer::always(SUM_LIST_WITH_SOCKET),
        ScriptedSandbox::always(ScriptedRun::Ok(json!(14))),
    );

    let outcome = h.orchestrator.handle_request(sum_task()).await;

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(
        outcome.fault_kinds(),
        vec![
            FaultKind::PolicyFault,
            FaultKind::PolicyFault,
            FaultKind::PolicyFault,
            FaultKind::ValidationExhausted,
        ]
    );
    assert_eq!(h.synth.calls(), 3);
    assert_eq!(h.sandbox.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn hung_synthesizer_times_out_each_attempt() {
    let mut config = fast_config();
    config.agent.max_retries = 2;
    config.agent.synthesis_timeout_ms = 1_000;
    let h = harness(
        config,
        ScriptedSynthesizer::default().with_fallback(ScriptedSynthesis::Hang),
        ScriptedSandbox::always(ScriptedRun::Ok(json!(14))),
    );

    let outcome = h.orchestrator.handle_request(sum_task()).await;

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.fault_kinds(), vec![FaultKind::SynthesisTimeout; 2]);
    assert_eq!(h.sandbox.calls(), 0);
    // Synthesis faults do not count against the breaker.
    assert_eq!(h.shared.breaker.consecutive_failures(), 0);
}

#[tokio::test]
async fn cancel_terminates_the_running_worker() {
    let h = harness(
        fast_config(),
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::always(ScriptedRun::Hang),
    );
    let token = CancellationToken::new();

    let canceller = async {
        while h.sandbox.running() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        token.cancel();
    };
    let (outcome, ()) = tokio::join!(
        h.orchestrator
            .handle_request_with_cancel(sum_task(), token.clone()),
        canceller
    );

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.fault_kinds(), vec![FaultKind::Cancelled]);
    assert_eq!(outcome.diagnostics[0].phase, Phase::Executing);
    assert_eq!(last_phase(&outcome), Phase::Failed);
    assert_eq!(h.sandbox.running(), 0);
    assert_eq!(h.shared.breaker.consecutive_failures(), 0);
}

#[tokio::test]
async fn cancelled_before_start_never_synthesizes() {
    let h = harness(
        fast_config(),
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::always(ScriptedRun::Ok(json!(14))),
    );
    let token = CancellationToken::new();
    token.cancel();

    let outcome = h
        .orchestrator
        .handle_request_with_cancel(sum_task(), token)
        .await;

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.fault_kinds(), vec![FaultKind::Cancelled]);
    assert_eq!(h.synth.calls(), 0);
}

#[tokio::test]
async fn concurrent_requests_respect_the_limit() {
    let mut config = fast_config();
    config.agent.max_concurrent_requests = 2;
    let h = harness(
        config,
        ScriptedSynthesizer::always(SUM_LIST),
        ScriptedSandbox::always(ScriptedRun::Ok(json!(14))).with_delay(Duration::from_millis(20)),
    );

    let requests = (0..6).map(|_| h.orchestrator.handle_request(sum_task()));
    let outcomes = futures::future::join_all(requests).await;

    assert!(outcomes.iter().all(TaskOutcome::is_success));
    assert_eq!(h.sandbox.calls(), 6);
    assert!(h.sandbox.max_in_flight() <= 2);
    assert!(h.sandbox.max_in_flight() >= 1);
    // Identical artifacts collapse onto one version.
    assert_eq!(h.shared.registry.versions("sum_list").len(), 1);
}
