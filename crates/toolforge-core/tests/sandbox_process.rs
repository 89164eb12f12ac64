//! Subprocess sandbox tests against a real `python3`.
//!
//! Each test returns early when no interpreter is installed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use toolforge_core::{
    CandidateArtifact, ExecutionFault, ExecutionId, ExecutionPolicy, IoSpec, ProcessSandbox,
    Provenance, SandboxBackend, Strategy, TimeoutKind, ValidatedArtifact, ValidationPipeline,
};

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

macro_rules! require_python {
    () => {
        if !python_available() {
            eprintln!("skipping: python3 not found");
            return;
        }
    };
}

fn artifact(source: &str) -> ValidatedArtifact {
    let candidate = CandidateArtifact::new(
        source,
        Provenance {
            strategy: Strategy::Direct,
            attempt: 1,
            repair: 0,
        },
    );
    ValidationPipeline::default()
        .validate(&candidate, &IoSpec::default())
        .approve(&candidate)
        .expect("artifact passes validation")
}

fn short_policy() -> ExecutionPolicy {
    ExecutionPolicy::default().with_wall_time_limit(Duration::from_millis(750))
}

#[tokio::test]
async fn sums_a_list() {
    require_python!();
    let sandbox = ProcessSandbox::default();
    let art = artifact(
        "def sum_list(numbers: list) -> int:\n    total = 0\n    for n in numbers:\n        total += n\n    return total\n",
    );

    let result = sandbox
        .execute(
            ExecutionId::new(),
            &art,
            &json!([2, 3, 4, 5]),
            &ExecutionPolicy::default(),
        )
        .await;

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(result.value, Some(json!(14)));
    assert!(result.worker_pid.is_some());
    assert_eq!(sandbox.active_count(), 0);
}

#[tokio::test]
async fn raised_exception_is_a_runtime_fault() {
    require_python!();
    let sandbox = ProcessSandbox::default();
    let art = artifact("def boom(x):\n    raise ValueError('bad input')\n");

    let result = sandbox
        .execute(ExecutionId::new(), &art, &json!(null), &short_policy())
        .await;

    match result.fault_ref() {
        Some(ExecutionFault::RuntimeFault { trace }) => assert!(trace.contains("ValueError")),
        other => panic!("expected runtime fault, got {other:?}"),
    }
}

#[tokio::test]
async fn unserializable_result_is_a_runtime_fault() {
    require_python!();
    let sandbox = ProcessSandbox::default();
    let art = artifact("def pair(x):\n    return {1, 2}\n");

    let result = sandbox
        .execute(ExecutionId::new(), &art, &json!(null), &short_policy())
        .await;

    assert!(matches!(
        result.fault_ref(),
        Some(ExecutionFault::RuntimeFault { .. })
    ));
}

#[tokio::test]
async fn unbounded_loop_hits_the_wall_deadline() {
    require_python!();
    let sandbox = ProcessSandbox::default();
    let art = artifact("def spin(x):\n    while True:\n        pass\n");
    let started = Instant::now();

    let result = sandbox
        .execute(ExecutionId::new(), &art, &json!(null), &short_policy())
        .await;

    assert!(
        matches!(
            result.fault_ref(),
            Some(ExecutionFault::Timeout {
                limit: TimeoutKind::Wall,
                limit_ms: 750
            })
        ),
        "{result:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(sandbox.active_count(), 0);
}

#[tokio::test]
async fn terminate_kills_a_running_worker() {
    require_python!();
    let sandbox = Arc::new(ProcessSandbox::default());
    let art = artifact("def spin(x):\n    while True:\n        pass\n");
    let id = ExecutionId::new();
    let policy = ExecutionPolicy::default().with_wall_time_limit(Duration::from_secs(30));

    let killer = {
        let sandbox = Arc::clone(&sandbox);
        async move {
            while sandbox.usage(id).await.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(sandbox.terminate(id).await);
        }
    };
    let (result, ()) = tokio::join!(sandbox.execute(id, &art, &json!(null), &policy), killer);

    assert_eq!(result.fault_ref(), Some(&ExecutionFault::Terminated));
    assert!(!sandbox.terminate(id).await);
    assert_eq!(sandbox.active_count(), 0);
}
