//! Observability tests for simulation run lifecycle tracing.

use drift_core::obs::{
    emit_artifact_failed, emit_artifact_written, emit_classification_fallback, emit_round_recorded, emit_run_failed,
    emit_run_finished, emit_run_started,
};
use drift_core::{
    ComplianceChoice, ExperimentRunner, RunSpan, RunnerConfig, ScriptedAgent, SingleAgentConfig,
    SupervisionPattern, UnrecognizedPolicy,
};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_run_started_logs_kind() {
    emit_run_started("run-123", "Bakery", "single_agent");
    assert!(logs_contain("run.started"));
    assert!(logs_contain("run-123"));
}

#[traced_test]
#[test]
fn test_emit_round_recorded_logs_reward() {
    emit_round_recorded("Bakery", 3, 2500.0);
    assert!(logs_contain("round.recorded"));
}

#[traced_test]
#[test]
fn test_emit_classification_fallback_logs_warning() {
    emit_classification_fallback(2, 4, "Independent");
    assert!(logs_contain("classification.fallback"));
}

#[traced_test]
#[test]
fn test_emit_run_finished_and_failed() {
    emit_run_finished("run-456", 120, 10, 20000.0);
    let error_msg = "agent call failed: timeout";
    emit_run_failed("run-789", 4, &error_msg);
    assert!(logs_contain("run.finished"));
    assert!(logs_contain("run.failed"));
}

#[traced_test]
#[test]
fn test_emit_artifact_written() {
    emit_artifact_written("run-a", std::path::Path::new("/tmp/run-a/history.json"), "abc");
    assert!(logs_contain("artifact.written"));
}

#[traced_test]
#[test]
fn test_emit_artifact_failed() {
    let error_msg = "Not a directory";
    emit_artifact_failed("run-b", std::path::Path::new("/tmp/results"), &error_msg);
    assert!(logs_contain("artifact.failed"));
    assert!(logs_contain("Not a directory"));
}

#[traced_test]
#[test]
fn test_run_span_enter_creates_span() {
    let span = RunSpan::enter("test-span-run", "Bakery");
    drop(span);
}

#[traced_test]
#[tokio::test]
async fn test_runner_emits_lifecycle_events() {
    let mut runner = ExperimentRunner::new(RunnerConfig::default()).expect("runner");
    let config = SingleAgentConfig {
        supervision_pattern: SupervisionPattern::Alternating,
        max_rounds: 2,
        unrecognized: UnrecognizedPolicy::Fallback {
            choice: ComplianceChoice::Compliant,
        },
        ..SingleAgentConfig::new(UnrecognizedPolicy::Abort)
    };
    let agent = ScriptedAgent::new(vec![r#"{"choice": "A"}"#.to_string(), "unsure".to_string()]);
    runner.run_single(config, &agent).await.expect("run");

    assert!(logs_contain("run.started"));
    assert!(logs_contain("round.recorded"));
    assert!(logs_contain("classification.fallback"));
    assert!(logs_contain("run.finished"));
}

#[traced_test]
#[tokio::test]
async fn test_runner_emits_failure() {
    let mut runner = ExperimentRunner::new(RunnerConfig::default()).expect("runner");
    let config = SingleAgentConfig {
        max_rounds: 3,
        seed: Some(5),
        ..SingleAgentConfig::new(UnrecognizedPolicy::Abort)
    };
    let agent = ScriptedAgent::new(vec![r#"{"choice": "B"}"#.to_string()]);
    let result = runner.run_single(config, &agent).await.expect("recorded");
    assert!(result.status.is_failed());
    assert!(logs_contain("run.failed"));
}
