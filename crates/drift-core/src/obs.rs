//! Structured observability hooks for simulation run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - Emission functions for run start/finish/failure, recorded rounds,
//!   classification fallbacks and persisted artifacts
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`). Failures and
//! fallbacks are emitted at `warn!`.

use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("7f9c...", "CooperativeGame");
/// // every event emitted while the guard lives carries run_id and environment
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str, environment: &str) -> Self {
        let span = tracing::info_span!("drift.run", run_id = %run_id, environment = %environment);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: run started.
///
/// ```ignore
/// emit_run_started("run-123", "Bakery", "single_agent");
/// // logs: event=run.started run_id=run-123 environment=Bakery kind=single_agent
/// ```
pub fn emit_run_started(run_id: &str, environment: &str, kind: &str) {
    info!(event = "run.started", run_id = %run_id, environment = %environment, kind = %kind);
}

/// Emit event: one round appended to an environment's history.
pub fn emit_round_recorded(environment: &str, round_id: u64, round_reward: f64) {
    info!(
        event = "round.recorded",
        environment = %environment,
        round_id = round_id,
        reward = round_reward,
    );
}

/// Emit event: an unrecognized response was replaced by the configured fallback.
pub fn emit_classification_fallback(round_id: u64, agent_index: usize, choice: &str) {
    warn!(
        event = "classification.fallback",
        round_id = round_id,
        agent_index = agent_index,
        choice = %choice,
    );
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, total_rounds: u64, total_reward: f64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_rounds = total_rounds,
        total_reward = total_reward,
    );
}

/// Emit event: run aborted at a round boundary.
pub fn emit_run_failed(run_id: &str, round_id: u64, error: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, round_id = round_id, error = %error);
}

/// Emit event: export artifact persisted.
pub fn emit_artifact_written(run_id: &str, path: &std::path::Path, digest: &str) {
    info!(
        event = "artifact.written",
        run_id = %run_id,
        path = %path.display(),
        digest = %digest,
    );
}

/// Emit event: export artifact could not be persisted.
pub fn emit_artifact_failed(run_id: &str, dir: &std::path::Path, error: &dyn std::fmt::Display) {
    warn!(
        event = "artifact.failed",
        run_id = %run_id,
        dir = %dir.display(),
        error = %error,
    );
}
