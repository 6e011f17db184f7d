//! Experiment runner: owns configuration, drives environments to completion,
//! persists exports and attaches behavioral analysis.
//!
//! Each environment runs in isolation with its own history. Comparative mode
//! only lines up their summaries side by side.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info_span, instrument, Instrument};
use uuid::Uuid;

use crate::agent::Agent;
use crate::analysis::{analyze, violation_rate_by_round, Analysis};
use crate::config::{DatasetRunConfig, EnvironmentSpec, RunnerConfig};
use crate::environment::{
    AgentRoster, EnvironmentExport, EnvironmentKind, MultiAgentConfig, MultiAgentEnvironment,
    RunStatus, SingleAgentConfig, SingleAgentEnvironment, SingleRoundRecord,
};
use crate::error::{Result, SimError};
use crate::metrics::METRICS;
use crate::obs::{self, RunSpan};
use crate::reporting::write_export_artifact;

/// Agents for one environment of a study.
#[derive(Clone)]
pub enum AgentBinding {
    Single(Arc<dyn Agent<SingleRoundRecord>>),
    Multi(AgentRoster),
}

/// Outcome of one environment run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentResult {
    pub run_id: String,
    pub environment_name: String,
    pub kind: EnvironmentKind,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub export: EnvironmentExport,
    pub analysis: Analysis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    /// Why the export could not be persisted; the result itself is intact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_error: Option<String>,
}

/// One row of a comparative summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRow {
    pub run_id: String,
    pub environment_name: String,
    pub kind: EnvironmentKind,
    pub status: String,
    pub total_rounds: u64,
    pub total_reward: f64,
    pub average_reward: f64,
    /// Camouflage signal (single-agent) or cooperation success rate (multi-agent).
    pub signal: Option<f64>,
}

/// Side-by-side view of every run under one runner. Histories are never merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparativeSummary {
    pub generated_at: DateTime<Utc>,
    pub rows: Vec<ComparisonRow>,
}

/// One dataset item's run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetItemRun {
    pub item_index: usize,
    pub run_id: String,
    pub environment_name: String,
    pub status: RunStatus,
    pub total_reward: f64,
}

/// Result of a single-agent dataset run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetReport {
    pub num_items: usize,
    pub max_rounds: u64,
    /// Fraction of items whose round `i + 1` choice was rule-violating.
    pub violation_probs_by_round: Vec<f64>,
    pub runs: Vec<DatasetItemRun>,
}

pub struct ExperimentRunner {
    config: RunnerConfig,
    results: Vec<EnvironmentResult>,
}

impl ExperimentRunner {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            results: Vec::new(),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn results(&self) -> &[EnvironmentResult] {
        &self.results
    }

    /// Run one single-agent environment to completion or failure.
    ///
    /// Config errors are returned before anything runs. Failures during the
    /// run are recorded in the result's status, with the partial history
    /// still exported.
    #[instrument(skip(self, config, agent), fields(environment = %config.environment_name))]
    pub async fn run_single(
        &mut self,
        config: SingleAgentConfig,
        agent: &dyn Agent<SingleRoundRecord>,
    ) -> Result<&EnvironmentResult> {
        let mut env = SingleAgentEnvironment::new(config)?;
        let run_id = Uuid::new_v4().to_string();
        let name = env.config().environment_name.clone();
        obs::emit_run_started(&run_id, &name, &EnvironmentKind::SingleAgent.to_string());

        let started = Instant::now();
        let span = info_span!("drift.evolution", run_id = %run_id);
        let outcome = env.run_evolution(agent, None).instrument(span).await;
        let export = EnvironmentExport::SingleAgent(env.summary());
        self.finish(run_id, started, export, outcome.err())
    }

    /// Run one multi-agent environment to completion or failure.
    #[instrument(skip(self, config, roster), fields(environment = %config.environment_name))]
    pub async fn run_multi(
        &mut self,
        config: MultiAgentConfig,
        roster: &AgentRoster,
    ) -> Result<&EnvironmentResult> {
        roster.validate(config.num_agents)?;
        let mut env = MultiAgentEnvironment::new(config)?;
        let run_id = Uuid::new_v4().to_string();
        let name = env.config().environment_name.clone();
        obs::emit_run_started(&run_id, &name, &EnvironmentKind::MultiAgent.to_string());

        let started = Instant::now();
        let span = info_span!("drift.evolution", run_id = %run_id);
        let outcome = env.run_evolution(roster, None).instrument(span).await;
        let export = EnvironmentExport::MultiAgent(env.summary());
        self.finish(run_id, started, export, outcome.err())
    }

    /// Run a configured environment with matching agents.
    pub async fn run_spec(
        &mut self,
        spec: &EnvironmentSpec,
        binding: &AgentBinding,
    ) -> Result<&EnvironmentResult> {
        match (spec, binding) {
            (EnvironmentSpec::SingleAgent(config), AgentBinding::Single(agent)) => {
                self.run_single(config.clone(), agent.as_ref()).await
            }
            (EnvironmentSpec::MultiAgent(config), AgentBinding::Multi(roster)) => {
                self.run_multi(config.clone(), roster).await
            }
            (spec, _) => Err(SimError::Config(format!(
                "environment {} ({}) was given agents of the wrong kind",
                spec.environment_name(),
                spec.kind()
            ))),
        }
    }

    fn finish(
        &mut self,
        run_id: String,
        started: Instant,
        export: EnvironmentExport,
        failure: Option<SimError>,
    ) -> Result<&EnvironmentResult> {
        let _span = RunSpan::enter(&run_id, export.environment_name());
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(err) = &failure {
            METRICS.inc_runs_failed();
            obs::emit_run_failed(&run_id, export.total_rounds(), err);
        }

        let (artifact_path, artifact_error) = match &self.config.output_dir {
            Some(dir) => match write_export_artifact(&export, &run_id, dir) {
                Ok((path, digest)) => {
                    obs::emit_artifact_written(&run_id, &path, &digest);
                    (Some(path), None)
                }
                Err(err) => {
                    obs::emit_artifact_failed(&run_id, dir, &err);
                    (None, Some(err.to_string()))
                }
            },
            None => (None, None),
        };

        let analysis = analyze(&export, self.config.analysis_window);
        if failure.is_none() {
            obs::emit_run_finished(&run_id, duration_ms, export.total_rounds(), export.total_reward());
        }
        METRICS.flush();

        self.results.push(EnvironmentResult {
            run_id,
            environment_name: export.environment_name().to_string(),
            kind: export.kind(),
            status: export.status().clone(),
            duration_ms,
            export,
            analysis,
            artifact_path,
            artifact_error,
        });
        let last = self.results.len() - 1;
        Ok(&self.results[last])
    }

    /// Side-by-side rows for every run so far, in run order.
    pub fn comparative_summary(&self) -> ComparativeSummary {
        let rows = self
            .results
            .iter()
            .map(|r| ComparisonRow {
                run_id: r.run_id.clone(),
                environment_name: r.environment_name.clone(),
                kind: r.kind,
                status: match &r.status {
                    RunStatus::Failed { round_id, .. } => format!("failed at round {round_id}"),
                    RunStatus::Completed => "completed".to_string(),
                    RunStatus::Running => "running".to_string(),
                    RunStatus::Pending => "pending".to_string(),
                },
                total_rounds: r.export.total_rounds(),
                total_reward: r.export.total_reward(),
                average_reward: r.export.average_reward(),
                signal: r.analysis.headline(),
            })
            .collect();
        ComparativeSummary {
            generated_at: Utc::now(),
            rows,
        }
    }

    /// Run one single-agent environment per dataset item and report the
    /// per-round violation probability across items.
    pub async fn run_single_dataset(
        &mut self,
        items: &[serde_json::Value],
        settings: &DatasetRunConfig,
        agent: &dyn Agent<SingleRoundRecord>,
    ) -> Result<DatasetReport> {
        let configs = items
            .iter()
            .map(|item| {
                let config = settings.environment_config(item);
                config.validate().map(|_| config)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut runs = Vec::with_capacity(items.len());
        let mut histories = Vec::with_capacity(items.len());
        for (item_index, config) in configs.into_iter().enumerate() {
            let result = self.run_single(config, agent).await?;
            runs.push(DatasetItemRun {
                item_index,
                run_id: result.run_id.clone(),
                environment_name: result.environment_name.clone(),
                status: result.status.clone(),
                total_reward: result.export.total_reward(),
            });
            if let EnvironmentExport::SingleAgent(summary) = &result.export {
                histories.push(summary.history.rounds.clone());
            }
        }

        let slices: Vec<&[SingleRoundRecord]> = histories.iter().map(Vec::as_slice).collect();
        let mut violation_probs_by_round = violation_rate_by_round(&slices);
        violation_probs_by_round.resize(settings.max_rounds as usize, 0.0);

        Ok(DatasetReport {
            num_items: items.len(),
            max_rounds: settings.max_rounds,
            violation_probs_by_round,
            runs,
        })
    }
}
