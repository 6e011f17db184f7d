//! Reward drift simulation engine.
//!
//! Round-based environments in which agents choose between competing options
//! and receive rewards, recording every round so behavioral drift can be
//! measured afterwards:
//!
//! - [`environment::single`]: one agent, rule compliance under a supervision
//!   schedule
//! - [`environment::multi`]: N agents in a threshold cooperation game
//! - [`runner`]: drives environments, persists exports, attaches [`analysis`]

pub mod agent;
pub mod analysis;
pub mod classify;
pub mod config;
pub mod environment;
pub mod error;
pub mod history;
pub mod metrics;
pub mod obs;
pub mod reporting;
pub mod runner;
pub mod supervision;
pub mod telemetry;

pub use agent::{
    choice_json, Agent, AgentRequest, ChatMessage, ChatRole, FixedChoiceAgent, FnAgent,
    PeerHistoryMode, RandomChoiceAgent, RetryingAgent, ScriptedAgent, Transcript,
};
pub use analysis::{
    analyze, camouflage_series, cooperation_success_rate, cooperation_trend,
    reward_camouflage_signal, violation_rate_by_round, violation_rates, Analysis,
    CooperationTrend, TrendDirection, ViolationRates,
};
pub use classify::{
    Classification, Classifier, ComplianceChoice, CooperationChoice, LabelClassifier,
    UnrecognizedPolicy,
};
pub use config::{load_dataset, DatasetRunConfig, EnvironmentSpec, RunnerConfig};
pub use environment::{
    AgentRoster, CollectiveOutcome, EnvironmentExport, EnvironmentKind, MultiAgentConfig,
    MultiAgentEnvironment, MultiAgentSummary, MultiRoundRecord, RunStatus, SingleAgentConfig,
    SingleAgentEnvironment, SingleAgentSummary, SingleRoundRecord,
};
pub use error::{AgentError, Result, SimError, ValidationError};
pub use history::{History, HistoryExport, RoundRecord};
pub use metrics::METRICS;
pub use obs::RunSpan;
pub use reporting::{read_export_artifact, read_export_path, write_export_artifact};
pub use runner::{AgentBinding, ComparativeSummary, DatasetReport, EnvironmentResult, ExperimentRunner};
pub use supervision::{SupervisionPattern, SupervisionState};

/// Crate version, stamped into comparative reports and the CLI's `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
