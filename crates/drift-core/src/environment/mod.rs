//! Round-based environments.
//!
//! - [`single`]: one agent, supervision-dependent reward table
//! - [`multi`]: N agents sharing one collective outcome per round
//!
//! Both drive the same protocol: build a question from state and the history
//! window, invoke the agent(s), classify, score, append one record. A round
//! that fails never reaches the history.

pub mod multi;
pub mod single;

use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentRequest};
use crate::classify::{Classification, Classifier, LabelClassifier, PolicyAction, UnrecognizedPolicy};
use crate::error::{preview, Result, SimError, ValidationError};
use crate::history::{History, RoundRecord};
use crate::metrics::METRICS;

pub use crate::agent::PeerHistoryMode;
pub use multi::{
    AgentRoster, CollectiveOutcome, CooperationTally, FixedCooperators, MultiAgentConfig,
    MultiAgentEnvironment, MultiAgentSummary, MultiRoundRecord, RewardMode, SlotPlacement,
};
pub use single::{SingleAgentConfig, SingleAgentEnvironment, SingleAgentSummary, SingleRoundRecord};

/// Lifecycle of an environment run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    /// Aborted before `round_id` was recorded; earlier rounds are intact.
    Failed { round_id: u64, reason: String },
}

impl RunStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    SingleAgent,
    MultiAgent,
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleAgent => write!(f, "single_agent"),
            Self::MultiAgent => write!(f, "multi_agent"),
        }
    }
}

/// Persisted result of one environment run, discriminated on environment kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "environment_kind", rename_all = "snake_case")]
pub enum EnvironmentExport {
    SingleAgent(SingleAgentSummary),
    MultiAgent(MultiAgentSummary),
}

impl EnvironmentExport {
    pub fn kind(&self) -> EnvironmentKind {
        match self {
            Self::SingleAgent(_) => EnvironmentKind::SingleAgent,
            Self::MultiAgent(_) => EnvironmentKind::MultiAgent,
        }
    }

    pub fn environment_name(&self) -> &str {
        match self {
            Self::SingleAgent(s) => &s.environment_name,
            Self::MultiAgent(s) => &s.environment_name,
        }
    }

    pub fn total_rounds(&self) -> u64 {
        match self {
            Self::SingleAgent(s) => s.total_rounds,
            Self::MultiAgent(s) => s.total_rounds,
        }
    }

    pub fn total_reward(&self) -> f64 {
        match self {
            Self::SingleAgent(s) => s.total_reward,
            Self::MultiAgent(s) => s.total_reward,
        }
    }

    pub fn average_reward(&self) -> f64 {
        match self {
            Self::SingleAgent(s) => s.average_reward,
            Self::MultiAgent(s) => s.average_reward,
        }
    }

    pub fn status(&self) -> &RunStatus {
        match self {
            Self::SingleAgent(s) => &s.status,
            Self::MultiAgent(s) => &s.status,
        }
    }

    /// Canonical bytes: pretty JSON in field declaration order.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// SHA-256 hex digest of [`Self::to_canonical_bytes`].
    pub fn digest(&self) -> Result<String> {
        let bytes = self.to_canonical_bytes()?;
        Ok(crate::reporting::content_digest(&bytes))
    }

    /// Re-check every history invariant and the summary totals.
    pub fn verify(&self) -> std::result::Result<(), ValidationError> {
        match self {
            Self::SingleAgent(s) => {
                let history = s.history.replay(1)?;
                check_summary(s.total_rounds, s.total_reward, &history)
            }
            Self::MultiAgent(s) => {
                let history = s.history.replay(s.num_agents)?;
                check_summary(s.total_rounds, s.total_reward, &history)
            }
        }
    }
}

fn check_summary<R: RoundRecord>(
    total_rounds: u64,
    total_reward: f64,
    history: &History<R>,
) -> std::result::Result<(), ValidationError> {
    if total_rounds != history.len() as u64 {
        return Err(ValidationError::config(
            "total_rounds",
            format!("summary says {total_rounds}, history has {}", history.len()),
        ));
    }
    if total_reward != history.total_reward() {
        return Err(ValidationError::config(
            "total_reward",
            format!(
                "summary says {total_reward}, history sums to {}",
                history.total_reward()
            ),
        ));
    }
    Ok(())
}

/// Mean per round; 0.0 for an empty run.
pub(crate) fn average(total: f64, rounds: usize) -> f64 {
    if rounds == 0 {
        0.0
    } else {
        total / rounds as f64
    }
}

/// History snapshot handed to agents. `Some(0)` hides history entirely.
pub(crate) fn visible_history<R: RoundRecord>(history: &History<R>, window: Option<usize>) -> Vec<R> {
    match window {
        Some(0) => Vec::new(),
        other => history.window(other).to_vec(),
    }
}

/// A classified agent decision.
#[derive(Debug, Clone)]
pub(crate) struct Decision<C> {
    pub response: String,
    pub choice: C,
    pub fallback: bool,
}

/// Invoke `agent` and classify its response, applying `policy` to
/// unrecognized responses.
pub(crate) async fn decide<R, C>(
    agent: &dyn Agent<R>,
    classifier: &LabelClassifier<C>,
    policy: &UnrecognizedPolicy<C>,
    mut request: AgentRequest<R>,
    round_id: u64,
) -> Result<Decision<C>>
where
    R: RoundRecord,
    C: Copy + PartialEq + Send + Sync + std::fmt::Debug,
{
    let agent_index = request.agent_index.unwrap_or(0);
    loop {
        METRICS.inc_agent_invocations();
        let response = agent
            .respond(request.clone())
            .await
            .map_err(|source| SimError::AgentInvocation {
                round_id,
                agent_index,
                source,
            })?;

        if let Classification::Recognized(choice) = classifier.classify(&response) {
            return Ok(Decision {
                response,
                choice,
                fallback: false,
            });
        }

        match policy.on_unrecognized(request.attempt) {
            PolicyAction::Reprompt => {
                tracing::debug!(round_id, agent_index, attempt = request.attempt, "reprompting agent");
                request.attempt += 1;
            }
            PolicyAction::UseFallback(choice) => {
                METRICS.inc_classification_fallbacks();
                crate::obs::emit_classification_fallback(round_id, agent_index, &format!("{choice:?}"));
                return Ok(Decision {
                    response,
                    choice,
                    fallback: true,
                });
            }
            PolicyAction::Abort => {
                return Err(SimError::Classification {
                    round_id,
                    agent_index,
                    preview: preview(&response),
                });
            }
        }
    }
}
