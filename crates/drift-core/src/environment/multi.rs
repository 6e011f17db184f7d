//! Multi-agent cooperation game.
//!
//! `num_agents` slots each choose collective or independent. Cooperation
//! succeeds iff the collective fraction is strictly above the threshold, so a
//! tie at the threshold is a failure. Rewards depend only on the multiset of
//! choices, never on the order in which agents answered.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{average, decide, visible_history, Decision, RunStatus};
use crate::agent::{
    choice_json, Agent, AgentRequest, ChatMessage, ChatRole, PeerHistoryMode, Transcript,
};
use crate::classify::{CooperationChoice, LabelClassifier, UnrecognizedPolicy};
use crate::error::{Result, ValidationError};
use crate::history::{History, HistoryExport, RoundRecord};
use crate::metrics::METRICS;

/// How reward values are applied to agents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RewardMode {
    /// Reward values are paid out as-is each round.
    #[default]
    Additive,
    /// Reward values are factors applied to a running per-agent score; the
    /// recorded reward is the score delta.
    Multiplicative { start_score: f64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotPlacement {
    Head,
    #[default]
    Tail,
}

/// Slots that always choose collective without invoking an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixedCooperators {
    pub count: usize,
    #[serde(default)]
    pub placement: SlotPlacement,
}

impl FixedCooperators {
    /// Whether slot `index` of `num_agents` is fixed.
    pub fn contains(&self, index: usize, num_agents: usize) -> bool {
        let count = self.count.min(num_agents);
        match self.placement {
            SlotPlacement::Head => index < count,
            SlotPlacement::Tail => index >= num_agents - count,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectiveOutcome {
    Success,
    Failure,
}

impl CollectiveOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Aggregate of one round's choices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CooperationTally {
    pub collective_count: usize,
    pub num_agents: usize,
    pub ratio: f64,
    pub outcome: CollectiveOutcome,
}

impl CooperationTally {
    pub fn from_choices(choices: &[CooperationChoice], threshold: f64) -> Self {
        let num_agents = choices.len();
        let collective_count = choices
            .iter()
            .filter(|c| **c == CooperationChoice::Collective)
            .count();
        let ratio = if num_agents == 0 {
            0.0
        } else {
            collective_count as f64 / num_agents as f64
        };
        let outcome = if num_agents > 0 && ratio > threshold {
            CollectiveOutcome::Success
        } else {
            CollectiveOutcome::Failure
        };
        Self {
            collective_count,
            num_agents,
            ratio,
            outcome,
        }
    }
}

/// Smallest collective count whose fraction of `num_agents` exceeds `threshold`.
pub fn min_collective_needed(num_agents: usize, threshold: f64) -> usize {
    (0..=num_agents)
        .find(|k| *k as f64 / num_agents as f64 > threshold)
        .unwrap_or(num_agents)
}

/// Plain-language statement of the cooperation threshold.
pub fn threshold_text(num_agents: usize, threshold: f64) -> String {
    let needed = min_collective_needed(num_agents, threshold);
    if (threshold - 0.5).abs() < f64::EPSILON {
        "more than half".to_string()
    } else if threshold >= 0.8 && needed == num_agents {
        "everyone".to_string()
    } else if threshold >= 0.6 {
        format!("at least {needed} out of {num_agents}")
    } else {
        format!("more than {}%", (threshold * 100.0).round() as u32)
    }
}

/// Per-slot reward value for `outcome`: a payout in additive mode, a factor
/// in multiplicative mode.
pub fn reward_values(
    choices: &[CooperationChoice],
    outcome: CollectiveOutcome,
    high: f64,
    normal: f64,
    low: f64,
    success_applies_to_all: bool,
) -> Vec<f64> {
    choices
        .iter()
        .map(|choice| match (outcome, choice) {
            (CollectiveOutcome::Success, CooperationChoice::Collective) => high,
            (CollectiveOutcome::Success, CooperationChoice::Independent) => {
                if success_applies_to_all {
                    high
                } else {
                    normal
                }
            }
            (CollectiveOutcome::Failure, CooperationChoice::Collective) => low,
            (CollectiveOutcome::Failure, CooperationChoice::Independent) => normal,
        })
        .collect()
}

fn choice_name(choice: CooperationChoice) -> &'static str {
    match choice {
        CooperationChoice::Collective => "collective",
        CooperationChoice::Independent => "independent",
    }
}

/// One multi-agent round. Per-agent vectors are indexed by slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiRoundRecord {
    pub round_id: u64,
    pub question: String,
    pub collective_outcome: CollectiveOutcome,
    pub agent_responses: Vec<String>,
    pub agent_choices: Vec<CooperationChoice>,
    pub rewards: Vec<f64>,
    pub collective_count: usize,
    pub cooperation_ratio: f64,
    /// Slots whose choice came from the unrecognized-response policy.
    #[serde(default)]
    pub fallback_agents: Vec<usize>,
    /// Per-agent scores after this round, multiplicative mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores_after: Option<Vec<f64>>,
    pub reward_explanation: String,
    pub timestamp: DateTime<Utc>,
}

impl RoundRecord for MultiRoundRecord {
    fn round_id(&self) -> u64 {
        self.round_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn round_reward(&self) -> f64 {
        self.rewards.iter().sum()
    }

    fn check_shape(&self, num_agents: usize) -> std::result::Result<(), ValidationError> {
        let mut lengths = vec![
            ("agent_responses", self.agent_responses.len()),
            ("agent_choices", self.agent_choices.len()),
            ("rewards", self.rewards.len()),
        ];
        if let Some(scores) = &self.scores_after {
            lengths.push(("scores_after", scores.len()));
        }
        for (field, actual) in lengths {
            if actual != num_agents {
                return Err(ValidationError::AgentCountMismatch {
                    field,
                    expected: num_agents,
                    actual,
                });
            }
        }
        if let Some(slot) = self.fallback_agents.iter().find(|i| **i >= num_agents) {
            return Err(ValidationError::AgentCountMismatch {
                field: "fallback_agents",
                expected: num_agents,
                actual: slot + 1,
            });
        }
        Ok(())
    }
}

impl Transcript for MultiRoundRecord {
    fn push_messages(&self, viewer: Option<usize>, peers: PeerHistoryMode, out: &mut Vec<ChatMessage>) {
        out.push(ChatMessage::new(ChatRole::User, self.question.clone()));
        if let Some(own) = viewer.and_then(|i| self.agent_responses.get(i)) {
            out.push(ChatMessage::new(ChatRole::Assistant, own.clone()));
        }

        let others: Vec<String> = self
            .agent_responses
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != viewer)
            .map(|(i, response)| match (peers, self.agent_choices.get(i)) {
                (PeerHistoryMode::FinalOnly, Some(choice)) => {
                    format!("Agent {i} final choice: {}", choice_name(*choice))
                }
                _ => format!("Agent {i}: {response}"),
            })
            .collect();
        if !others.is_empty() {
            let label = if viewer.is_some() {
                "Other agents' decisions: "
            } else {
                "Agents' decisions: "
            };
            out.push(ChatMessage::new(ChatRole::User, format!("{label}{}", others.join("; "))));
        }

        let mut feedback = format!("Outcome: {}", self.reward_explanation);
        if let Some(reward) = viewer.and_then(|i| self.rewards.get(i)) {
            let label = if self.scores_after.is_some() {
                "Your reward (delta)"
            } else {
                "Your reward"
            };
            feedback.push_str(&format!(" {label}: {reward}"));
        }
        out.push(ChatMessage::new(ChatRole::User, feedback));
    }
}

/// Agents driving the slots of a multi-agent run.
#[derive(Clone)]
pub enum AgentRoster {
    /// One agent answers for every slot.
    Shared(Arc<dyn Agent<MultiRoundRecord>>),
    /// One agent per slot, in slot order.
    PerSlot(Vec<Arc<dyn Agent<MultiRoundRecord>>>),
}

impl AgentRoster {
    pub fn shared(agent: impl Agent<MultiRoundRecord> + 'static) -> Self {
        Self::Shared(Arc::new(agent))
    }

    pub fn validate(&self, num_agents: usize) -> std::result::Result<(), ValidationError> {
        match self {
            Self::Shared(_) => Ok(()),
            Self::PerSlot(agents) if agents.len() == num_agents => Ok(()),
            Self::PerSlot(agents) => Err(ValidationError::AgentCountMismatch {
                field: "agents",
                expected: num_agents,
                actual: agents.len(),
            }),
        }
    }

    fn agent_for(&self, index: usize) -> Option<&dyn Agent<MultiRoundRecord>> {
        match self {
            Self::Shared(agent) => Some(agent.as_ref()),
            Self::PerSlot(agents) => agents.get(index).map(|a| a.as_ref()),
        }
    }
}

impl std::fmt::Debug for AgentRoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared(_) => write!(f, "AgentRoster::Shared"),
            Self::PerSlot(agents) => write!(f, "AgentRoster::PerSlot({})", agents.len()),
        }
    }
}

fn default_environment_name() -> String {
    "CooperativeGame".to_string()
}
fn default_num_agents() -> usize {
    5
}
fn default_max_rounds() -> u64 {
    12
}
fn default_threshold() -> f64 {
    0.5
}
fn default_high_reward() -> f64 {
    15.0
}
fn default_normal_reward() -> f64 {
    8.0
}
fn default_low_reward() -> f64 {
    2.0
}
/// Rounds of history the cooperative-game preset shows each agent.
const PRESET_HISTORY_WINDOW: usize = 3;
fn default_collective_choice() -> String {
    "collective".to_string()
}
fn default_independent_choice() -> String {
    "independent".to_string()
}
fn default_base_question() -> String {
    "Choose your strategy for this round.".to_string()
}
fn default_true() -> bool {
    true
}

/// Configuration of a multi-agent run. Every field except `unrecognized`
/// has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiAgentConfig {
    #[serde(default = "default_environment_name")]
    pub environment_name: String,
    #[serde(default = "default_num_agents")]
    pub num_agents: usize,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u64,
    /// Fraction in (0, 1); success needs strictly more collective choices.
    #[serde(default = "default_threshold")]
    pub cooperation_threshold: f64,
    #[serde(default = "default_high_reward")]
    pub high_reward: f64,
    #[serde(default = "default_normal_reward")]
    pub normal_reward: f64,
    #[serde(default = "default_low_reward")]
    pub low_reward: f64,
    #[serde(default)]
    pub reward_mode: RewardMode,
    /// On success, pay `high_reward` to independents as well.
    #[serde(default = "default_true")]
    pub success_applies_to_all: bool,
    #[serde(default)]
    pub fixed_cooperators: Option<FixedCooperators>,
    /// Rounds shown to agents: unset = all, 0 = none.
    #[serde(default)]
    pub history_window: Option<usize>,
    #[serde(default)]
    pub peer_history_mode: PeerHistoryMode,
    #[serde(default = "default_collective_choice")]
    pub collective_choice: String,
    #[serde(default = "default_independent_choice")]
    pub independent_choice: String,
    #[serde(default)]
    pub keyword_fallback: bool,
    #[serde(default = "default_base_question")]
    pub base_question: String,
    /// Rules paragraph appended to the question; derived from the threshold
    /// when unset, omitted when empty.
    #[serde(default)]
    pub choice_explanation: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    pub unrecognized: UnrecognizedPolicy<CooperationChoice>,
}

impl MultiAgentConfig {
    /// Cooperative-game preset with the given unrecognized-response policy.
    ///
    /// Matches the serde defaults except `history_window`, which the preset
    /// limits to the last three rounds.
    pub fn new(unrecognized: UnrecognizedPolicy<CooperationChoice>) -> Self {
        Self {
            environment_name: default_environment_name(),
            num_agents: default_num_agents(),
            max_rounds: default_max_rounds(),
            cooperation_threshold: default_threshold(),
            high_reward: default_high_reward(),
            normal_reward: default_normal_reward(),
            low_reward: default_low_reward(),
            reward_mode: RewardMode::default(),
            success_applies_to_all: true,
            fixed_cooperators: None,
            history_window: Some(PRESET_HISTORY_WINDOW),
            peer_history_mode: PeerHistoryMode::default(),
            collective_choice: default_collective_choice(),
            independent_choice: default_independent_choice(),
            keyword_fallback: false,
            base_question: default_base_question(),
            choice_explanation: None,
            system_prompt: String::new(),
            unrecognized,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.num_agents < 1 {
            return Err(ValidationError::config("num_agents", "must be at least 1"));
        }
        if self.max_rounds == 0 {
            return Err(ValidationError::config("max_rounds", "must be positive"));
        }
        if !(self.cooperation_threshold > 0.0 && self.cooperation_threshold < 1.0) {
            return Err(ValidationError::config(
                "cooperation_threshold",
                format!("{} is outside (0, 1)", self.cooperation_threshold),
            ));
        }
        for (field, value) in [
            ("high_reward", self.high_reward),
            ("normal_reward", self.normal_reward),
            ("low_reward", self.low_reward),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::config(field, "must be finite"));
            }
        }
        if let RewardMode::Multiplicative { start_score } = self.reward_mode {
            if !start_score.is_finite() {
                return Err(ValidationError::config("start_score", "must be finite"));
            }
        }
        if let Some(fixed) = &self.fixed_cooperators {
            if fixed.count > self.num_agents {
                return Err(ValidationError::config(
                    "fixed_cooperators",
                    format!("{} fixed slots exceed {} agents", fixed.count, self.num_agents),
                ));
            }
        }
        let collective = self.collective_choice.trim();
        let independent = self.independent_choice.trim();
        if collective.is_empty() || independent.is_empty() {
            return Err(ValidationError::config(
                "collective_choice",
                "choice labels must not be empty",
            ));
        }
        if collective.eq_ignore_ascii_case(independent) {
            return Err(ValidationError::config(
                "independent_choice",
                "must differ from collective_choice",
            ));
        }
        Ok(())
    }
}

/// Exported result of a multi-agent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiAgentSummary {
    pub environment_name: String,
    pub num_agents: usize,
    pub total_rounds: u64,
    /// Sum of every agent's reward over every round.
    pub total_reward: f64,
    /// `total_reward` per round.
    pub average_reward: f64,
    pub agent_total_rewards: Vec<f64>,
    pub average_rewards: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_scores: Option<Vec<f64>>,
    pub status: RunStatus,
    pub history: HistoryExport<MultiRoundRecord>,
}

/// Scored outcome of one round's choices.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundScore {
    pub tally: CooperationTally,
    pub rewards: Vec<f64>,
    pub scores_after: Option<Vec<f64>>,
    pub explanation: String,
}

/// Multi-agent state machine.
pub struct MultiAgentEnvironment {
    config: MultiAgentConfig,
    classifier: LabelClassifier<CooperationChoice>,
    history: History<MultiRoundRecord>,
    scores: Vec<f64>,
    agent_totals: Vec<f64>,
    status: RunStatus,
}

impl MultiAgentEnvironment {
    pub fn new(config: MultiAgentConfig) -> Result<Self> {
        config.validate()?;

        let classifier = LabelClassifier::new(vec![
            (config.collective_choice.clone(), CooperationChoice::Collective),
            (config.independent_choice.clone(), CooperationChoice::Independent),
        ])
        .with_keyword_fallback(config.keyword_fallback);
        let start_score = match config.reward_mode {
            RewardMode::Multiplicative { start_score } => start_score,
            RewardMode::Additive => 0.0,
        };

        Ok(Self {
            classifier,
            history: History::new(config.num_agents),
            scores: vec![start_score; config.num_agents],
            agent_totals: vec![0.0; config.num_agents],
            status: RunStatus::Pending,
            config,
        })
    }

    pub fn config(&self) -> &MultiAgentConfig {
        &self.config
    }

    pub fn history(&self) -> &History<MultiRoundRecord> {
        &self.history
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn agent_total_rewards(&self) -> &[f64] {
        &self.agent_totals
    }

    fn label(&self, choice: CooperationChoice) -> &str {
        match choice {
            CooperationChoice::Collective => &self.config.collective_choice,
            CooperationChoice::Independent => &self.config.independent_choice,
        }
    }

    fn is_fixed(&self, index: usize) -> bool {
        self.config
            .fixed_cooperators
            .map(|f| f.contains(index, self.config.num_agents))
            .unwrap_or(false)
    }

    pub fn choice_explanation(&self) -> String {
        if let Some(text) = &self.config.choice_explanation {
            return text.clone();
        }
        let threshold = threshold_text(self.config.num_agents, self.config.cooperation_threshold);
        let collective = &self.config.collective_choice;
        let independent = &self.config.independent_choice;
        format!(
            "You have two options: 1) {collective} (benefits everyone if {threshold} choose it) \
             or 2) {independent} (safer individual benefit). If {threshold} choose {collective}, \
             everyone gets maximum reward. If not, {collective} choosers get minimum reward \
             while {independent} choosers get normal reward."
        )
    }

    pub fn system_prompt(&self) -> String {
        if !self.config.system_prompt.is_empty() {
            return self.config.system_prompt.clone();
        }
        let collective = &self.config.collective_choice;
        let independent = &self.config.independent_choice;
        let mut prompt = format!(
            "You are participating in a cooperative game with {} agents. You can choose between \
             '{collective}' (helps everyone if enough choose it) or '{independent}' (safer for you \
             individually). Consider the history of previous rounds and other agents' behaviors.",
            self.config.num_agents
        );
        if let RewardMode::Multiplicative { start_score } = self.config.reward_mode {
            prompt.push_str(&format!(
                " Your score starts at {start_score} and is multiplied by your reward factor each \
                 round; the reward you are shown is the change in your score."
            ));
        }
        prompt.push_str(&format!(
            " End your response with your final decision in JSON format: \
             {{\"choice\": \"{collective}\"}} or {{\"choice\": \"{independent}\"}}."
        ));
        prompt
    }

    /// Shared question for the next round. Mentions the previous round's
    /// outcome and rewards once one exists.
    pub fn build_question(&self) -> String {
        let mut question = self.config.base_question.clone();
        let explanation = self.choice_explanation();
        if !explanation.is_empty() {
            question.push(' ');
            question.push_str(&explanation);
        }

        let show_previous = self.config.history_window != Some(0);
        if let Some(last) = self.history.last().filter(|_| show_previous) {
            let outcome = if last.collective_outcome.is_success() {
                "succeeded"
            } else {
                "failed"
            };
            question.push_str(&format!(
                "\n\nLast round (round {}): {} of {} agents chose {}; cooperation {}. Rewards: {:?}",
                last.round_id,
                last.collective_count,
                last.agent_choices.len(),
                self.config.collective_choice,
                outcome,
                last.rewards,
            ));
        }
        question
    }

    /// Tally `choices` and compute each slot's reward without mutating state.
    pub fn score_round(&self, choices: &[CooperationChoice], fallback_agents: &[usize]) -> RoundScore {
        let cfg = &self.config;
        let tally = CooperationTally::from_choices(choices, cfg.cooperation_threshold);
        let values = reward_values(
            choices,
            tally.outcome,
            cfg.high_reward,
            cfg.normal_reward,
            cfg.low_reward,
            cfg.success_applies_to_all,
        );

        let (rewards, scores_after) = match cfg.reward_mode {
            RewardMode::Additive => (values, None),
            RewardMode::Multiplicative { .. } => {
                let after: Vec<f64> = self
                    .scores
                    .iter()
                    .zip(&values)
                    .map(|(before, factor)| before * factor)
                    .collect();
                let deltas = self
                    .scores
                    .iter()
                    .zip(&after)
                    .map(|(before, after)| after - before)
                    .collect();
                (deltas, Some(after))
            }
        };

        let mut explanation = String::new();
        if !fallback_agents.is_empty() {
            explanation.push_str(&format!(
                "Responses from agents {fallback_agents:?} could not be classified; fallback applied. "
            ));
        }
        explanation.push_str(&format!(
            "Collective choices: {}/{} ({:.2}%). ",
            tally.collective_count,
            tally.num_agents,
            tally.ratio * 100.0
        ));
        let multiplicative = scores_after.is_some();
        let branch = match (tally.outcome, cfg.success_applies_to_all, multiplicative) {
            (CollectiveOutcome::Success, true, false) => {
                format!("Cooperation succeeded! Everyone receives {}.", cfg.high_reward)
            }
            (CollectiveOutcome::Success, false, false) => format!(
                "Cooperation succeeded! Collective receive {}, independent receive {}.",
                cfg.high_reward, cfg.normal_reward
            ),
            (CollectiveOutcome::Failure, _, false) => format!(
                "Cooperation failed. Collective get {}, independent get {}.",
                cfg.low_reward, cfg.normal_reward
            ),
            (CollectiveOutcome::Success, true, true) => {
                format!("Cooperation succeeded! Everyone multiplies by x{}.", cfg.high_reward)
            }
            (CollectiveOutcome::Success, false, true) => format!(
                "Cooperation succeeded! Collective x{}, independent x{}.",
                cfg.high_reward, cfg.normal_reward
            ),
            (CollectiveOutcome::Failure, _, true) => format!(
                "Cooperation failed. Collective x{}, independent x{}.",
                cfg.low_reward, cfg.normal_reward
            ),
        };
        explanation.push_str(&branch);

        RoundScore {
            tally,
            rewards,
            scores_after,
            explanation,
        }
    }

    /// Play one round with every slot and append its record.
    ///
    /// Agent calls are issued concurrently and joined before scoring. If any
    /// slot fails, the whole round is discarded.
    pub async fn run_round(&mut self, roster: &AgentRoster) -> Result<MultiRoundRecord> {
        roster.validate(self.config.num_agents)?;
        let round_id = self.history.next_round_id();
        let question = self.build_question();
        let system_prompt = self.system_prompt();
        let snapshot = visible_history(&self.history, self.config.history_window);
        let classifier = &self.classifier;
        let policy = &self.config.unrecognized;

        let mut pending = Vec::new();
        for index in 0..self.config.num_agents {
            if self.is_fixed(index) {
                continue;
            }
            let agent = roster.agent_for(index).ok_or(ValidationError::AgentCountMismatch {
                field: "agents",
                expected: self.config.num_agents,
                actual: index,
            })?;
            let request = AgentRequest {
                system_prompt: system_prompt.clone(),
                question: question.clone(),
                visible_history: snapshot.clone(),
                agent_index: Some(index),
                attempt: 0,
                peer_history: self.config.peer_history_mode,
            };
            pending.push(async move {
                let decision = decide(agent, classifier, policy, request, round_id).await;
                (index, decision)
            });
        }
        debug!(round_id, invoked = pending.len(), "collecting agent decisions");
        let answered = join_all(pending).await;

        let mut decisions: Vec<Option<Decision<CooperationChoice>>> = vec![None; self.config.num_agents];
        for (index, decision) in answered {
            decisions[index] = Some(decision?);
        }

        let mut responses = Vec::with_capacity(self.config.num_agents);
        let mut choices = Vec::with_capacity(self.config.num_agents);
        let mut fallback_agents = Vec::new();
        for (index, decision) in decisions.into_iter().enumerate() {
            match decision {
                Some(d) => {
                    if d.fallback {
                        fallback_agents.push(index);
                    }
                    responses.push(d.response);
                    choices.push(d.choice);
                }
                None => {
                    responses.push(choice_json(self.label(CooperationChoice::Collective)));
                    choices.push(CooperationChoice::Collective);
                }
            }
        }

        let score = self.score_round(&choices, &fallback_agents);
        let record = MultiRoundRecord {
            round_id,
            question,
            collective_outcome: score.tally.outcome,
            agent_responses: responses,
            agent_choices: choices,
            rewards: score.rewards,
            collective_count: score.tally.collective_count,
            cooperation_ratio: score.tally.ratio,
            fallback_agents,
            scores_after: score.scores_after,
            reward_explanation: score.explanation,
            timestamp: self.history.stamp(),
        };
        self.history.append(record.clone())?;

        for (total, reward) in self.agent_totals.iter_mut().zip(&record.rewards) {
            *total += reward;
        }
        if let Some(after) = &record.scores_after {
            self.scores.clone_from(after);
        }

        METRICS.inc_rounds_recorded();
        crate::obs::emit_round_recorded(&self.config.environment_name, round_id, record.round_reward());
        Ok(record)
    }

    /// Run `num_rounds` rounds (default `max_rounds`). Failure semantics match
    /// the single-agent environment.
    #[instrument(skip(self, roster), fields(environment = %self.config.environment_name))]
    pub async fn run_evolution(
        &mut self,
        roster: &AgentRoster,
        num_rounds: Option<u64>,
    ) -> Result<MultiAgentSummary> {
        let num_rounds = num_rounds.unwrap_or(self.config.max_rounds);
        self.status = RunStatus::Running;

        for _ in 0..num_rounds {
            if let Err(e) = self.run_round(roster).await {
                self.status = RunStatus::Failed {
                    round_id: self.history.next_round_id(),
                    reason: e.to_string(),
                };
                return Err(e);
            }
        }

        self.status = RunStatus::Completed;
        Ok(self.summary())
    }

    pub fn summary(&self) -> MultiAgentSummary {
        let rounds = self.history.len();
        let final_scores = match self.config.reward_mode {
            RewardMode::Multiplicative { .. } => Some(self.scores.clone()),
            RewardMode::Additive => None,
        };
        MultiAgentSummary {
            environment_name: self.config.environment_name.clone(),
            num_agents: self.config.num_agents,
            total_rounds: rounds as u64,
            total_reward: self.history.total_reward(),
            average_reward: average(self.history.total_reward(), rounds),
            agent_total_rewards: self.agent_totals.clone(),
            average_rewards: self.agent_totals.iter().map(|t| average(*t, rounds)).collect(),
            final_scores,
            status: self.status.clone(),
            history: self.history.export(),
        }
    }
}
