//! Append-only round history.
//!
//! [`History`] is the single source of truth for what happened during a run.
//! Records go in through [`History::append`], which enforces contiguous round
//! numbering, per-agent vector shape and non-decreasing timestamps, and keeps
//! `total_reward` equal to the running sum of recorded rewards. Nothing hands
//! out mutable access to a stored record.
//!
//! Question building sees history only through [`History::window`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Behaviour shared by single-agent and multi-agent round records.
pub trait RoundRecord: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn round_id(&self) -> u64;

    fn timestamp(&self) -> DateTime<Utc>;

    /// Sum of every reward assigned in this round, in agent order.
    fn round_reward(&self) -> f64;

    /// Check per-agent vectors against the declared agent count.
    fn check_shape(&self, num_agents: usize) -> Result<(), ValidationError>;
}

/// Ordered log of round outcomes for one environment run.
#[derive(Debug, Clone)]
pub struct History<R> {
    rounds: Vec<R>,
    total_reward: f64,
    start_time: DateTime<Utc>,
    num_agents: usize,
}

impl<R: RoundRecord> History<R> {
    /// Empty history for a run with `num_agents` decision-makers per round.
    pub fn new(num_agents: usize) -> Self {
        Self::with_start_time(num_agents, Utc::now())
    }

    pub fn with_start_time(num_agents: usize, start_time: DateTime<Utc>) -> Self {
        Self {
            rounds: Vec::new(),
            total_reward: 0.0,
            start_time,
            num_agents,
        }
    }

    /// Round id the next appended record must carry.
    pub fn next_round_id(&self) -> u64 {
        self.rounds.len() as u64
    }

    /// Wall-clock time for a new record, clamped so the log never runs backwards.
    pub fn stamp(&self) -> DateTime<Utc> {
        let floor = self
            .rounds
            .last()
            .map(RoundRecord::timestamp)
            .unwrap_or(self.start_time);
        Utc::now().max(floor)
    }

    /// Append a finished round.
    pub fn append(&mut self, record: R) -> Result<(), ValidationError> {
        let expected = self.next_round_id();
        if record.round_id() != expected {
            return Err(ValidationError::RoundOutOfSequence {
                expected,
                actual: record.round_id(),
            });
        }
        record.check_shape(self.num_agents)?;
        if let Some(last) = self.rounds.last() {
            if record.timestamp() < last.timestamp() {
                return Err(ValidationError::TimestampRegressed {
                    round_id: record.round_id(),
                });
            }
        }

        self.total_reward += record.round_reward();
        self.rounds.push(record);
        Ok(())
    }

    /// The most recent `n` records in round order.
    ///
    /// `None` and `Some(0)` both mean unbounded and return every record.
    pub fn window(&self, n: Option<usize>) -> &[R] {
        match n {
            Some(k) if k > 0 && k < self.rounds.len() => &self.rounds[self.rounds.len() - k..],
            _ => &self.rounds,
        }
    }

    pub fn rounds(&self) -> &[R] {
        &self.rounds
    }

    pub fn last(&self) -> Option<&R> {
        self.rounds.last()
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn total_reward(&self) -> f64 {
        self.total_reward
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn num_agents(&self) -> usize {
        self.num_agents
    }

    /// Structured, order-preserving snapshot of the whole log.
    pub fn export(&self) -> HistoryExport<R> {
        HistoryExport {
            rounds: self.rounds.clone(),
            total_reward: self.total_reward,
            start_time: self.start_time,
            total_rounds: self.rounds.len() as u64,
        }
    }
}

/// Serializable snapshot of a [`History`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryExport<R> {
    pub rounds: Vec<R>,
    pub total_reward: f64,
    pub start_time: DateTime<Utc>,
    pub total_rounds: u64,
}

impl<R: RoundRecord> HistoryExport<R> {
    /// Rebuild a [`History`] by re-appending every round, so all append-time
    /// invariants are re-checked. Also rejects a stored `total_reward` or
    /// `total_rounds` that disagrees with the rounds.
    pub fn replay(&self, num_agents: usize) -> Result<History<R>, ValidationError> {
        let mut history = History::with_start_time(num_agents, self.start_time);
        for record in &self.rounds {
            history.append(record.clone())?;
        }
        if history.len() as u64 != self.total_rounds {
            return Err(ValidationError::config(
                "total_rounds",
                format!(
                    "declares {} rounds but {} are recorded",
                    self.total_rounds,
                    history.len()
                ),
            ));
        }
        if history.total_reward() != self.total_reward {
            return Err(ValidationError::config(
                "total_reward",
                format!(
                    "declares {} but recorded rewards sum to {}",
                    self.total_reward,
                    history.total_reward()
                ),
            ));
        }
        Ok(history)
    }
}
