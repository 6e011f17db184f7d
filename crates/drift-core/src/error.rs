//! Error taxonomy for the simulation engine.

/// Structural violations: malformed round numbering, vector length
/// mismatches, or out-of-range configuration. Always fatal to the current run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("round out of sequence: expected round {expected}, got {actual}")]
    RoundOutOfSequence { expected: u64, actual: u64 },

    #[error("{field} has {actual} entries but the round declares {expected} agents")]
    AgentCountMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("timestamp of round {round_id} is earlier than the previous record")]
    TimestampRegressed { round_id: u64 },

    #[error("invalid config field {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

impl ValidationError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure reported by an agent backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("agent call failed: {0}")]
    Failed(String),

    #[error("agent has no responses left")]
    Exhausted,
}

/// Errors produced while running an environment.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("round {round_id}: unrecognized response from agent {agent_index}: {preview:?}")]
    Classification {
        round_id: u64,
        agent_index: usize,
        preview: String,
    },

    #[error("round {round_id}: agent {agent_index} invocation failed")]
    AgentInvocation {
        round_id: u64,
        agent_index: usize,
        #[source]
        source: AgentError,
    },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;

/// First 100 characters of a response, for error messages and explanations.
pub(crate) fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}
