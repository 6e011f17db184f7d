//! Agent contract and reference agents.
//!
//! The environment never owns an agent. Each invocation receives an
//! [`AgentRequest`] holding an owned snapshot of the visible history window;
//! agents cannot reach the environment's store.
//!
//! Language-model backends live outside this crate and implement [`Agent`].
//! The agents here are deterministic or seeded and exist for dry runs and tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AgentError;
use crate::history::RoundRecord;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One chat-style message, for backends that take a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// How peers' prior decisions appear in an agent's transcript.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerHistoryMode {
    /// Peers' full response text.
    #[default]
    Full,
    /// Only peers' classified choices.
    FinalOnly,
}

/// Renders a past round as chat messages from one agent's point of view.
pub trait Transcript {
    fn push_messages(&self, viewer: Option<usize>, peers: PeerHistoryMode, out: &mut Vec<ChatMessage>);
}

/// Input to one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest<R> {
    pub system_prompt: String,
    pub question: String,
    /// Owned snapshot of the history window, oldest first.
    pub visible_history: Vec<R>,
    /// Slot index in multi-agent rounds; `None` for single-agent rounds.
    pub agent_index: Option<usize>,
    /// 0 for the first call of a round, incremented on each reprompt.
    pub attempt: u32,
    pub peer_history: PeerHistoryMode,
}

impl<R: Transcript> AgentRequest<R> {
    /// System prompt, prior rounds, then the current question.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::new();
        if !self.system_prompt.is_empty() {
            out.push(ChatMessage::new(ChatRole::System, self.system_prompt.clone()));
        }
        for record in &self.visible_history {
            record.push_messages(self.agent_index, self.peer_history, &mut out);
        }
        out.push(ChatMessage::new(ChatRole::User, self.question.clone()));
        out
    }
}

/// A decision-maker driven by the environment.
#[async_trait]
pub trait Agent<R: RoundRecord>: Send + Sync {
    async fn respond(&self, request: AgentRequest<R>) -> Result<String, AgentError>;
}

#[async_trait]
impl<R: RoundRecord, A: Agent<R> + ?Sized> Agent<R> for Arc<A> {
    async fn respond(&self, request: AgentRequest<R>) -> Result<String, AgentError> {
        (**self).respond(request).await
    }
}

/// Decision text in the `{"choice": "<label>"}` form the classifiers expect.
pub fn choice_json(label: &str) -> String {
    format!(r#"{{"choice": "{label}"}}"#)
}

/// Wraps a synchronous closure as an agent.
pub struct FnAgent<F>(pub F);

#[async_trait]
impl<R, F> Agent<R> for FnAgent<F>
where
    R: RoundRecord,
    F: Fn(&AgentRequest<R>) -> Result<String, AgentError> + Send + Sync,
{
    async fn respond(&self, request: AgentRequest<R>) -> Result<String, AgentError> {
        (self.0)(&request)
    }
}

/// Always answers with the same choice label.
#[derive(Debug, Clone)]
pub struct FixedChoiceAgent {
    label: String,
}

impl FixedChoiceAgent {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl<R: RoundRecord> Agent<R> for FixedChoiceAgent {
    async fn respond(&self, _request: AgentRequest<R>) -> Result<String, AgentError> {
        Ok(choice_json(&self.label))
    }
}

/// Replays a fixed list of responses in call order.
#[derive(Debug)]
pub struct ScriptedAgent {
    responses: Vec<String>,
    cursor: AtomicUsize,
    cycle: bool,
}

impl ScriptedAgent {
    /// Fails with [`AgentError::Exhausted`] once the script runs out.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            cursor: AtomicUsize::new(0),
            cycle: false,
        }
    }

    /// Wraps around to the first response after the last.
    pub fn cycling(responses: Vec<String>) -> Self {
        Self {
            cycle: true,
            ..Self::new(responses)
        }
    }

    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: RoundRecord> Agent<R> for ScriptedAgent {
    async fn respond(&self, _request: AgentRequest<R>) -> Result<String, AgentError> {
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        if self.responses.is_empty() {
            return Err(AgentError::Exhausted);
        }
        let idx = if self.cycle {
            idx % self.responses.len()
        } else {
            idx
        };
        self.responses
            .get(idx)
            .cloned()
            .ok_or(AgentError::Exhausted)
    }
}

/// Picks uniformly among choice labels from a seeded RNG.
#[derive(Debug)]
pub struct RandomChoiceAgent {
    labels: Vec<String>,
    rng: Mutex<ChaCha8Rng>,
}

impl RandomChoiceAgent {
    pub fn new(labels: Vec<String>, seed: u64) -> Self {
        Self {
            labels,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl<R: RoundRecord> Agent<R> for RandomChoiceAgent {
    async fn respond(&self, _request: AgentRequest<R>) -> Result<String, AgentError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| AgentError::Failed("rng lock poisoned".to_string()))?;
        self.labels
            .choose(&mut *rng)
            .map(|label| choice_json(label))
            .ok_or(AgentError::Exhausted)
    }
}

/// Retries failed invocations of an inner agent.
///
/// Only invocation errors are retried; unrecognized responses are handled by
/// the environment's classification policy.
pub struct RetryingAgent<A> {
    inner: A,
    max_attempts: u32,
}

impl<A> RetryingAgent<A> {
    /// `max_attempts` counts the first call; values below 1 are treated as 1.
    pub fn new(inner: A, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl<R: RoundRecord, A: Agent<R>> Agent<R> for RetryingAgent<A> {
    async fn respond(&self, request: AgentRequest<R>) -> Result<String, AgentError> {
        let mut last_err = AgentError::Exhausted;
        for attempt in 1..=self.max_attempts {
            match self.inner.respond(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        agent_index = ?request.agent_index,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "agent invocation failed"
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::single::SingleRoundRecord;

    fn request() -> AgentRequest<SingleRoundRecord> {
        AgentRequest {
            system_prompt: "You run a bakery.".to_string(),
            question: "Which store?".to_string(),
            visible_history: Vec::new(),
            agent_index: None,
            attempt: 0,
            peer_history: PeerHistoryMode::Full,
        }
    }

    #[tokio::test]
    async fn test_scripted_agent_exhausts() {
        let agent = ScriptedAgent::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(Agent::<SingleRoundRecord>::respond(&agent, request()).await.unwrap(), "a");
        assert_eq!(Agent::<SingleRoundRecord>::respond(&agent, request()).await.unwrap(), "b");
        assert_eq!(
            Agent::<SingleRoundRecord>::respond(&agent, request()).await,
            Err(AgentError::Exhausted)
        );
    }

    #[tokio::test]
    async fn test_scripted_agent_cycles() {
        let agent = ScriptedAgent::cycling(vec!["a".to_string(), "b".to_string()]);
        let mut out = Vec::new();
        for _ in 0..5 {
            out.push(Agent::<SingleRoundRecord>::respond(&agent, request()).await.unwrap());
        }
        assert_eq!(out, vec!["a", "b", "a", "b", "a"]);
        assert_eq!(agent.calls(), 5);
    }

    #[tokio::test]
    async fn test_random_agent_reproducible() {
        let labels = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let a = RandomChoiceAgent::new(labels.clone(), 11);
        let b = RandomChoiceAgent::new(labels, 11);
        for _ in 0..20 {
            let ra = Agent::<SingleRoundRecord>::respond(&a, request()).await.unwrap();
            let rb = Agent::<SingleRoundRecord>::respond(&b, request()).await.unwrap();
            assert_eq!(ra, rb);
        }
    }

    #[tokio::test]
    async fn test_retrying_agent_recovers() {
        let calls = AtomicUsize::new(0);
        let flaky = FnAgent(move |_req: &AgentRequest<SingleRoundRecord>| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AgentError::Failed("timeout".to_string()))
            } else {
                Ok(choice_json("A"))
            }
        });
        let agent = RetryingAgent::new(flaky, 3);
        assert_eq!(agent.respond(request()).await.unwrap(), r#"{"choice": "A"}"#);
    }

    #[tokio::test]
    async fn test_retrying_agent_gives_up() {
        let failing = FnAgent(|_req: &AgentRequest<SingleRoundRecord>| {
            Err(AgentError::Failed("down".to_string()))
        });
        let agent = RetryingAgent::new(failing, 2);
        assert_eq!(
            agent.respond(request()).await,
            Err(AgentError::Failed("down".to_string()))
        );
    }

    #[test]
    fn test_messages_wrap_question() {
        let messages = request().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[1], ChatMessage::new(ChatRole::User, "Which store?"));
    }
}
