//! Mapping free-text agent decisions onto a closed set of choices.
//!
//! A [`Classifier`] turns a response into [`Classification::Recognized`] or
//! [`Classification::Unrecognized`]. What happens to an unrecognized response
//! is decided by an explicit [`UnrecognizedPolicy`] in the environment config.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Choice set of the single-agent supervision scenario.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceChoice {
    Compliant,
    Violating,
}

/// Choice set of the multi-agent cooperation game.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CooperationChoice {
    Collective,
    Independent,
}

/// Result of classifying one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification<C> {
    Recognized(C),
    Unrecognized,
}

impl<C> Classification<C> {
    pub fn recognized(self) -> Option<C> {
        match self {
            Self::Recognized(choice) => Some(choice),
            Self::Unrecognized => None,
        }
    }
}

/// Pluggable response classifier.
pub trait Classifier<C>: Send + Sync {
    fn classify(&self, response: &str) -> Classification<C>;
}

fn json_choice_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\{[^}]*"choice"\s*:\s*"([^"]+)"[^}]*\}"#).expect("valid json choice regex")
    })
}

fn field_choice_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)"?choice"?\s*:\s*"?([^"\r\n,}]+)"?"#).expect("valid field choice regex")
    })
}

/// Matches responses against configured choice labels.
///
/// Lookup order: a `{"choice": "<label>"}` object, then a bare
/// `choice: <label>` field, then (only when enabled) a whole-word keyword
/// search that succeeds when exactly one label occurs in the text.
/// Label comparison is case-insensitive.
#[derive(Debug, Clone)]
pub struct LabelClassifier<C> {
    labels: Vec<(String, C)>,
    keywords: Vec<(Regex, C)>,
    keyword_fallback: bool,
}

impl<C: Copy + PartialEq> LabelClassifier<C> {
    pub fn new(labels: Vec<(String, C)>) -> Self {
        let keywords = labels
            .iter()
            .filter_map(|(label, choice)| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(label.trim()));
                Regex::new(&pattern).ok().map(|re| (re, *choice))
            })
            .collect();
        Self {
            labels,
            keywords,
            keyword_fallback: false,
        }
    }

    pub fn with_keyword_fallback(mut self, enabled: bool) -> Self {
        self.keyword_fallback = enabled;
        self
    }

    /// Configured label for `choice`.
    pub fn label_for(&self, choice: C) -> Option<&str> {
        self.labels
            .iter()
            .find(|(_, c)| *c == choice)
            .map(|(label, _)| label.as_str())
    }

    fn match_label(&self, raw: &str) -> Option<C> {
        let raw = raw.trim();
        self.labels
            .iter()
            .find(|(label, _)| label.trim().eq_ignore_ascii_case(raw))
            .map(|(_, choice)| *choice)
    }

    fn match_keyword(&self, response: &str) -> Option<C> {
        let mut found: Option<C> = None;
        for (re, choice) in &self.keywords {
            if re.is_match(response) {
                match found {
                    Some(existing) if existing != *choice => return None,
                    _ => found = Some(*choice),
                }
            }
        }
        found
    }
}

impl<C: Copy + PartialEq + Send + Sync> Classifier<C> for LabelClassifier<C> {
    fn classify(&self, response: &str) -> Classification<C> {
        let structured = [json_choice_re(), field_choice_re()]
            .into_iter()
            .filter_map(|re| re.captures(response))
            .find_map(|caps| caps.get(1).and_then(|m| self.match_label(m.as_str())));

        let choice = structured.or_else(|| {
            if self.keyword_fallback {
                self.match_keyword(response)
            } else {
                None
            }
        });

        match choice {
            Some(choice) => Classification::Recognized(choice),
            None => Classification::Unrecognized,
        }
    }
}

/// What to do when a response matches no configured choice.
///
/// Required in every environment config; there is no implicit default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum UnrecognizedPolicy<C> {
    /// Abort the round with a classification error.
    Abort,
    /// Record the round as if `choice` had been made, noting the fallback.
    Fallback { choice: C },
    /// Re-invoke the agent up to `attempts` more times, then fall back to
    /// `fallback` or abort when it is unset.
    Retry { attempts: u32, fallback: Option<C> },
}

/// Next step after the `attempt`-th unrecognized response (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction<C> {
    Reprompt,
    UseFallback(C),
    Abort,
}

impl<C: Copy> UnrecognizedPolicy<C> {
    pub fn on_unrecognized(&self, attempt: u32) -> PolicyAction<C> {
        match *self {
            Self::Abort => PolicyAction::Abort,
            Self::Fallback { choice } => PolicyAction::UseFallback(choice),
            Self::Retry { attempts, fallback } => {
                if attempt < attempts {
                    PolicyAction::Reprompt
                } else if let Some(choice) = fallback {
                    PolicyAction::UseFallback(choice)
                } else {
                    PolicyAction::Abort
                }
            }
        }
    }
}
