//! Runner configuration and scenario datasets.
//!
//! A study is described in TOML:
//!
//! ```toml
//! output_dir = "results"
//! analysis_window = 4
//!
//! [[environments]]
//! kind = "single_agent"
//! environment_name = "Bakery"
//! supervision_pattern = "alternating"
//! unrecognized = { policy = "abort" }
//!
//! [[environments]]
//! kind = "multi_agent"
//! num_agents = 5
//! unrecognized = { policy = "fallback", choice = "independent" }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::classify::{ComplianceChoice, UnrecognizedPolicy};
use crate::environment::{EnvironmentKind, MultiAgentConfig, SingleAgentConfig};
use crate::error::{Result, SimError, ValidationError};
use crate::supervision::SupervisionPattern;

/// One environment of a study.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvironmentSpec {
    SingleAgent(SingleAgentConfig),
    MultiAgent(MultiAgentConfig),
}

impl EnvironmentSpec {
    pub fn kind(&self) -> EnvironmentKind {
        match self {
            Self::SingleAgent(_) => EnvironmentKind::SingleAgent,
            Self::MultiAgent(_) => EnvironmentKind::MultiAgent,
        }
    }

    pub fn environment_name(&self) -> &str {
        match self {
            Self::SingleAgent(c) => &c.environment_name,
            Self::MultiAgent(c) => &c.environment_name,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        match self {
            Self::SingleAgent(c) => c.validate(),
            Self::MultiAgent(c) => c.validate(),
        }
    }
}

/// Top-level runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Where export artifacts go; nothing is persisted when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Trailing window for analysis metrics; unset analyses whole runs.
    #[serde(default)]
    pub analysis_window: Option<usize>,
    #[serde(default)]
    pub environments: Vec<EnvironmentSpec>,
}

impl RunnerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| SimError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        self.environments.iter().try_for_each(EnvironmentSpec::validate)
    }
}

fn default_dataset_rounds() -> u64 {
    6
}
/// Rounds of history the dataset preset shows the agent.
const PRESET_DATASET_WINDOW: usize = 5;
fn default_dataset_pattern() -> SupervisionPattern {
    SupervisionPattern::AllUnsupervised
}

/// Settings shared by every item of a single-agent dataset run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetRunConfig {
    #[serde(default = "default_dataset_rounds")]
    pub max_rounds: u64,
    /// Rounds shown to the agent: unset = all, 0 = none.
    #[serde(default)]
    pub history_window: Option<usize>,
    #[serde(default = "default_dataset_pattern")]
    pub supervision_pattern: SupervisionPattern,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub keyword_fallback: bool,
    pub unrecognized: UnrecognizedPolicy<ComplianceChoice>,
}

impl DatasetRunConfig {
    /// Dataset preset: six rounds showing the last five, all unsupervised.
    pub fn new(unrecognized: UnrecognizedPolicy<ComplianceChoice>) -> Self {
        Self {
            max_rounds: default_dataset_rounds(),
            history_window: Some(PRESET_DATASET_WINDOW),
            supervision_pattern: default_dataset_pattern(),
            seed: None,
            keyword_fallback: false,
            unrecognized,
        }
    }

    /// Environment config for one dataset item with these settings applied.
    pub fn environment_config(&self, item: &serde_json::Value) -> SingleAgentConfig {
        let mut config = SingleAgentConfig::from_dataset_item(
            item,
            self.max_rounds,
            self.history_window,
            self.unrecognized,
        );
        config.supervision_pattern = self.supervision_pattern;
        config.seed = self.seed;
        config.keyword_fallback = self.keyword_fallback;
        config
    }
}

/// Load a dataset: a non-empty JSON array of scenario objects.
pub fn load_dataset(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)?;
    parse_dataset(&content)
}

pub fn parse_dataset(content: &str) -> Result<Vec<serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    match value {
        serde_json::Value::Array(items) if !items.is_empty() => {
            if items.iter().all(serde_json::Value::is_object) {
                Ok(items)
            } else {
                Err(SimError::Config("dataset items must be JSON objects".to_string()))
            }
        }
        _ => Err(SimError::Config("dataset must be a non-empty JSON array".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::CooperationChoice;
    use crate::environment::RewardMode;

    const STUDY: &str = r#"
output_dir = "results"
analysis_window = 4

[[environments]]
kind = "single_agent"
environment_name = "Bakery"
supervision_pattern = "alternating"
seed = 9
unrecognized = { policy = "abort" }

[[environments]]
kind = "multi_agent"
num_agents = 4
reward_mode = { mode = "multiplicative", start_score = 1.0 }
unrecognized = { policy = "fallback", choice = "independent" }
"#;

    #[test]
    fn test_parse_study() {
        let config = RunnerConfig::from_toml_str(STUDY).expect("parse");
        assert_eq!(config.output_dir, Some(PathBuf::from("results")));
        assert_eq!(config.analysis_window, Some(4));
        assert_eq!(config.environments.len(), 2);

        match &config.environments[0] {
            EnvironmentSpec::SingleAgent(c) => {
                assert_eq!(c.environment_name, "Bakery");
                assert_eq!(c.supervision_pattern, SupervisionPattern::Alternating);
                assert_eq!(c.seed, Some(9));
                assert_eq!(c.max_rounds, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &config.environments[1] {
            EnvironmentSpec::MultiAgent(c) => {
                assert_eq!(c.num_agents, 4);
                assert_eq!(c.reward_mode, RewardMode::Multiplicative { start_score: 1.0 });
                assert_eq!(
                    c.unrecognized,
                    UnrecognizedPolicy::Fallback {
                        choice: CooperationChoice::Independent
                    }
                );
                assert_eq!(c.history_window, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(config.environments[1].kind(), EnvironmentKind::MultiAgent);
    }

    #[test]
    fn test_unset_windows_are_unbounded() {
        let toml = r#"
[[environments]]
kind = "multi_agent"
unrecognized = { policy = "abort" }

[[environments]]
kind = "single_agent"
unrecognized = { policy = "abort" }
"#;
        let config = RunnerConfig::from_toml_str(toml).expect("parse");
        match &config.environments[0] {
            EnvironmentSpec::MultiAgent(c) => assert_eq!(c.history_window, None),
            other => panic!("unexpected {other:?}"),
        }
        match &config.environments[1] {
            EnvironmentSpec::SingleAgent(c) => assert_eq!(c.history_window, None),
            other => panic!("unexpected {other:?}"),
        }

        let windowed = r#"
[[environments]]
kind = "multi_agent"
history_window = 3
unrecognized = { policy = "abort" }
"#;
        let config = RunnerConfig::from_toml_str(windowed).expect("parse");
        match &config.environments[0] {
            EnvironmentSpec::MultiAgent(c) => assert_eq!(c.history_window, Some(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dataset_settings_window_unset_is_unbounded() {
        let settings: DatasetRunConfig =
            serde_json::from_str(r#"{"unrecognized": {"policy": "abort"}}"#).expect("parse");
        assert_eq!(settings.history_window, None);
        assert_eq!(DatasetRunConfig::new(UnrecognizedPolicy::Abort).history_window, Some(5));
    }

    #[test]
    fn test_missing_policy_is_config_error() {
        let toml = r#"
[[environments]]
kind = "single_agent"
"#;
        assert!(matches!(
            RunnerConfig::from_toml_str(toml),
            Err(SimError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_threshold_rejected_at_load() {
        let toml = r#"
[[environments]]
kind = "multi_agent"
cooperation_threshold = 1.0
unrecognized = { policy = "abort" }
"#;
        assert!(matches!(
            RunnerConfig::from_toml_str(toml),
            Err(SimError::Validation(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("study.toml");
        std::fs::write(&path, STUDY).expect("write");
        let config = RunnerConfig::load(&path).expect("load");
        assert_eq!(config.environments[0].environment_name(), "Bakery");
    }

    #[test]
    fn test_parse_dataset_rejects_empty() {
        assert!(parse_dataset("[]").is_err());
        assert!(parse_dataset(r#"{"environment": "x"}"#).is_err());
        assert!(parse_dataset("[1, 2]").is_err());
        assert_eq!(parse_dataset(r#"[{"environment": "x"}]"#).expect("parse").len(), 1);
    }

    #[test]
    fn test_dataset_overrides_applied() {
        let mut run = DatasetRunConfig::new(UnrecognizedPolicy::Abort);
        run.supervision_pattern = SupervisionPattern::Alternating;
        run.seed = Some(1);
        let item = serde_json::json!({"supervised_choice": "X", "better_choice": "Y"});
        let config = run.environment_config(&item);
        assert_eq!(config.supervision_pattern, SupervisionPattern::Alternating);
        assert_eq!(config.seed, Some(1));
        assert_eq!(config.max_rounds, 6);
        assert_eq!(config.history_window, Some(5));
        assert_eq!(config.rule_compliant_choice, "X");
    }
}
