//! Reward drift experiment launcher.
//!
//! The `drift` command runs studies described in TOML and inspects the
//! history artifacts they leave behind.
//!
//! ## Commands
//!
//! - `run`: run every environment of a study config
//! - `run-dataset`: one single-agent run per scenario of a JSON dataset
//! - `analyze`: recompute drift metrics from an exported history
//! - `verify`: check an exported history against its digest and invariants

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use drift_core::analysis::analyze;
use drift_core::reporting::{
    render_comparison_md, render_violation_probs, write_comparison_md, write_dataset_report_json,
};
use drift_core::{
    read_export_path, Agent, AgentBinding, AgentRoster, ComplianceChoice, DatasetRunConfig,
    EnvironmentSpec, ExperimentRunner, FixedChoiceAgent, RandomChoiceAgent, RoundRecord,
    RunnerConfig, ScriptedAgent, SupervisionPattern, UnrecognizedPolicy,
};

#[derive(Parser)]
#[command(name = "drift")]
#[command(version = drift_core::VERSION)]
#[command(about = "Reward drift experiments for LLM agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every environment in a study config
    Run {
        /// Study config (TOML)
        config: PathBuf,

        /// Agent driving every environment: `random[:seed]`, `always:<label>`
        /// or `script:<path>`
        #[arg(short, long, default_value = "random")]
        agent: String,

        /// Override the config's output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run one single-agent environment per dataset scenario
    RunDataset {
        /// Dataset file: a JSON array of scenario objects
        dataset: PathBuf,

        #[arg(short, long, default_value = "random")]
        agent: String,

        /// Rounds per scenario
        #[arg(long, default_value_t = 6)]
        rounds: u64,

        /// Previous rounds shown to the agent (0 hides history, omit for all)
        #[arg(long)]
        window: Option<usize>,

        /// Supervision pattern, e.g. `all_unsupervised` or `alternating`
        #[arg(long, default_value = "all_unsupervised")]
        pattern: String,

        #[arg(long)]
        seed: Option<u64>,

        /// Unrecognized-response policy: `abort`, `fallback:<choice>` or
        /// `retry:<attempts>[:<choice>]`
        #[arg(long)]
        policy: String,

        /// Match bare keywords when no structured choice is found
        #[arg(long)]
        keyword_fallback: bool,

        /// Where to write the dataset report (JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory for per-scenario history artifacts
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
    },

    /// Recompute drift metrics from an exported history
    Analyze {
        /// Path to a `history.json` artifact
        artifact: PathBuf,

        /// Trailing window in rounds (whole run when omitted)
        #[arg(short, long)]
        window: Option<usize>,
    },

    /// Verify an exported history against its digest and invariants
    Verify {
        /// Path to a `history.json` artifact
        artifact: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    drift_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            agent,
            output,
        } => cmd_run(&config, &agent, output).await,
        Commands::RunDataset {
            dataset,
            agent,
            rounds,
            window,
            pattern,
            seed,
            policy,
            keyword_fallback,
            output,
            artifacts_dir,
        } => {
            let mut settings = DatasetRunConfig::new(parse_policy(&policy)?);
            settings.max_rounds = rounds;
            settings.history_window = window;
            settings.supervision_pattern = parse_pattern(&pattern)?;
            settings.seed = seed;
            settings.keyword_fallback = keyword_fallback;
            cmd_run_dataset(
                &dataset,
                &agent,
                &settings,
                output.as_deref(),
                artifacts_dir,
            )
            .await
        }
        Commands::Analyze { artifact, window } => cmd_analyze(&artifact, window),
        Commands::Verify { artifact } => cmd_verify(&artifact),
    }
}

/// Build an agent from a command-line spec.
///
/// `labels` are the environment's choice labels, used by `random`.
fn parse_agent<R: RoundRecord + 'static>(spec: &str, labels: &[&str]) -> Result<Arc<dyn Agent<R>>> {
    let (kind, arg) = match spec.split_once(':') {
        Some((kind, arg)) => (kind, Some(arg)),
        None => (spec, None),
    };
    match (kind, arg) {
        ("random", seed) => {
            let seed = match seed {
                Some(s) => s
                    .parse::<u64>()
                    .with_context(|| format!("Invalid random agent seed: {s}"))?,
                None => 0,
            };
            let labels = labels.iter().map(|l| l.to_string()).collect();
            Ok(Arc::new(RandomChoiceAgent::new(labels, seed)))
        }
        ("always", Some(label)) if !label.is_empty() => Ok(Arc::new(FixedChoiceAgent::new(label))),
        ("script", Some(path)) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read agent script: {path}"))?;
            let responses: Vec<String> = content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect();
            if responses.is_empty() {
                anyhow::bail!("Agent script {path} has no responses");
            }
            Ok(Arc::new(ScriptedAgent::cycling(responses)))
        }
        _ => anyhow::bail!(
            "Unknown agent spec '{spec}' (expected random[:seed], always:<label> or script:<path>)"
        ),
    }
}

fn parse_choice(s: &str) -> Result<ComplianceChoice> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .with_context(|| format!("Unknown choice '{s}' (expected compliant or violating)"))
}

fn parse_policy(s: &str) -> Result<UnrecognizedPolicy<ComplianceChoice>> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        ["abort"] => Ok(UnrecognizedPolicy::Abort),
        ["fallback", choice] => Ok(UnrecognizedPolicy::Fallback {
            choice: parse_choice(choice)?,
        }),
        ["retry", attempts, rest @ ..] if rest.len() <= 1 => {
            let attempts = attempts
                .parse::<u32>()
                .with_context(|| format!("Invalid retry attempts: {attempts}"))?;
            let fallback = rest.first().map(|choice| parse_choice(choice)).transpose()?;
            Ok(UnrecognizedPolicy::Retry { attempts, fallback })
        }
        _ => anyhow::bail!(
            "Unknown policy '{s}' (expected abort, fallback:<choice> or retry:<attempts>[:<choice>])"
        ),
    }
}

fn parse_pattern(s: &str) -> Result<SupervisionPattern> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .with_context(|| format!("Unknown supervision pattern '{s}'"))
}

async fn cmd_run(config_path: &Path, agent: &str, output: Option<PathBuf>) -> Result<()> {
    let mut config = RunnerConfig::load(config_path)
        .with_context(|| format!("Failed to load study config {:?}", config_path))?;
    if output.is_some() {
        config.output_dir = output;
    }
    if config.environments.is_empty() {
        anyhow::bail!("Study config {:?} has no environments", config_path);
    }

    let specs = config.environments.clone();
    let output_dir = config.output_dir.clone();
    let mut runner = ExperimentRunner::new(config)?;

    for spec in &specs {
        let binding = match spec {
            EnvironmentSpec::SingleAgent(c) => AgentBinding::Single(parse_agent(
                agent,
                &[c.rule_compliant_choice.as_str(), c.rule_violating_choice.as_str()],
            )?),
            EnvironmentSpec::MultiAgent(c) => AgentBinding::Multi(AgentRoster::Shared(
                parse_agent(
                    agent,
                    &[c.collective_choice.as_str(), c.independent_choice.as_str()],
                )?,
            )),
        };
        let result = runner
            .run_spec(spec, &binding)
            .await
            .with_context(|| format!("Environment {} did not start", spec.environment_name()))?;
        info!(
            event = "cli.environment_done",
            environment = %result.environment_name,
            run_id = %result.run_id,
            "environment done"
        );
    }

    let summary = runner.comparative_summary();
    match output_dir {
        Some(dir) => {
            let path = dir.join("comparison.md");
            write_comparison_md(&path, &summary)?;
            println!("Comparison written to {:?}", path);
        }
        None => print!("{}", render_comparison_md(&summary)),
    }
    Ok(())
}

async fn cmd_run_dataset(
    dataset: &Path,
    agent: &str,
    settings: &DatasetRunConfig,
    output: Option<&Path>,
    artifacts_dir: Option<PathBuf>,
) -> Result<()> {
    let items = drift_core::load_dataset(dataset)
        .with_context(|| format!("Failed to load dataset {:?}", dataset))?;

    // Every item shares one agent; labels come from the first scenario.
    let first = settings.environment_config(&items[0]);
    let agent = parse_agent(
        agent,
        &[first.rule_compliant_choice.as_str(), first.rule_violating_choice.as_str()],
    )?;

    let mut runner = ExperimentRunner::new(RunnerConfig {
        output_dir: artifacts_dir,
        ..RunnerConfig::default()
    })?;
    let report = runner
        .run_single_dataset(&items, settings, agent.as_ref())
        .await
        .context("Dataset run did not start")?;

    print!("{}", render_violation_probs(&report));
    if let Some(path) = output {
        write_dataset_report_json(path, &report)?;
        println!("Report written to {:?}", path);
    }
    Ok(())
}

fn cmd_analyze(artifact: &Path, window: Option<usize>) -> Result<()> {
    let export = read_export_path(artifact)
        .with_context(|| format!("Failed to read artifact {:?}", artifact))?;
    let analysis = analyze(&export, window);
    let json = serde_json::to_string_pretty(&analysis).context("serialize analysis")?;
    println!("{}", json);
    Ok(())
}

fn cmd_verify(artifact: &Path) -> Result<()> {
    let export = read_export_path(artifact)
        .with_context(|| format!("Verification failed for {:?}", artifact))?;
    println!(
        "Verified {} ({}): {} rounds, total reward {}",
        export.environment_name(),
        export.kind(),
        export.total_rounds(),
        export.total_reward()
    );
    println!("Digest: {}", export.digest()?);
    Ok(())
}
