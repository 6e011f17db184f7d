use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};

use crate::environment::EnvironmentExport;
use crate::error::{Result, SimError};
use crate::runner::{ComparativeSummary, DatasetReport};

const ARTIFACT_FILE: &str = "history.json";
const DIGEST_FILE: &str = "history.digest";

/// SHA-256 hex digest of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write `<dir>/<run_id>/history.json` and its `history.digest`.
///
/// Returns the artifact path and digest.
pub fn write_export_artifact(
    export: &EnvironmentExport,
    run_id: &str,
    dir: &Path,
) -> Result<(PathBuf, String)> {
    let run_dir = dir.join(run_id);
    std::fs::create_dir_all(&run_dir)?;

    let artifact_path = run_dir.join(ARTIFACT_FILE);
    let digest_path = run_dir.join(DIGEST_FILE);
    let json = export.to_canonical_bytes()?;
    let digest = content_digest(&json);

    std::fs::write(&artifact_path, &json)?;
    std::fs::write(&digest_path, digest.as_bytes())?;

    Ok((artifact_path, digest))
}

/// Read and verify `<dir>/<run_id>/history.json`.
pub fn read_export_artifact(run_id: &str, dir: &Path) -> Result<EnvironmentExport> {
    read_export_path(&dir.join(run_id).join(ARTIFACT_FILE))
}

/// Read an export artifact, check it against the digest file beside it and
/// re-validate its history.
pub fn read_export_path(artifact_path: &Path) -> Result<EnvironmentExport> {
    let digest_path = artifact_path.with_file_name(DIGEST_FILE);

    let json = std::fs::read(artifact_path)?;
    let digest = std::fs::read_to_string(&digest_path)?;
    let actual = content_digest(&json);
    if digest.trim() != actual {
        return Err(SimError::DigestMismatch {
            expected: digest.trim().to_string(),
            actual,
        });
    }

    let export: EnvironmentExport = serde_json::from_slice(&json)?;
    export.verify()?;
    Ok(export)
}

fn fmt_signal(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.3}")).unwrap_or_else(|| "n/a".to_string())
}

/// Render markdown comparison table.
pub fn render_comparison_md(summary: &ComparativeSummary) -> String {
    let mut out = String::new();
    out.push_str("# Comparative Summary\n\n");
    out.push_str(&format!(
        "Generated at {} by drift-core {}\n\n",
        summary.generated_at.to_rfc3339(),
        crate::VERSION
    ));

    if summary.rows.is_empty() {
        out.push_str("_No runs._\n");
        return out;
    }

    out.push_str("| environment | kind | status | rounds | total reward | avg reward | signal |\n");
    out.push_str("|---|---|---|---|---|---|---|\n");
    for row in &summary.rows {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {:.2} | {:.2} | {} |\n",
            row.environment_name,
            row.kind,
            row.status,
            row.total_rounds,
            row.total_reward,
            row.average_reward,
            fmt_signal(row.signal),
        ));
    }
    out.push_str(
        "\nSignal: reward camouflage for single-agent runs, cooperation success rate for multi-agent runs.\n",
    );
    out
}

/// Write the comparison markdown.
pub fn write_comparison_md(path: &Path, summary: &ComparativeSummary) -> anyhow::Result<()> {
    let md = render_comparison_md(summary);
    std::fs::write(path, md).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Write a dataset report as pretty JSON.
pub fn write_dataset_report_json(path: &Path, report: &DatasetReport) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize dataset report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// One line per round: `p_r1, p_r2, ...` as percentages.
pub fn render_violation_probs(report: &DatasetReport) -> String {
    let header: Vec<String> = (1..=report.violation_probs_by_round.len())
        .map(|i| format!("p_r{i}"))
        .collect();
    let values: Vec<String> = report
        .violation_probs_by_round
        .iter()
        .map(|p| format!("{:.2}", p * 100.0))
        .collect();
    format!("{}\n{}\n", header.join(", "), values.join(", "))
}
