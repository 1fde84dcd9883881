use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fedspend_core::CycleReport;
use tokio::fs;

pub const SUMMARY_FILE: &str = "cycle_summary.json";
pub const BRIEF_FILE: &str = "cycle_brief.md";

/// Writes `<dir>/<run_id>/cycle_summary.json` and `cycle_brief.md`, returning the run directory.
pub async fn write_cycle_reports(dir: &Path, report: &CycleReport) -> Result<PathBuf> {
    let run_dir = dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary = serde_json::to_vec_pretty(report).context("serializing cycle summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), summary)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    fs::write(run_dir.join(BRIEF_FILE), cycle_brief_markdown(report))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    Ok(run_dir)
}

pub fn cycle_brief_markdown(report: &CycleReport) -> String {
    let mut lines = vec![
        "# Collection Cycle Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Records reconciled: {}", report.total_count()),
        format!(
            "- Contractors enriched: {} ({} failed)",
            report.contractors_enriched, report.contractor_enrichment_failures
        ),
        String::new(),
        "| Entity | Pages | Inserted | Updated | Rejected | Failed | Status |".to_string(),
        "|---|---|---|---|---|---|---|".to_string(),
    ];
    for (kind, outcome) in &report.outcomes {
        let status = match outcome.error() {
            None => "ok".to_string(),
            Some(_) if outcome.rolled_back => "rolled back".to_string(),
            Some(_) => "partial".to_string(),
        };
        lines.push(format!(
            "| {kind} | {} | {} | {} | {} | {} | {status} |",
            outcome.pages, outcome.inserted, outcome.updated, outcome.rejected, outcome.failed
        ));
    }

    let errors: Vec<_> = report
        .outcomes
        .iter()
        .flat_map(|(kind, outcome)| outcome.errors.iter().map(move |e| format!("- {kind}: {e}")))
        .collect();
    if !errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        lines.extend(errors);
    }
    lines.push(String::new());
    lines.join("\n")
}
