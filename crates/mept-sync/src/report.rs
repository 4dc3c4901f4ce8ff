//! Markdown briefs for a single run and for the most recent runs.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mept_core::{ChangeReport, CycleDiagnostics, MatchCluster};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const BRIEF_TOP_N: usize = 10;

/// `run.json` written next to the change report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stores: Vec<String>,
    pub diagnostics: CycleDiagnostics,
    pub cluster_count: usize,
}

pub fn daily_brief(run: &RunRecord, report: &ChangeReport, clusters: &[MatchCluster]) -> String {
    let mut lines = vec![
        "# Malta Electronics Price Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at.to_rfc3339()),
        format!("- Finished: {}", run.finished_at.to_rfc3339()),
        format!("- Stores: {}", run.stores.join(", ")),
        format!(
            "- Listings: {} accepted of {} scraped ({} dropped)",
            run.diagnostics.accepted,
            run.diagnostics.raw_received,
            run.diagnostics.dropped()
        ),
        format!("- Cross-store matches: {}", run.cluster_count),
        format!(
            "- Changes: {} new, {} removed, {} up, {} down, {} unchanged",
            report.new.len(),
            report.removed.len(),
            report.increased.len(),
            report.decreased.len(),
            report.unchanged_count
        ),
    ];
    if run.diagnostics.state_unreadable {
        lines.push(format!(
            "- **Previous state unreadable, treated as first run:** {}",
            run.diagnostics.state_error.as_deref().unwrap_or("unknown error")
        ));
    }

    if !report.decreased.is_empty() {
        lines.push(String::new());
        lines.push("## Price Drops".to_string());
        for change in report.decreased.iter().take(BRIEF_TOP_N) {
            lines.push(format!(
                "- {} @ {}: €{} → €{} (-€{})",
                change.listing.raw_name,
                change.listing.store,
                change.old_price,
                change.new_price,
                change.delta
            ));
        }
    }

    if !report.increased.is_empty() {
        lines.push(String::new());
        lines.push("## Price Increases".to_string());
        for change in report.increased.iter().take(BRIEF_TOP_N) {
            lines.push(format!(
                "- {} @ {}: €{} → €{} (+€{})",
                change.listing.raw_name,
                change.listing.store,
                change.old_price,
                change.new_price,
                change.delta
            ));
        }
    }

    let mut spreads: Vec<&MatchCluster> = clusters.iter().collect();
    spreads.sort_by(|a, b| {
        b.price_spread()
            .cmp(&a.price_spread())
            .then_with(|| a.match_key.cmp(&b.match_key))
    });
    if !spreads.is_empty() {
        lines.push(String::new());
        lines.push("## Best Prices".to_string());
        for cluster in spreads.into_iter().take(BRIEF_TOP_N) {
            let Some(best) = cluster.best() else { continue };
            let review = if cluster.review_required { " (review)" } else { "" };
            lines.push(format!(
                "- `{}`: €{} at {} across {} stores, spread €{}{}",
                cluster.match_key,
                best.price,
                best.store,
                cluster.distinct_stores(),
                cluster.price_spread(),
                review
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Summarize the `runs` most recent run directories under `reports_root`.
pub fn report_daily_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("run.json").exists())
        .filter_map(|entry| {
            let path = entry.path();
            let text = std::fs::read_to_string(path.join("run.json")).ok()?;
            let run: RunRecord = serde_json::from_str(&text).ok()?;
            Some((run, path))
        })
        .collect::<Vec<_>>();
    dirs.sort_by(|a, b| b.0.finished_at.cmp(&a.0.finished_at));

    let mut lines = vec!["# Price Tracker Report".to_string(), String::new()];
    for (run, dir) in dirs.into_iter().take(runs.max(1)) {
        let report_path = dir.join("change_report.json");
        let report: ChangeReport = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        lines.push(format!("## Run `{}` ({})", run.run_id, run.finished_at.to_rfc3339()));
        lines.push(format!("- listings: {}", run.diagnostics.accepted));
        lines.push(format!("- matches: {}", run.cluster_count));
        lines.push(format!(
            "- new / removed / up / down: {} / {} / {} / {}",
            report.new.len(),
            report.removed.len(),
            report.increased.len(),
            report.decreased.len()
        ));
        if run.diagnostics.state_unreadable {
            lines.push("- previous state was unreadable".to_string());
        }
        lines.push(format!("- change report: `{}`", report_path.display()));
        let brief = dir.join("daily_brief.md");
        if brief.exists() {
            lines.push(format!("- daily brief: `{}`", brief.display()));
        }
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
