//! Per-run JSON reports and Markdown digests.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use pricelog_feed::RecordError;
use pricelog_storage::FeedSource;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::classifier::ClassifyOutcome;
use crate::error::{ImportError, Phase};
use crate::loader::StageOutcome;
use crate::reconciler::ReconcileOutcome;
use crate::registrar::RegisterOutcome;

pub const REPORT_FILE: &str = "import_report.json";
pub const SUMMARY_FILE: &str = "summary.md";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub source: FeedSource,
    pub feed_date: NaiveDate,
    pub rows_seen: u64,
    pub rows_staged: u64,
    pub rows_skipped: u64,
    pub degraded_fields: u64,
    pub error_sample: Vec<RecordError>,
    pub bytes_read: u64,
    pub feed_sha256: String,
    pub products_created: u64,
    pub history_appended: u64,
    pub history_unchanged: u64,
    pub duplicate_rows: u64,
    pub tags_cleared: u64,
    pub tags_assigned: u64,
    pub best: u64,
    pub good: u64,
}

impl ImportReport {
    pub fn assemble(
        run_id: Uuid,
        source: FeedSource,
        feed_date: NaiveDate,
        staged: StageOutcome,
        registered: RegisterOutcome,
        reconciled: ReconcileOutcome,
        classified: ClassifyOutcome,
    ) -> Self {
        Self {
            run_id,
            source,
            feed_date,
            rows_seen: staged.parse.rows_seen,
            rows_staged: staged.rows_staged,
            rows_skipped: staged.parse.rows_skipped,
            degraded_fields: staged.parse.degraded_fields,
            error_sample: staged.parse.error_sample,
            bytes_read: staged.bytes_read,
            feed_sha256: staged.feed_sha256,
            products_created: registered.products_created,
            history_appended: reconciled.history_appended,
            history_unchanged: reconciled.unchanged,
            duplicate_rows: reconciled.duplicate_rows,
            tags_cleared: classified.tags_cleared,
            tags_assigned: classified.tags_assigned,
            best: classified.best,
            good: classified.good,
        }
    }

    pub fn tags_changed(&self) -> u64 {
        self.tags_cleared + self.tags_assigned
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded { report: ImportReport },
    Failed { phase: Phase, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub source: FeedSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

impl RunRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded { .. })
    }
}

pub fn render_summary_markdown(record: &RunRecord) -> String {
    let mut lines = vec![
        format!("# Import run `{}`", record.run_id),
        String::new(),
        format!("- Source: {}", record.source),
        format!("- Started: {}", record.started_at),
        format!("- Finished: {}", record.finished_at),
    ];
    match &record.outcome {
        RunOutcome::Succeeded { report } => {
            lines.push("- Status: succeeded".to_string());
            lines.push(format!("- Feed date: {}", report.feed_date));
            lines.push(String::new());
            lines.push("## Counts".to_string());
            lines.push(format!("- rows seen: {}", report.rows_seen));
            lines.push(format!("- rows staged: {}", report.rows_staged));
            lines.push(format!("- rows skipped: {}", report.rows_skipped));
            lines.push(format!("- products created: {}", report.products_created));
            lines.push(format!("- history appended: {}", report.history_appended));
            lines.push(format!("- duplicate rows ignored: {}", report.duplicate_rows));
            lines.push(format!("- tags changed: {}", report.tags_changed()));
            lines.push(format!("- best / good: {} / {}", report.best, report.good));
            lines.push(format!("- feed sha256: `{}`", report.feed_sha256));
            if !report.error_sample.is_empty() {
                lines.push(String::new());
                lines.push("## Skipped records".to_string());
                lines.extend(report.error_sample.iter().map(|err| format!("- {err}")));
            }
        }
        RunOutcome::Failed { phase, reason } => {
            lines.push(format!("- Status: failed during {phase}"));
            lines.push(format!("- Reason: {reason}"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<reports_dir>/<run_id>/import_report.json` and its Markdown summary.
pub async fn write_run_report(reports_dir: &Path, record: &RunRecord) -> Result<PathBuf, ImportError> {
    write_files(reports_dir, record).await.map_err(ImportError::Report)
}

async fn write_files(reports_dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    let run_dir = reports_dir.join(record.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(record).context("serializing import report")?;
    fs::write(run_dir.join(REPORT_FILE), json)
        .await
        .with_context(|| format!("writing {REPORT_FILE}"))?;
    fs::write(run_dir.join(SUMMARY_FILE), render_summary_markdown(record))
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    Ok(run_dir)
}

pub fn report_recent_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut records = Vec::new();
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path().join(REPORT_FILE);
        if !path.is_file() {
            continue;
        }
        let record: RunRecord = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        records.push(record);
    }
    records.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));

    let mut lines = vec!["# Recent price imports".to_string(), String::new()];
    for record in records.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", record.run_id));
        lines.push(format!("- source: {}", record.source));
        lines.push(format!("- finished: {}", record.finished_at));
        match &record.outcome {
            RunOutcome::Succeeded { report } => {
                lines.push(format!(
                    "- succeeded: {} products created, {} history rows, {} tags changed",
                    report.products_created,
                    report.history_appended,
                    report.tags_changed()
                ));
                lines.push(format!(
                    "- rows: {} seen, {} skipped",
                    report.rows_seen, report.rows_skipped
                ));
            }
            RunOutcome::Failed { phase, reason } => {
                lines.push(format!("- failed during {phase}: {reason}"));
            }
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn failed(minute: u32, reason: &str) -> RunRecord {
        let at = Utc.with_ymd_and_hms(2025, 7, 1, 20, minute, 0).unwrap();
        RunRecord {
            run_id: Uuid::new_v4(),
            source: FeedSource::url("http://feed.example/daily.csv"),
            started_at: at,
            finished_at: at,
            outcome: RunOutcome::Failed {
                phase: Phase::Fetch,
                reason: reason.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn reports_round_trip_and_digest_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let older = failed(1, "http status 503");
        let newer = failed(9, "http status 404");
        write_run_report(dir.path(), &older).await.unwrap();
        let run_dir = write_run_report(dir.path(), &newer).await.unwrap();

        let stored: RunRecord =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join(REPORT_FILE)).unwrap())
                .unwrap();
        assert_eq!(stored, newer);
        assert!(run_dir.join(SUMMARY_FILE).is_file());

        let digest = report_recent_markdown(dir.path(), 1).unwrap();
        assert!(digest.contains("404"));
        assert!(!digest.contains("503"));
    }

    #[test]
    fn failed_summary_names_the_phase() {
        let summary = render_summary_markdown(&failed(0, "timeout"));
        assert!(summary.contains("failed during fetch"));
        assert!(summary.contains("timeout"));
    }
}
