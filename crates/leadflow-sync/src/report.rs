//! Per-run report files under `reports/{run_id}/`.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use leadflow_core::{JobCounts, KeywordJob, PipelineStats};
use leadflow_storage::{OutputStore, StoredOutput};
use serde::Serialize;
use uuid::Uuid;

use crate::batch::BatchOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputRecord {
    pub kind: String,
    pub file_name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
    pub unchanged: bool,
}

impl OutputRecord {
    pub fn from_stored(kind: &str, stored: &StoredOutput) -> Self {
        Self {
            kind: kind.to_string(),
            file_name: stored.file_name.clone(),
            path: stored.absolute_path.clone(),
            sha256: stored.content_hash.clone(),
            bytes: stored.byte_size,
            unchanged: stored.unchanged,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub keywords: Vec<String>,
    pub job_counts: JobCounts,
    pub jobs: Vec<KeywordJob>,
    pub batches: Vec<BatchOutcome>,
    pub stats: PipelineStats,
    pub outputs: Vec<OutputRecord>,
}

impl RunSummary {
    pub fn output(&self, kind: &str) -> Option<&OutputRecord> {
        self.outputs.iter().find(|o| o.kind == kind)
    }
}

pub fn report_dir(run_id: Uuid) -> PathBuf {
    PathBuf::from("reports").join(run_id.to_string())
}

/// Markdown digest of a run: stage funnel, job outcomes and outputs.
pub fn render_brief(summary: &RunSummary) -> String {
    let stats = &summary.stats;
    let outputs = summary
        .outputs
        .iter()
        .map(|o| format!("- {}: `{}` ({} bytes)", o.kind, o.file_name, o.bytes))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Lead Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Keywords: {}\n\n\
         ## Jobs\n- Succeeded: {}\n- Aborted: {}\n- Failed: {}\n\n\
         ## Pipeline\n- Input rows: {}\n- Dedup removed: {}\n- Purifier removed: {}\n\
         - Category filter removed: {}\n- Kept: {}\n- URLs: {}\n- Batches: {} ({} ok, {} failed)\n\
         - Enriched items: {}\n- Mobile / Landline / Other: {} / {} / {}\n\n## Outputs\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.keywords.len(),
        summary.job_counts.succeeded,
        summary.job_counts.aborted,
        summary.job_counts.failed,
        stats.input_rows,
        stats.dedup_removed,
        stats.purifier_removed,
        stats.category_filter_removed,
        stats.filtered_rows,
        stats.urls_extracted,
        stats.batches_total,
        stats.batches_succeeded,
        stats.batches_failed,
        stats.enriched_items,
        stats.mobile,
        stats.landline,
        stats.other,
        outputs,
    )
}

/// Writes `run_summary.json` and `run_brief.md`; returns the summary file.
pub async fn write_run_summary(
    store: &OutputStore,
    summary: &RunSummary,
) -> anyhow::Result<StoredOutput> {
    let dir = report_dir(summary.run_id);
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    let stored = store.store_bytes(dir.join("run_summary.json"), &json).await?;
    store
        .store_bytes(dir.join("run_brief.md"), render_brief(summary).as_bytes())
        .await?;
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> RunSummary {
        let now = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            status: "completed".to_string(),
            keywords: vec!["plumber".into(), "electrician".into()],
            job_counts: JobCounts {
                succeeded: 2,
                ..JobCounts::default()
            },
            jobs: vec![KeywordJob::new("plumber"), KeywordJob::new("electrician")],
            batches: Vec::new(),
            stats: PipelineStats {
                input_rows: 12,
                dedup_removed: 2,
                filtered_rows: 7,
                ..PipelineStats::default()
            },
            outputs: vec![OutputRecord {
                kind: "xlsx".into(),
                file_name: "pipeline_Sorted_2024-03-01.xlsx".into(),
                path: PathBuf::from("/tmp/pipeline_Sorted_2024-03-01.xlsx"),
                sha256: "ab".into(),
                bytes: 2048,
                unchanged: false,
            }],
        }
    }

    #[test]
    fn brief_lists_funnel_and_outputs() {
        let brief = render_brief(&summary());
        assert!(brief.contains("- Input rows: 12"));
        assert!(brief.contains("- Kept: 7"));
        assert!(brief.contains("xlsx: `pipeline_Sorted_2024-03-01.xlsx` (2048 bytes)"));
    }

    #[tokio::test]
    async fn summary_and_brief_land_in_run_report_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OutputStore::new(dir.path());
        let summary = summary();

        let stored = write_run_summary(&store, &summary).await.expect("write");
        let report_dir = dir.path().join("reports").join(summary.run_id.to_string());
        assert_eq!(stored.absolute_path, report_dir.join("run_summary.json"));
        assert!(report_dir.join("run_brief.md").exists());

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&stored.absolute_path).expect("read")).expect("json");
        assert_eq!(json["stats"]["input_rows"], 12);
        assert_eq!(json["jobs"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["outputs"][0]["kind"], "xlsx");
    }
}
