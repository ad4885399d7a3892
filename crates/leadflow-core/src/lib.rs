//! Core row model, job lifecycle and run statistics for leadflow.

use std::time::Duration;

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadflow-core";

/// Base name of the provenance columns (`keyword`, `keyword_2`, ...).
pub const KEYWORD_COLUMN: &str = "keyword";

/// Flat column -> string record. Columns keep insertion order; reads of an
/// absent column yield the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    values: IndexMap<String, String>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> &str {
        self.values.get(column).map(String::as_str).unwrap_or("")
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.values().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy of this row restricted to `columns`, in that order. Missing columns
    /// are materialized as empty strings.
    pub fn project(&self, columns: &[String]) -> Row {
        let mut out = Row::new();
        for column in columns {
            out.set(column.clone(), self.get(column));
        }
        out
    }

    /// Non-empty provenance keywords in column order.
    pub fn keywords(&self) -> Vec<String> {
        let mut indexed = self
            .values
            .iter()
            .filter_map(|(k, v)| keyword_column_index(k).map(|idx| (idx, v.trim())))
            .filter(|(_, v)| !v.is_empty())
            .collect::<Vec<_>>();
        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, v)| v.to_string()).collect()
    }

    /// Replace every provenance column with `keywords`, one column each.
    pub fn set_keywords<S: AsRef<str>>(&mut self, keywords: &[S]) {
        self.values.retain(|k, _| keyword_column_index(k).is_none());
        for (idx, keyword) in keywords.iter().enumerate() {
            self.set(keyword_column_name(idx), keyword.as_ref());
        }
    }

    /// Add `keyword` to the provenance columns unless already present.
    pub fn add_keyword(&mut self, keyword: &str) {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return;
        }
        let mut current = self.keywords();
        if current.iter().any(|k| k == keyword) {
            return;
        }
        current.push(keyword.to_string());
        self.set_keywords(&current);
    }
}

impl FromIterator<(String, String)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// `0 -> keyword`, `1 -> keyword_2`, `2 -> keyword_3`, ...
pub fn keyword_column_name(index: usize) -> String {
    if index == 0 {
        KEYWORD_COLUMN.to_string()
    } else {
        format!("{KEYWORD_COLUMN}_{}", index + 1)
    }
}

/// Inverse of [`keyword_column_name`].
pub fn keyword_column_index(column: &str) -> Option<usize> {
    if column == KEYWORD_COLUMN {
        return Some(0);
    }
    let suffix = column.strip_prefix("keyword_")?;
    match suffix.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n - 1),
        _ => None,
    }
}

/// Provenance header columns wide enough for the row with the most keywords.
pub fn keyword_columns<'a>(rows: impl IntoIterator<Item = &'a Row>) -> Vec<String> {
    let width = rows
        .into_iter()
        .flat_map(|row| row.columns().filter_map(keyword_column_index))
        .map(|idx| idx + 1)
        .max()
        .unwrap_or(0);
    (0..width).map(keyword_column_name).collect()
}

/// Render a JSON scalar the way it is shown in a cell; containers become
/// compact JSON.
pub fn stringify_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Flatten a nested record into `a/b/0/c` paths. Nulls keep their path with an
/// empty value; empty containers contribute nothing.
pub fn flatten_record(value: &JsonValue) -> Row {
    let mut out = Row::new();
    flatten_into(value, "", &mut out);
    out
}

fn flatten_into(value: &JsonValue, prefix: &str, out: &mut Row) {
    match value {
        JsonValue::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                flatten_into(item, &join_path(prefix, &idx.to_string()), out);
            }
        }
        JsonValue::Object(map) => {
            for (key, item) in map {
                flatten_into(item, &join_path(prefix, key), out);
            }
        }
        scalar => {
            if !prefix.is_empty() {
                out.set(prefix, stringify_value(scalar));
            }
        }
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}/{segment}")
    }
}

/// One column per top-level key; nested values are kept as compact JSON.
pub fn stringify_record(value: &JsonValue) -> Row {
    match value {
        JsonValue::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), stringify_value(v)))
            .collect(),
        _ => Row::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    PendingRetry,
    Starting,
    Running,
    Succeeded,
    Aborted,
    Failed,
}

impl JobStatus {
    /// Holds a concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Pending | Self::PendingRetry)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Aborted | Self::Failed)
    }
}

/// Per-keyword acquisition job. Mutated only by the scheduler, always by
/// whole-record replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordJob {
    pub id: Uuid,
    pub keyword: String,
    pub status: JobStatus,
    pub remote_run_id: Option<String>,
    pub remote_dataset_id: Option<String>,
    pub retry_count: u32,
    /// Offset from scheduler start at which the current attempt was launched.
    pub started_at: Option<Duration>,
    pub item_count: u64,
    pub violation_streak: u32,
    pub last_observed_date: Option<NaiveDate>,
    pub fail_reason: Option<String>,
    pub export_queued: bool,
}

impl KeywordJob {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            keyword: keyword.into(),
            status: JobStatus::Pending,
            remote_run_id: None,
            remote_dataset_id: None,
            retry_count: 0,
            started_at: None,
            item_count: 0,
            violation_streak: 0,
            last_observed_date: None,
            fail_reason: None,
            export_queued: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub pending_retry: usize,
    pub active: usize,
    pub succeeded: usize,
    pub aborted: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn tally<'a>(jobs: impl IntoIterator<Item = &'a KeywordJob>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::PendingRetry => counts.pending_retry += 1,
                JobStatus::Starting | JobStatus::Running => counts.active += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Aborted => counts.aborted += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn unsettled(&self) -> usize {
        self.pending + self.pending_retry + self.active
    }
}

/// Per-stage counters of one run. Kept even when a stage aborts the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub keywords: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub jobs_aborted: usize,
    pub input_rows: usize,
    pub dedup_removed: usize,
    pub purifier_removed: usize,
    pub category_filter_removed: usize,
    pub filtered_rows: usize,
    pub urls_extracted: usize,
    pub batches_total: usize,
    pub batches_succeeded: usize,
    pub batches_failed: usize,
    pub enriched_items: usize,
    pub mobile: usize,
    pub landline: usize,
    pub other: usize,
}

impl PipelineStats {
    pub fn after_dedup(&self) -> usize {
        self.input_rows.saturating_sub(self.dedup_removed)
    }

    pub fn after_purify(&self) -> usize {
        self.after_dedup().saturating_sub(self.purifier_removed)
    }

    pub fn filtered_out(&self) -> usize {
        self.dedup_removed + self.purifier_removed + self.category_filter_removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_uses_slash_paths_and_indexes() {
        let row = flatten_record(&json!({
            "ad_archive_id": 42,
            "snapshot": {
                "page_categories": ["Electrician", "Plumber"],
                "body": { "text": "hello" },
                "title": null
            },
            "publisher_platform": [],
            "active": true
        }));

        assert_eq!(row.get("ad_archive_id"), "42");
        assert_eq!(row.get("snapshot/page_categories/0"), "Electrician");
        assert_eq!(row.get("snapshot/page_categories/1"), "Plumber");
        assert_eq!(row.get("snapshot/body/text"), "hello");
        assert!(row.contains_column("snapshot/title"));
        assert_eq!(row.get("snapshot/title"), "");
        assert!(!row.contains_column("publisher_platform"));
        assert_eq!(row.get("active"), "true");
    }

    #[test]
    fn stringify_record_keeps_nested_values_as_json() {
        let row = stringify_record(&json!({
            "title": "Sparky Co",
            "likes": 12,
            "info": ["a", "b"],
            "phone": null
        }));
        assert_eq!(row.get("title"), "Sparky Co");
        assert_eq!(row.get("likes"), "12");
        assert_eq!(row.get("info"), r#"["a","b"]"#);
        assert_eq!(row.get("phone"), "");
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["title", "likes", "info", "phone"]);
    }

    #[test]
    fn keyword_columns_round_trip_names() {
        assert_eq!(keyword_column_name(0), "keyword");
        assert_eq!(keyword_column_name(2), "keyword_3");
        assert_eq!(keyword_column_index("keyword"), Some(0));
        assert_eq!(keyword_column_index("keyword_2"), Some(1));
        assert_eq!(keyword_column_index("keyword_x"), None);
        assert_eq!(keyword_column_index("keyword_0"), None);
    }

    #[test]
    fn add_keyword_unions_without_duplicates() {
        let mut row = Row::new();
        row.set("page_name", "Acme");
        row.add_keyword("x");
        row.add_keyword("y");
        row.add_keyword("x");
        assert_eq!(row.keywords(), vec!["x", "y"]);
        assert_eq!(row.get("keyword_2"), "y");
        assert_eq!(keyword_columns([&row]), vec!["keyword", "keyword_2"]);
    }

    #[test]
    fn project_materializes_missing_columns() {
        let mut row = Row::new();
        row.set("b", "2");
        row.set("extra", "z");
        let projected = row.project(&["a".to_string(), "b".to_string()]);
        assert_eq!(projected.columns().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(projected.get("a"), "");
        assert_eq!(projected.get("b"), "2");
    }

    #[test]
    fn job_counts_group_active_statuses() {
        let mut jobs = vec![KeywordJob::new("a"), KeywordJob::new("b"), KeywordJob::new("c")];
        jobs[1].status = JobStatus::Starting;
        jobs[2].status = JobStatus::Failed;
        let counts = JobCounts::tally(&jobs);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.unsettled(), 2);
    }
}
