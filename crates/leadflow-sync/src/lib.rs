//! Lead run orchestration: acquisition, row stages, re-scrape, phone sorting
//! and export.

pub mod batch;
pub mod config;
pub mod dates;
pub mod phone;
pub mod pipeline;
pub mod report;
pub mod scheduler;

use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use leadflow_adapters::{ActorClient, ActorError, ApifyClient, DatasetQuery, RunOptions};
use leadflow_archive::{build_csv, build_xlsx, export_file_name, ArchiveError};
use leadflow_core::{keyword_columns, stringify_record, JobCounts, PipelineStats, Row};
use leadflow_storage::{OutputStore, StoredOutput};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use crate::batch::{BatchOutcome, BatchResult, BatchRunner, BatchTiming};
pub use crate::config::{
    parse_keywords, AcquisitionParams, CategoryRules, MatchMode, PipelineSettings, SyncConfig,
};
pub use crate::phone::{ClassifiedRows, PhoneClass, PhoneClassifier};
pub use crate::pipeline::{CategoryFilter, ColumnSpec, RowPipeline, UrlKeywordIndex};
pub use crate::report::{OutputRecord, RunSummary};
pub use crate::scheduler::{
    AcquisitionScheduler, CompletedDataset, SchedulerReport, SchedulerSnapshot, SchedulerState,
    SchedulerTiming,
};

pub const CRATE_NAME: &str = "leadflow-sync";

/// Page size used when draining a succeeded acquisition dataset.
pub const INGEST_PAGE_SIZE: usize = 200;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("stopped by user")]
    Cancelled,
    #[error("no rows left after {stage}")]
    EmptyStage {
        stage: &'static str,
        stats: Box<PipelineStats>,
    },
    #[error(
        "every acquisition job failed ({} failed, {} aborted)",
        .counts.failed,
        .counts.aborted
    )]
    AllJobsFailed { counts: JobCounts },
    #[error("all {total} re-scrape batches failed")]
    AllBatchesFailed {
        total: usize,
        stats: Box<PipelineStats>,
    },
    #[error(transparent)]
    Remote(#[from] ActorError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Io(anyhow::Error),
}

impl PipelineError {
    /// Stage counts computed before the run stopped, when there are any.
    pub fn stats(&self) -> Option<&PipelineStats> {
        match self {
            Self::EmptyStage { stats, .. } | Self::AllBatchesFailed { stats, .. } => Some(stats),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

/// One full lead run against a remote scraping service.
pub struct LeadPipeline {
    config: SyncConfig,
    settings: PipelineSettings,
    filter: CategoryFilter,
    client: Arc<dyn ActorClient>,
    store: OutputStore,
    scheduler_timing: SchedulerTiming,
    batch_timing: BatchTiming,
}

impl LeadPipeline {
    pub fn new(
        config: SyncConfig,
        settings: PipelineSettings,
        filter: CategoryFilter,
        client: Arc<dyn ActorClient>,
    ) -> Self {
        let store = OutputStore::new(config.output_dir.clone());
        Self {
            config,
            settings,
            filter,
            client,
            store,
            scheduler_timing: SchedulerTiming::default(),
            batch_timing: BatchTiming::default(),
        }
    }

    /// HTTP client and category rules from `config`.
    pub fn from_config(config: SyncConfig, settings: PipelineSettings) -> anyhow::Result<Self> {
        let rules = CategoryRules::load(&config.category_rules_path())?;
        let filter = CategoryFilter::new(settings.match_mode, &rules.keywords);
        let client = ApifyClient::new(
            config.api_base.clone(),
            config.api_token.clone(),
            config.http_client_config(),
        )
        .context("building remote actor client")?;
        Ok(Self::new(config, settings, filter, Arc::new(client)))
    }

    pub fn with_timing(mut self, scheduler: SchedulerTiming, batch: BatchTiming) -> Self {
        self.scheduler_timing = scheduler;
        self.batch_timing = batch;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    /// Acquire, filter, re-scrape, sort and export. Cancelling `cancel`
    /// aborts active remote runs and ends the run without outputs.
    pub async fn run_once(
        &self,
        keywords: &[String],
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("lead_run", %run_id, keywords = keywords.len());
        self.run_inner(run_id, keywords, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        keywords: &[String],
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        self.settings.validate()?;
        if self.filter.is_empty() {
            return Err(PipelineError::Configuration(
                "category allow-list is empty".to_string(),
            ));
        }
        let acquisition = &self.settings.acquisition;

        let mut scheduler = AcquisitionScheduler::new(
            self.client.clone(),
            self.config.bulk_actor.clone(),
            acquisition.clone(),
            keywords,
        )?
        .with_timing(self.scheduler_timing)
        .with_run_options(acquisition.run_options(self.config.actor_memory_mb));
        let mut rows = RowPipeline::new(
            ColumnSpec::from_settings(&self.settings),
            self.filter.clone(),
        );

        // A failing consumer stops acquisition through the child token
        // without touching the caller's token.
        let stage = cancel.child_token();
        let (handoff, datasets) = mpsc::unbounded_channel();
        let (scheduled, ingested) = tokio::join!(
            scheduler.run(handoff, &stage),
            ingest_datasets(self.client.as_ref(), datasets, &mut rows, &stage),
        );
        let ingested = ingested?;
        let acquired = scheduled?;
        acquired.require_success()?;
        check_cancelled(cancel)?;

        let master_headers = rows.export_headers();
        let (filtered, mut stats) = rows.into_parts();
        stats.keywords = acquired.jobs.len();
        stats.jobs_succeeded = acquired.counts.succeeded;
        stats.jobs_failed = acquired.counts.failed;
        stats.jobs_aborted = acquired.counts.aborted;
        info!(
            datasets = ingested,
            input_rows = stats.input_rows,
            dedup_removed = stats.dedup_removed,
            purifier_removed = stats.purifier_removed,
            category_filter_removed = stats.category_filter_removed,
            kept = stats.filtered_rows,
            "row stages finished"
        );
        if filtered.is_empty() {
            return Err(PipelineError::EmptyStage {
                stage: "category filter",
                stats: Box::new(stats),
            });
        }

        // Stored only once nothing can cancel the run any more.
        let master_csv = build_csv(&master_headers, &filtered)?;

        let index = UrlKeywordIndex::build(&filtered, &self.settings.url_column, &self.settings.url_host);
        stats.urls_extracted = index.len();
        if index.is_empty() {
            return Err(PipelineError::EmptyStage {
                stage: "url extraction",
                stats: Box::new(stats),
            });
        }
        check_cancelled(cancel)?;

        let runner = BatchRunner::new(self.client.clone(), self.config.pages_actor.clone())
            .with_batch_size(self.settings.batch_size)
            .with_concurrency(acquisition.concurrency())
            .with_run_options(RunOptions {
                memory_mb: Some(self.config.actor_memory_mb).filter(|m| *m > 0),
                timeout_secs: None,
            })
            .with_timing(self.batch_timing);
        let batches = runner.run(&index.urls(), cancel).await;
        check_cancelled(cancel)?;

        let dataset_ids = batch::succeeded_datasets(&batches);
        stats.batches_total = batches.len();
        stats.batches_succeeded = dataset_ids.len();
        stats.batches_failed = batches.len() - dataset_ids.len();
        if dataset_ids.is_empty() {
            return Err(PipelineError::AllBatchesFailed {
                total: batches.len(),
                stats: Box::new(stats),
            });
        }

        let mut enriched = Vec::new();
        for dataset_id in &dataset_ids {
            check_cancelled(cancel)?;
            match self.client.dataset_items(dataset_id, &DatasetQuery::all()).await {
                Ok(items) => enriched.extend(items.iter().map(|item| index.tag_item(item))),
                Err(err) => warn!(dataset_id, error = %err, "enriched dataset fetch failed"),
            }
        }
        stats.enriched_items = enriched.len();
        if enriched.is_empty() {
            return Err(PipelineError::EmptyStage {
                stage: "enriched dataset fetch",
                stats: Box::new(stats),
            });
        }
        check_cancelled(cancel)?;

        let (headers, buckets) = classify_rows(enriched);
        stats.mobile = buckets.mobile.len();
        stats.landline = buckets.landline.len();
        stats.other = buckets.other.len();

        let today = Utc::now().date_naive();
        let source = self.settings.source_name.as_str();
        let mut outputs = Vec::new();
        let master = self
            .store
            .store_bytes(export_file_name(source, "master", today, "csv"), &master_csv)
            .await
            .map_err(PipelineError::Io)?;
        outputs.push(OutputRecord::from_stored("master_csv", &master));
        let sorted = export_classified(&self.store, source, today, &headers, buckets).await?;
        outputs.push(OutputRecord::from_stored("sorted_xlsx", &sorted));
        info!(
            mobile = stats.mobile,
            landline = stats.landline,
            other = stats.other,
            file = %sorted.absolute_path.display(),
            "spreadsheet exported"
        );

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status: "completed".to_string(),
            keywords: acquired.jobs.iter().map(|job| job.keyword.clone()).collect(),
            job_counts: acquired.counts,
            jobs: acquired.jobs,
            batches,
            stats,
            outputs,
        };
        let report = report::write_run_summary(&self.store, &summary)
            .await
            .map_err(PipelineError::Io)?;
        info!(report = %report.absolute_path.display(), "run report written");
        Ok(summary)
    }
}

/// Drain every handed-off dataset into the row stages. The first error
/// cancels `stage` so acquisition winds down too.
async fn ingest_datasets(
    client: &dyn ActorClient,
    mut datasets: mpsc::UnboundedReceiver<CompletedDataset>,
    rows: &mut RowPipeline,
    stage: &CancellationToken,
) -> Result<usize, PipelineError> {
    let mut ingested = 0;
    while let Some(completed) = datasets.recv().await {
        if let Err(err) = ingest_dataset(client, &completed, rows, stage).await {
            stage.cancel();
            return Err(err);
        }
        ingested += 1;
    }
    Ok(ingested)
}

async fn ingest_dataset(
    client: &dyn ActorClient,
    completed: &CompletedDataset,
    rows: &mut RowPipeline,
    stage: &CancellationToken,
) -> Result<(), PipelineError> {
    let mut offset = 0;
    loop {
        check_cancelled(stage)?;
        let query = DatasetQuery::page(offset, INGEST_PAGE_SIZE);
        let page = match client.dataset_items(&completed.dataset_id, &query).await {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    keyword = %completed.keyword,
                    dataset_id = %completed.dataset_id,
                    offset,
                    error = %err,
                    "dataset page fetch failed; keeping rows read so far"
                );
                break;
            }
        };
        for item in &page {
            rows.ingest_record(&completed.keyword, item)?;
        }
        offset += page.len();
        if page.len() < INGEST_PAGE_SIZE {
            break;
        }
    }
    info!(
        keyword = %completed.keyword,
        job_id = %completed.job_id,
        dataset_id = %completed.dataset_id,
        items = offset,
        kept = rows.stats().filtered_rows,
        "dataset ingested"
    );
    Ok(())
}

/// Enriched header set plus the rows sorted into phone buckets.
pub fn classify_rows(rows: Vec<Row>) -> (Vec<String>, ClassifiedRows) {
    let (headers, phone_column) = phone::enriched_headers(&rows, &keyword_columns(&rows));
    let buckets = PhoneClassifier::new(phone_column).classify_all(rows);
    (headers, buckets)
}

/// [`classify_rows`] over raw records, one column per top-level key.
pub fn classify_records(items: &[JsonValue]) -> (Vec<String>, ClassifiedRows) {
    classify_rows(items.iter().map(stringify_record).collect())
}

/// Write the `Mobiles` / `Landlines` / `Others` workbook as
/// `{source}_Sorted_{date}.xlsx`.
pub async fn export_classified(
    store: &OutputStore,
    source: &str,
    date: NaiveDate,
    headers: &[String],
    buckets: ClassifiedRows,
) -> Result<StoredOutput, PipelineError> {
    let bytes = build_xlsx(headers, &buckets.into_sheets())?;
    store
        .store_bytes(export_file_name(source, "Sorted", date, "xlsx"), &bytes)
        .await
        .map_err(PipelineError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_archive::list_entries;
    use serde_json::json;

    #[test]
    fn crate_name_is_stable() {
        assert_eq!(CRATE_NAME, "leadflow-sync");
    }

    #[test]
    fn stage_errors_keep_their_counts() {
        let err = PipelineError::EmptyStage {
            stage: "category filter",
            stats: Box::new(PipelineStats {
                input_rows: 4,
                category_filter_removed: 4,
                ..PipelineStats::default()
            }),
        };
        assert_eq!(err.to_string(), "no rows left after category filter");
        assert_eq!(err.stats().map(|s| s.input_rows), Some(4));
        assert!(PipelineError::Cancelled.is_cancelled());
        assert_eq!(PipelineError::Cancelled.to_string(), "stopped by user");
    }

    #[test]
    fn records_are_sorted_into_buckets_with_phone_column() {
        let items = vec![
            json!({"name": "A", "phone": "0412 345 678", "keyword": "plumber"}),
            json!({"name": "B", "phone": "02 9876 5432"}),
            json!({"name": "C", "info": {"email": "c@example.com"}}),
        ];
        let (headers, buckets) = classify_records(&items);
        assert_eq!(headers, vec!["name", "phone", "keyword", "info"]);
        assert_eq!(buckets.mobile.len(), 1);
        assert_eq!(buckets.landline.len(), 1);
        assert_eq!(buckets.other.len(), 1);
        assert_eq!(buckets.other[0].get("info"), r#"{"email":"c@example.com"}"#);
    }

    #[tokio::test]
    async fn classified_export_is_a_three_sheet_workbook() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OutputStore::new(dir.path());
        let (headers, buckets) = classify_records(&[json!({"phone": "0412345678"})]);
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");

        let stored = export_classified(&store, "leads", date, &headers, buckets)
            .await
            .expect("export");
        assert_eq!(stored.file_name, "leads_Sorted_2024-03-01.xlsx");
        let bytes = std::fs::read(&stored.absolute_path).expect("read");
        let names: Vec<String> = list_entries(&bytes)
            .expect("zip")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&"xl/worksheets/sheet3.xml".to_string()));
    }
}
