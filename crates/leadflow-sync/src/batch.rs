//! Page re-scrape in fixed-size URL batches behind an admission window.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use leadflow_adapters::{to_input_json, ActorClient, PageScrapeInput, RunOptions, RunStatus};
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTiming {
    pub poll_interval: Duration,
    /// Upper bound of the random extra delay added to every poll.
    pub poll_jitter: Duration,
}

impl Default for BatchTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_jitter: Duration::from_secs(2),
        }
    }
}

impl BatchTiming {
    fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        self.poll_interval + Duration::from_millis(fastrand::u64(0..=jitter_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BatchResult {
    Succeeded { dataset_id: String },
    Failed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub urls: Vec<String>,
    pub run_id: Option<String>,
    #[serde(flatten)]
    pub result: BatchResult,
}

impl BatchOutcome {
    pub fn dataset_id(&self) -> Option<&str> {
        match &self.result {
            BatchResult::Succeeded { dataset_id } => Some(dataset_id),
            _ => None,
        }
    }
}

pub fn partition(urls: &[String], batch_size: usize) -> Vec<Vec<String>> {
    urls.chunks(batch_size.max(1)).map(<[String]>::to_vec).collect()
}

/// Dataset ids of the succeeded batches, in batch order.
pub fn succeeded_datasets(outcomes: &[BatchOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter_map(BatchOutcome::dataset_id)
        .map(str::to_string)
        .collect()
}

pub struct BatchRunner {
    client: Arc<dyn ActorClient>,
    actor_id: String,
    batch_size: usize,
    concurrency: usize,
    run_options: RunOptions,
    timing: BatchTiming,
}

impl BatchRunner {
    pub fn new(client: Arc<dyn ActorClient>, actor_id: impl Into<String>) -> Self {
        Self {
            client,
            actor_id: actor_id.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: 1,
            run_options: RunOptions::default(),
            timing: BatchTiming::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_run_options(mut self, run_options: RunOptions) -> Self {
        self.run_options = run_options;
        self
    }

    pub fn with_timing(mut self, timing: BatchTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Run every batch; a new one is admitted as soon as any in-flight batch
    /// settles. One outcome per batch, sorted by batch index.
    pub async fn run(&self, urls: &[String], cancel: &CancellationToken) -> Vec<BatchOutcome> {
        let batches = partition(urls, self.batch_size);
        let total = batches.len();
        info!(
            urls = urls.len(),
            batches = total,
            concurrency = self.concurrency,
            "re-scrape started"
        );

        let mut queue = batches.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut outcomes = Vec::with_capacity(total);
        loop {
            while in_flight.len() < self.concurrency {
                let Some((index, urls)) = queue.next() else {
                    break;
                };
                if cancel.is_cancelled() {
                    outcomes.push(BatchOutcome {
                        index,
                        urls,
                        run_id: None,
                        result: BatchResult::Cancelled,
                    });
                    continue;
                }
                in_flight.push(self.run_batch(index, urls, cancel));
            }
            match in_flight.next().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }

        outcomes.sort_by_key(|o| o.index);
        let succeeded = outcomes.iter().filter(|o| o.dataset_id().is_some()).count();
        info!(batches = total, succeeded, "re-scrape finished");
        outcomes
    }

    async fn run_batch(
        &self,
        index: usize,
        urls: Vec<String>,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            index,
            urls,
            run_id: None,
            result: BatchResult::Cancelled,
        };

        let started = match to_input_json(&PageScrapeInput::new(outcome.urls.clone())) {
            Ok(input) => {
                self.client
                    .start_run(&self.actor_id, &input, &self.run_options)
                    .await
            }
            Err(err) => Err(err),
        };
        let handle = match started {
            Ok(handle) => handle,
            Err(err) => {
                warn!(batch = index, error = %err, "batch launch failed");
                outcome.result = BatchResult::Failed {
                    reason: format!("launch failed: {err}"),
                };
                return outcome;
            }
        };
        outcome.run_id = Some(handle.run_id.clone());
        debug!(batch = index, run_id = %handle.run_id, urls = outcome.urls.len(), "batch launched");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = self.client.abort_run(&self.actor_id, &handle.run_id).await {
                        debug!(batch = index, error = %err, "abort on cancel failed");
                    }
                    outcome.result = BatchResult::Cancelled;
                    return outcome;
                }
                _ = sleep(self.timing.next_delay()) => {}
            }

            match self.client.run_info(&self.actor_id, &handle.run_id).await {
                Ok(info) if info.status == RunStatus::Succeeded => {
                    debug!(batch = index, run_id = %handle.run_id, items = info.item_count, "batch succeeded");
                    outcome.result = BatchResult::Succeeded {
                        dataset_id: handle.dataset_id,
                    };
                    return outcome;
                }
                Ok(info) if info.status.is_terminal_failure() => {
                    warn!(batch = index, run_id = %handle.run_id, status = %info.status, "batch ended without data");
                    outcome.result = BatchResult::Failed {
                        reason: format!("remote run ended {}", info.status),
                    };
                    return outcome;
                }
                Ok(_) => {}
                // The run may still finish; only cancellation ends the wait.
                Err(err) => {
                    warn!(batch = index, run_id = %handle.run_id, error = %err, "batch status check failed; retrying");
                }
            }
        }
    }
}
