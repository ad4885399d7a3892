//! Per-keyword acquisition scheduler.
//!
//! One remote bulk-pull run per keyword, at most `max_concurrency` in flight.
//! Each loop iteration launches what fits, polls every running job once,
//! hands freshly succeeded datasets to the ingest consumer and sleeps for an
//! interval that grows with the number of active jobs.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexSet;
use leadflow_adapters::{
    to_input_json, ActorClient, ActorError, DatasetQuery, RunInfo, RunOptions, RunStatus,
};
use leadflow_core::{JobCounts, JobStatus, KeywordJob};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AcquisitionParams;
use crate::dates::normalize_start_date;
use crate::PipelineError;

/// Retries after the first attempt; the third failure is permanent.
pub const MAX_RETRIES: u32 = 2;

/// Field of a bulk-pull record read by the date-violation guard.
pub const START_DATE_FIELD: &str = "start_date";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTiming {
    /// A running job with no items after this long is retried.
    pub no_result_timeout: Duration,
    pub min_loop_delay: Duration,
    pub per_active_delay: Duration,
    pub abort_poll_interval: Duration,
    pub abort_confirm_timeout: Duration,
    pub abort_attempts: u32,
    pub abort_retry_pause: Duration,
    /// Items read from the head of a running job's dataset per poll.
    pub head_limit: usize,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            no_result_timeout: Duration::from_secs(60),
            min_loop_delay: Duration::from_secs(3),
            per_active_delay: Duration::from_millis(200),
            abort_poll_interval: Duration::from_millis(1500),
            abort_confirm_timeout: Duration::from_secs(20),
            abort_attempts: 3,
            abort_retry_pause: Duration::from_secs(1),
            head_limit: 50,
        }
    }
}

impl SchedulerTiming {
    pub fn loop_delay(&self, active: usize) -> Duration {
        let active = u32::try_from(active).unwrap_or(u32::MAX);
        self.min_loop_delay
            .max(self.per_active_delay.saturating_mul(active))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub jobs: Vec<KeywordJob>,
    pub counts: JobCounts,
}

/// The job list. Jobs are only ever swapped whole, never edited in place.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    jobs: Vec<KeywordJob>,
}

impl SchedulerState {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Self {
        Self {
            jobs: keywords.iter().map(|k| KeywordJob::new(k.as_ref())).collect(),
        }
    }

    pub fn jobs(&self) -> &[KeywordJob] {
        &self.jobs
    }

    pub fn get(&self, id: Uuid) -> Option<&KeywordJob> {
        self.jobs.iter().find(|job| job.id == id)
    }

    /// Swap in a new version of an existing job. Unknown ids are ignored.
    pub fn replace(&mut self, job: KeywordJob) -> bool {
        match self.jobs.iter_mut().find(|slot| slot.id == job.id) {
            Some(slot) => {
                *slot = job;
                true
            }
            None => false,
        }
    }

    pub fn counts(&self) -> JobCounts {
        JobCounts::tally(&self.jobs)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            jobs: self.jobs.clone(),
            counts: self.counts(),
        }
    }
}

/// A succeeded job's dataset, sent to the ingest consumer exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDataset {
    pub job_id: Uuid,
    pub keyword: String,
    pub dataset_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerReport {
    pub jobs: Vec<KeywordJob>,
    pub counts: JobCounts,
    pub handed_off: usize,
}

impl SchedulerReport {
    /// A run survives individual job failures but not all of them.
    pub fn require_success(&self) -> Result<(), PipelineError> {
        if self.counts.succeeded == 0 {
            return Err(PipelineError::AllJobsFailed {
                counts: self.counts,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Observation {
    info: RunInfo,
    head: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    KeepRunning,
    Retry(String),
    Succeeded,
    RemoteEnded(RunStatus),
    GuardAbort,
}

pub struct AcquisitionScheduler {
    client: Arc<dyn ActorClient>,
    actor_id: String,
    params: AcquisitionParams,
    timing: SchedulerTiming,
    run_options: RunOptions,
    state: SchedulerState,
    events: watch::Sender<SchedulerSnapshot>,
    origin: Instant,
}

impl AcquisitionScheduler {
    /// Blank keywords are dropped and repeats collapse into one job.
    pub fn new(
        client: Arc<dyn ActorClient>,
        actor_id: impl Into<String>,
        params: AcquisitionParams,
        keywords: &[String],
    ) -> Result<Self, PipelineError> {
        let keywords: IndexSet<&str> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(PipelineError::Configuration(
                "keyword list is empty".to_string(),
            ));
        }
        params.require_min_date()?;

        let keywords: Vec<&str> = keywords.into_iter().collect();
        let state = SchedulerState::new(&keywords);
        let (events, _) = watch::channel(state.snapshot());
        let run_options = params.run_options(0);
        Ok(Self {
            client,
            actor_id: actor_id.into(),
            params,
            timing: SchedulerTiming::default(),
            run_options,
            state,
            events,
            origin: Instant::now(),
        })
    }

    pub fn with_timing(mut self, timing: SchedulerTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_run_options(mut self, run_options: RunOptions) -> Self {
        self.run_options = run_options;
        self
    }

    /// State-changed events: a fresh snapshot after every job replacement.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Drive every job to a terminal state. Succeeded datasets are sent on
    /// `handoff` as soon as they are observed.
    pub async fn run(
        &mut self,
        handoff: mpsc::UnboundedSender<CompletedDataset>,
        cancel: &CancellationToken,
    ) -> Result<SchedulerReport, PipelineError> {
        self.origin = Instant::now();
        let mut handed_off = 0;
        info!(
            jobs = self.state.jobs().len(),
            max_concurrency = self.params.concurrency(),
            actor = %self.actor_id,
            "acquisition started"
        );

        loop {
            if cancel.is_cancelled() {
                self.stop_active().await;
                return Err(PipelineError::Cancelled);
            }

            self.launch_pass(cancel).await;
            if !cancel.is_cancelled() {
                self.poll_pass().await;
            }
            handed_off += self.queue_handoffs(&handoff);

            let counts = self.state.counts();
            if counts.unsettled() == 0 {
                break;
            }
            let delay = self.timing.loop_delay(counts.active);
            debug!(?counts, delay_ms = delay.as_millis() as u64, "scheduler tick");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(delay) => {}
            }
        }

        let counts = self.state.counts();
        info!(
            succeeded = counts.succeeded,
            aborted = counts.aborted,
            failed = counts.failed,
            "acquisition finished"
        );
        Ok(SchedulerReport {
            jobs: self.state.jobs().to_vec(),
            counts,
            handed_off,
        })
    }

    fn replace(&mut self, job: KeywordJob) {
        if self.state.replace(job) {
            self.events.send_replace(self.state.snapshot());
        }
    }

    /// Retries first, then fresh jobs, until the concurrency window is full.
    async fn launch_pass(&mut self, cancel: &CancellationToken) {
        let counts = self.state.counts();
        let slots = self.params.concurrency().saturating_sub(counts.active);
        if slots == 0 {
            return;
        }
        let retries = self
            .state
            .jobs()
            .iter()
            .filter(|job| job.status == JobStatus::PendingRetry);
        let fresh = self
            .state
            .jobs()
            .iter()
            .filter(|job| job.status == JobStatus::Pending);
        let batch: Vec<KeywordJob> = retries.chain(fresh).take(slots).cloned().collect();

        for job in batch {
            if cancel.is_cancelled() {
                return;
            }
            self.launch(job).await;
        }
    }

    async fn launch(&mut self, job: KeywordJob) {
        let mut starting = job.clone();
        starting.status = JobStatus::Starting;
        self.replace(starting.clone());

        let input = self.params.bulk_input(&job.keyword);
        let started = match to_input_json(&input) {
            Ok(input) => {
                self.client
                    .start_run(&self.actor_id, &input, &self.run_options)
                    .await
            }
            Err(err) => Err(err),
        };

        match started {
            Ok(handle) => {
                let mut running = starting;
                running.status = JobStatus::Running;
                running.remote_run_id = Some(handle.run_id);
                running.remote_dataset_id = Some(handle.dataset_id);
                running.started_at = Some(self.origin.elapsed());
                info!(
                    keyword = %running.keyword,
                    job_id = %running.id,
                    run_id = ?running.remote_run_id,
                    retry_count = running.retry_count,
                    "job launched"
                );
                self.replace(running);
            }
            Err(err) => {
                self.retry_or_fail(starting, format!("launch failed: {err}"))
                    .await;
            }
        }
    }

    async fn observe(&self, job: &KeywordJob) -> Result<Observation, ActorError> {
        let run_id = job
            .remote_run_id
            .as_deref()
            .ok_or(ActorError::MissingField("run id"))?;
        let info = self.client.run_info(&self.actor_id, run_id).await?;
        let head = match job.remote_dataset_id.as_deref() {
            Some(dataset_id) => {
                self.client
                    .dataset_items(dataset_id, &DatasetQuery::head(self.timing.head_limit))
                    .await?
            }
            None => Vec::new(),
        };
        Ok(Observation { info, head })
    }

    async fn poll_pass(&mut self) {
        let running: Vec<KeywordJob> = self
            .state
            .jobs()
            .iter()
            .filter(|job| job.status == JobStatus::Running)
            .cloned()
            .collect();
        if running.is_empty() {
            return;
        }

        let observations = join_all(running.iter().map(|job| self.observe(job))).await;
        let now = self.origin.elapsed();
        for (job, observation) in running.into_iter().zip(observations) {
            let elapsed = now.saturating_sub(job.started_at.unwrap_or_default());
            match observation {
                Ok(observation) => self.apply_observation(job, observation, elapsed).await,
                Err(err) => {
                    warn!(
                        keyword = %job.keyword,
                        job_id = %job.id,
                        run_id = ?job.remote_run_id,
                        error = %err,
                        "poll failed"
                    );
                    if job.item_count == 0 && elapsed > self.timing.no_result_timeout {
                        self.retry_or_fail(job, "timeout with 0 results".to_string())
                            .await;
                    }
                }
            }
        }
    }

    async fn apply_observation(
        &mut self,
        mut job: KeywordJob,
        observation: Observation,
        elapsed: Duration,
    ) {
        match self.evaluate(&mut job, &observation, elapsed) {
            Verdict::KeepRunning => self.replace(job),
            Verdict::Retry(reason) => self.retry_or_fail(job, reason).await,
            Verdict::Succeeded => {
                job.status = JobStatus::Succeeded;
                info!(
                    keyword = %job.keyword,
                    job_id = %job.id,
                    run_id = ?job.remote_run_id,
                    retry_count = job.retry_count,
                    items = job.item_count,
                    "job succeeded"
                );
                self.replace(job);
            }
            Verdict::RemoteEnded(status) => {
                job.status = if status == RunStatus::Aborted {
                    JobStatus::Aborted
                } else {
                    JobStatus::Failed
                };
                job.fail_reason = Some(format!("remote run ended {status}"));
                warn!(
                    keyword = %job.keyword,
                    job_id = %job.id,
                    run_id = ?job.remote_run_id,
                    retry_count = job.retry_count,
                    remote_status = %status,
                    "job ended remotely"
                );
                self.replace(job);
            }
            Verdict::GuardAbort => self.guard_abort(job).await,
        }
    }

    /// Timeout, then remote terminal states, then the date guard.
    fn evaluate(&self, job: &mut KeywordJob, observation: &Observation, elapsed: Duration) -> Verdict {
        let seen = observation.head.len() as u64;
        job.item_count = observation.info.item_count.max(seen);

        if job.item_count == 0 && elapsed > self.timing.no_result_timeout {
            return Verdict::Retry("timeout with 0 results".to_string());
        }
        match &observation.info.status {
            RunStatus::Succeeded if job.item_count == 0 => {
                return Verdict::Retry("empty success".to_string());
            }
            RunStatus::Succeeded => return Verdict::Succeeded,
            status if status.is_terminal_failure() => {
                return Verdict::RemoteEnded(status.clone());
            }
            _ => {}
        }

        if !self.params.violation_guard {
            return Verdict::KeepRunning;
        }
        let (Some(violation_date), Some(freshest)) =
            (self.params.violation_date(), observation.head.first())
        else {
            return Verdict::KeepRunning;
        };
        let observed = freshest.get(START_DATE_FIELD).and_then(normalize_start_date);
        if observed.is_some() {
            job.last_observed_date = observed;
        }
        if observed == Some(violation_date) {
            job.violation_streak += 1;
            debug!(
                keyword = %job.keyword,
                job_id = %job.id,
                streak = job.violation_streak,
                "date violation observed"
            );
        } else {
            job.violation_streak = 0;
        }
        if job.violation_streak >= self.params.streak_limit() {
            Verdict::GuardAbort
        } else {
            Verdict::KeepRunning
        }
    }

    async fn guard_abort(&mut self, mut job: KeywordJob) {
        let Some(run_id) = job.remote_run_id.clone() else {
            self.replace(job);
            return;
        };
        warn!(
            keyword = %job.keyword,
            job_id = %job.id,
            run_id = %run_id,
            retry_count = job.retry_count,
            streak = job.violation_streak,
            "violation streak reached; aborting job"
        );
        match confirm_abort(self.client.as_ref(), &self.actor_id, &run_id, &self.timing).await {
            Some(RunStatus::Aborted) => {
                job.status = JobStatus::Aborted;
                job.fail_reason = Some(format!(
                    "date violation streak of {} reached",
                    job.violation_streak
                ));
            }
            Some(RunStatus::Succeeded) if job.item_count > 0 => {
                job.status = JobStatus::Succeeded;
            }
            Some(status) => {
                job.status = JobStatus::Failed;
                job.fail_reason = Some(format!("remote run ended {status} during abort"));
            }
            None => {
                warn!(
                    keyword = %job.keyword,
                    job_id = %job.id,
                    run_id = %run_id,
                    "abort not confirmed; job left running"
                );
            }
        }
        self.replace(job);
    }

    async fn retry_or_fail(&mut self, job: KeywordJob, reason: String) {
        if let Some(run_id) = job.remote_run_id.as_deref() {
            if let Err(err) = self.client.abort_run(&self.actor_id, run_id).await {
                debug!(run_id, error = %err, "best-effort abort failed");
            }
        }

        let mut next = job;
        if next.retry_count < MAX_RETRIES {
            next.retry_count += 1;
            next.status = JobStatus::PendingRetry;
            next.remote_run_id = None;
            next.remote_dataset_id = None;
            next.started_at = None;
            next.item_count = 0;
            next.violation_streak = 0;
            next.last_observed_date = None;
            next.fail_reason = Some(format!("Retry #{}: {reason}", next.retry_count));
            warn!(
                keyword = %next.keyword,
                job_id = %next.id,
                retry_count = next.retry_count,
                reason = %reason,
                "job scheduled for retry"
            );
        } else {
            next.status = JobStatus::Failed;
            next.fail_reason = Some(format!("{reason} (Max Retries Exceeded)"));
            warn!(
                keyword = %next.keyword,
                job_id = %next.id,
                run_id = ?next.remote_run_id,
                retry_count = next.retry_count,
                reason = %reason,
                "job failed permanently"
            );
        }
        self.replace(next);
    }

    fn queue_handoffs(&mut self, handoff: &mpsc::UnboundedSender<CompletedDataset>) -> usize {
        let ready: Vec<KeywordJob> = self
            .state
            .jobs()
            .iter()
            .filter(|job| job.status == JobStatus::Succeeded && !job.export_queued)
            .cloned()
            .collect();

        let mut sent = 0;
        for mut job in ready {
            job.export_queued = true;
            if let (Some(dataset_id), Some(run_id)) =
                (job.remote_dataset_id.clone(), job.remote_run_id.clone())
            {
                let completed = CompletedDataset {
                    job_id: job.id,
                    keyword: job.keyword.clone(),
                    dataset_id,
                    run_id,
                };
                if handoff.send(completed).is_err() {
                    warn!(keyword = %job.keyword, job_id = %job.id, "ingest consumer is gone");
                } else {
                    sent += 1;
                }
            }
            self.replace(job);
        }
        sent
    }

    /// Best-effort abort of every active job, issued concurrently.
    async fn stop_active(&mut self) {
        let active: Vec<KeywordJob> = self
            .state
            .jobs()
            .iter()
            .filter(|job| job.status.is_active())
            .cloned()
            .collect();
        let client = self.client.as_ref();
        let actor_id = self.actor_id.as_str();
        join_all(active.iter().filter_map(|job| {
            let run_id = job.remote_run_id.as_deref()?;
            Some(async move {
                if let Err(err) = client.abort_run(actor_id, run_id).await {
                    debug!(run_id, error = %err, "abort on stop failed");
                }
            })
        }))
        .await;

        for mut job in active {
            job.status = JobStatus::Aborted;
            job.fail_reason = Some("stopped by user".to_string());
            self.replace(job);
        }
        info!("acquisition stopped by user");
    }
}

/// Abort `run_id` and wait for the remote side to settle. Returns the
/// terminal status observed, or `None` when every attempt went unconfirmed.
pub async fn confirm_abort(
    client: &dyn ActorClient,
    actor_id: &str,
    run_id: &str,
    timing: &SchedulerTiming,
) -> Option<RunStatus> {
    let attempts = timing.abort_attempts.max(1);
    for attempt in 1..=attempts {
        match client.abort_run(actor_id, run_id).await {
            Ok(()) => {
                if let Some(status) = wait_for_terminal(client, actor_id, run_id, timing).await {
                    return Some(status);
                }
            }
            Err(err) => warn!(run_id, attempt, error = %err, "abort request failed"),
        }
        if attempt < attempts {
            sleep(timing.abort_retry_pause).await;
        }
    }
    None
}

async fn wait_for_terminal(
    client: &dyn ActorClient,
    actor_id: &str,
    run_id: &str,
    timing: &SchedulerTiming,
) -> Option<RunStatus> {
    let deadline = Instant::now() + timing.abort_confirm_timeout;
    loop {
        match client.run_info(actor_id, run_id).await {
            Ok(info) if info.status.is_terminal() => return Some(info.status),
            Ok(_) => {}
            Err(err) => debug!(run_id, error = %err, "status check during abort failed"),
        }
        if Instant::now() + timing.abort_poll_interval > deadline {
            return None;
        }
        sleep(timing.abort_poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_delay_has_a_floor_and_scales_with_active_jobs() {
        let timing = SchedulerTiming::default();
        assert_eq!(timing.loop_delay(0), Duration::from_secs(3));
        assert_eq!(timing.loop_delay(10), Duration::from_secs(3));
        assert_eq!(timing.loop_delay(40), Duration::from_secs(8));
        assert_eq!(timing.loop_delay(usize::MAX), Duration::from_millis(200) * u32::MAX);
    }

    #[test]
    fn state_replaces_whole_jobs_by_id() {
        let mut state = SchedulerState::new(&["a", "b"]);
        let mut job = state.jobs()[1].clone();
        job.status = JobStatus::Running;
        job.remote_run_id = Some("run-1".into());
        assert!(state.replace(job.clone()));
        assert_eq!(state.get(job.id), Some(&job));
        assert_eq!(state.counts().active, 1);
        assert_eq!(state.counts().pending, 1);

        let stranger = KeywordJob::new("c");
        assert!(!state.replace(stranger));
        assert_eq!(state.snapshot().jobs.len(), 2);
    }

    #[test]
    fn report_without_successes_is_fatal() {
        let report = SchedulerReport {
            jobs: Vec::new(),
            counts: JobCounts {
                failed: 2,
                aborted: 1,
                ..JobCounts::default()
            },
            handed_off: 0,
        };
        assert!(matches!(
            report.require_success(),
            Err(PipelineError::AllJobsFailed { counts }) if counts.failed == 2
        ));
    }
}
