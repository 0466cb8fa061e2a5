//! Worker loop: claim, execute, finalize.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobforge_core::{
    FailureDecision, Job, JobId, JobStatus, PermanentReason, RetryPolicy, TaskFailure,
    TaskOutcome, WorkerId,
};

use super::clock::{Clock, SystemClock};
use super::events::{JobEvent, JobEventSink, WorkerMetrics};
use super::executor::TaskExecutor;
use super::reclaim::LeaseReclaimer;
use super::store::{JobStore, JobStoreError};
use crate::config::QueueConfig;

/// Worker loop tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub reclaim_interval: Duration,
    pub execution_timeout: Option<Duration>,
    pub store_error_backoff: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            lease_duration: config.lease_duration,
            reclaim_interval: config.reclaim_interval,
            execution_timeout: config.execution_timeout,
            store_error_backoff: config.store_error_backoff,
            retry_policy: config.retry_policy(),
        }
    }
}

/// What one pass of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was eligible.
    Idle,
    /// A job was executed and its outcome persisted.
    Processed { job_id: JobId, status: JobStatus },
    /// A job was executed but its lease had been reclaimed meanwhile; the
    /// outcome was discarded.
    LeaseLost { job_id: JobId },
}

/// One worker loop.
///
/// Holds no state shared with other workers; everything goes through the
/// store. The only state kept between passes is the reclaimer's last sweep
/// time and an outcome whose write failed and must be retried.
pub struct JobWorker {
    id: WorkerId,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn TaskExecutor>,
    events: Arc<dyn JobEventSink>,
    clock: Arc<dyn Clock>,
    reclaimer: LeaseReclaimer,
    settings: WorkerSettings,
    unfinished: Option<(Job, Option<PermanentReason>)>,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn TaskExecutor>,
        settings: WorkerSettings,
    ) -> Self {
        let reclaimer = LeaseReclaimer::new(
            store.clone(),
            settings.lease_duration,
            settings.reclaim_interval,
        );
        Self {
            id: WorkerId::new(),
            store,
            executor,
            events: Arc::new(WorkerMetrics::new()),
            clock: Arc::new(SystemClock),
            reclaimer,
            settings,
            unfinished: None,
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn JobEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run one pass: sweep expired leases if due, claim, execute, finalize.
    ///
    /// Task failures never surface here; only store errors do.
    pub async fn run_once(&mut self) -> Result<Tick, JobStoreError> {
        if let Some((job, reason)) = self.unfinished.take() {
            debug!(worker = %self.id, job_id = %job.id, "retrying outcome write");
            return self.finish(job, reason).await;
        }

        let now = self.clock.now();
        if let Some(ids) = self.reclaimer.sweep_if_due(now).await? {
            if !ids.is_empty() {
                self.events.emit(&JobEvent::Reclaimed { job_ids: ids });
            }
        }

        let Some(job) = self.store.claim_next(now).await? else {
            return Ok(Tick::Idle);
        };
        info!(
            worker = %self.id,
            job_id = %job.id,
            task_type = %job.task_type,
            attempt = job.attempt_count + 1,
            "claimed job"
        );
        self.events.emit(&JobEvent::Claimed {
            job_id: job.id,
            task_type: job.task_type.clone(),
            attempt_count: job.attempt_count,
        });

        let outcome = self.execute(&job).await;
        let finished_at = self.clock.now();

        let mut updated = job.clone();
        let reason = match &outcome {
            Ok(()) => {
                updated.mark_succeeded(finished_at)?;
                None
            }
            Err(failure) => {
                let decision = self.settings.retry_policy.decide(&job, failure, finished_at);
                updated.apply_failure(&decision, finished_at)?;
                match decision {
                    FailureDecision::Permanent { reason, .. } => Some(reason),
                    FailureDecision::Retry { .. } => None,
                }
            }
        };
        self.finish(updated, reason).await
    }

    async fn execute(&self, job: &Job) -> TaskOutcome {
        let executor = self.executor.clone();
        let task_type = job.task_type.clone();
        let payload = job.payload.clone();
        let mut handle = tokio::spawn(async move { executor.execute(&task_type, &payload).await });

        let joined = match self.settings.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(TaskFailure::retryable(format!(
                        "execution timed out after {}s",
                        limit.as_secs_f64()
                    )));
                }
            },
            None => handle.await,
        };
        joined.unwrap_or_else(|e| Err(TaskFailure::non_retryable(format!("task aborted: {e}"))))
    }

    /// Persist a decided outcome. `reason` is set for permanent failures.
    async fn finish(
        &mut self,
        job: Job,
        reason: Option<PermanentReason>,
    ) -> Result<Tick, JobStoreError> {
        match self.store.finalize(&job).await {
            Ok(()) => {
                self.record_outcome(&job, reason);
                Ok(Tick::Processed {
                    job_id: job.id,
                    status: job.status,
                })
            }
            Err(JobStoreError::LeaseLost(job_id)) => {
                warn!(worker = %self.id, job_id = %job_id, "lease lost before outcome was written");
                self.events.emit(&JobEvent::LeaseLost { job_id });
                Ok(Tick::LeaseLost { job_id })
            }
            Err(e) if e.is_transient() => {
                self.unfinished = Some((job, reason));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn record_outcome(&self, job: &Job, reason: Option<PermanentReason>) {
        let event = match job.status {
            JobStatus::Succeeded => {
                info!(worker = %self.id, job_id = %job.id, attempt = job.attempt_count, "job succeeded");
                JobEvent::Succeeded {
                    job_id: job.id,
                    task_type: job.task_type.clone(),
                }
            }
            JobStatus::Pending => {
                warn!(
                    worker = %self.id,
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    run_at = %job.run_at,
                    error = job.error_message.as_deref().unwrap_or_default(),
                    "job failed, retry scheduled"
                );
                JobEvent::Retrying {
                    job_id: job.id,
                    attempt_count: job.attempt_count,
                    run_at: job.run_at,
                }
            }
            JobStatus::FailedPermanent => {
                let reason = reason.unwrap_or(PermanentReason::AttemptsExhausted);
                error!(
                    worker = %self.id,
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    reason = ?reason,
                    error = job.error_message.as_deref().unwrap_or_default(),
                    "job failed permanently"
                );
                JobEvent::FailedPermanently {
                    job_id: job.id,
                    attempt_count: job.attempt_count,
                    reason,
                }
            }
            JobStatus::InProgress => return,
        };
        self.events.emit(&event);
    }

    /// Loop until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Store errors are logged and followed by a back-off sleep; the loop
    /// never exits because of them. An in-flight job always runs to
    /// completion before shutdown is observed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "job worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.run_once().await {
                Ok(Tick::Idle) => Some(self.settings.poll_interval),
                Ok(_) => None,
                Err(e) => {
                    error!(
                        worker = %self.id,
                        error = %e,
                        transient = e.is_transient(),
                        "job store error, backing off"
                    );
                    Some(self.settings.store_error_backoff)
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(worker = %self.id, "job worker stopped");
    }

    /// Spawn this worker onto the runtime.
    pub fn spawn(self) -> WorkerHandle {
        WorkerHandle::spawn(vec![self])
    }
}

/// Handle to a set of running worker loops.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(workers: Vec<JobWorker>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let joins = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(rx.clone())))
            .collect();
        Self { shutdown, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request graceful shutdown and wait for every loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task failed");
            }
        }
    }
}
