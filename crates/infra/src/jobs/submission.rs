//! Idempotent job submission.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use jobforge_core::{DomainError, JobId, NewJob};

use super::clock::{Clock, SystemClock};
use super::store::{JobStore, JobStoreError};

/// A job-creation request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    /// Falls back to the gateway's default when `None`.
    pub max_attempts: Option<u32>,
    /// Delay execution until this time.
    pub run_at: Option<DateTime<Utc>>,
}

impl SubmitRequest {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            idempotency_key: None,
            max_attempts: None,
            run_at: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// This call inserted the job.
    Created,
    /// A job with the same idempotency key already existed.
    Deduplicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub job_id: JobId,
    pub outcome: SubmitOutcome,
}

impl Submission {
    pub fn is_created(&self) -> bool {
        self.outcome == SubmitOutcome::Created
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    /// The key conflicted but the winning job never became readable.
    #[error("job with idempotency key {0:?} is not visible yet")]
    NotVisible(String),
}

impl SubmitError {
    pub fn is_transient(&self) -> bool {
        match self {
            SubmitError::Store(e) => e.is_transient(),
            SubmitError::NotVisible(_) => true,
            SubmitError::Validation(_) => false,
        }
    }
}

/// Bounded backoff for reading back a conflicting job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBackPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl Default for ReadBackPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(10),
        }
    }
}

/// Accepts job-creation requests and enforces idempotency.
///
/// For a fixed idempotency key, any number of concurrent or repeated calls
/// converge on one stored job and all return its id.
#[derive(Clone)]
pub struct SubmissionGateway {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    default_max_attempts: u32,
    read_back: ReadBackPolicy,
}

impl SubmissionGateway {
    pub fn new(store: Arc<dyn JobStore>, default_max_attempts: u32) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            default_max_attempts,
            read_back: ReadBackPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_read_back(mut self, read_back: ReadBackPolicy) -> Self {
        self.read_back = read_back;
        self
    }

    #[instrument(
        skip(self, request),
        fields(task_type = %request.task_type, idempotency_key = ?request.idempotency_key),
        err
    )]
    pub async fn create(&self, request: SubmitRequest) -> Result<Submission, SubmitError> {
        let mut job = NewJob::new(
            request.task_type,
            request.payload,
            request.max_attempts.unwrap_or(self.default_max_attempts),
        );
        job.idempotency_key = request.idempotency_key;
        job.run_at = request.run_at;
        job.validate()?;

        let now = self.clock.now();
        let Some(key) = job.idempotency_key.clone() else {
            let created = self.store.insert(job, now).await?;
            info!(job_id = %created.id, "job created");
            return Ok(Submission {
                job_id: created.id,
                outcome: SubmitOutcome::Created,
            });
        };

        if let Some(created) = self.store.insert_if_absent(job, now).await? {
            info!(job_id = %created.id, "job created");
            return Ok(Submission {
                job_id: created.id,
                outcome: SubmitOutcome::Created,
            });
        }

        let job_id = self.read_back(&key).await?;
        info!(job_id = %job_id, "existing job returned");
        Ok(Submission {
            job_id,
            outcome: SubmitOutcome::Deduplicated,
        })
    }

    /// Read the job holding `key`, waiting briefly for a racing insert to commit.
    async fn read_back(&self, key: &str) -> Result<JobId, SubmitError> {
        let mut delay = self.read_back.initial_delay;
        for attempt in 1..=self.read_back.attempts.max(1) {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                return Ok(existing.id);
            }
            if attempt < self.read_back.attempts {
                debug!(attempt, "conflicting job not visible yet");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
        Err(SubmitError::NotVisible(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobStore, JobStats};
    use async_trait::async_trait;
    use jobforge_core::{Job, JobStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gateway(store: Arc<dyn JobStore>) -> SubmissionGateway {
        SubmissionGateway::new(store, 3)
    }

    #[tokio::test]
    async fn submissions_without_key_always_create() {
        let store = InMemoryJobStore::arc();
        let gw = gateway(store.clone());

        let a = gw.create(SubmitRequest::new("sleep_test", json!({}))).await.unwrap();
        let b = gw.create(SubmitRequest::new("sleep_test", json!({}))).await.unwrap();

        assert!(a.is_created() && b.is_created());
        assert_ne!(a.job_id, b.job_id);

        let job = store.get(a.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.run_at, job.created_at);
    }

    #[tokio::test]
    async fn repeated_key_returns_the_same_job() {
        let store = InMemoryJobStore::arc();
        let gw = gateway(store.clone());
        let request = SubmitRequest::new("sleep_test", json!({"seconds": 2})).with_idempotency_key("abc");

        let first = gw.create(request.clone()).await.unwrap();
        let second = gw.create(request).await.unwrap();

        assert_eq!(first.outcome, SubmitOutcome::Created);
        assert_eq!(second.outcome, SubmitOutcome::Deduplicated);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn explicit_max_attempts_and_run_at_are_kept() {
        let store = InMemoryJobStore::arc();
        let gw = gateway(store.clone());
        let later = Utc::now() + chrono::Duration::hours(1);

        let sub = gw
            .create(
                SubmitRequest::new("report.pdf", json!({}))
                    .with_max_attempts(7)
                    .with_run_at(later),
            )
            .await
            .unwrap();

        let job = store.get(sub.job_id).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 7);
        assert_eq!(job.run_at, later);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_insert() {
        let store = InMemoryJobStore::arc();
        let gw = gateway(store.clone());

        let err = gw.create(SubmitRequest::new("", json!({}))).await.unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
        assert!(!err.is_transient());

        let err = gw
            .create(SubmitRequest::new("x", json!({})).with_max_attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
        assert_eq!(store.stats().await.unwrap(), JobStats::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_with_one_key_converge() {
        let store = InMemoryJobStore::arc();
        let gw = gateway(store.clone());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let gw = gw.clone();
            tasks.push(tokio::spawn(async move {
                gw.create(
                    SubmitRequest::new("sleep_test", json!({"caller": i})).with_idempotency_key("abc"),
                )
                .await
                .unwrap()
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        let created = results.iter().filter(|s| s.is_created()).count();
        assert_eq!(created, 1);
        let id = results[0].job_id;
        assert!(results.iter().all(|s| s.job_id == id));
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    /// Store whose key lookups miss a fixed number of times, mimicking a
    /// conflicting insert that has not committed yet.
    struct LaggingStore {
        inner: InMemoryJobStore,
        misses: AtomicU32,
    }

    #[async_trait]
    impl JobStore for LaggingStore {
        async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
            self.inner.insert(job, now).await
        }
        async fn insert_if_absent(
            &self,
            job: NewJob,
            now: DateTime<Utc>,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.insert_if_absent(job, now).await
        }
        async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(id).await
        }
        async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
            let remaining = self.misses.load(Ordering::SeqCst);
            if remaining > 0 {
                self.misses.store(remaining - 1, Ordering::SeqCst);
                return Ok(None);
            }
            self.inner.find_by_idempotency_key(key).await
        }
        async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
            self.inner.claim_next(now).await
        }
        async fn finalize(&self, job: &Job) -> Result<(), JobStoreError> {
            self.inner.finalize(job).await
        }
        async fn reclaim_expired(
            &self,
            cutoff: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Vec<JobId>, JobStoreError> {
            self.inner.reclaim_expired(cutoff, now).await
        }
        async fn list(
            &self,
            status: Option<JobStatus>,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list(status, limit).await
        }
        async fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats().await
        }
    }

    fn lagging(misses: u32) -> Arc<LaggingStore> {
        Arc::new(LaggingStore {
            inner: InMemoryJobStore::new(),
            misses: AtomicU32::new(misses),
        })
    }

    #[tokio::test]
    async fn read_back_waits_for_the_winning_row() {
        let store = lagging(2);
        let gw = gateway(store.clone()).with_read_back(ReadBackPolicy {
            attempts: 5,
            initial_delay: Duration::from_millis(1),
        });
        let request = SubmitRequest::new("sleep_test", json!({})).with_idempotency_key("k");

        let first = gw.create(request.clone()).await.unwrap();
        let second = gw.create(request).await.unwrap();

        assert_eq!(second.outcome, SubmitOutcome::Deduplicated);
        assert_eq!(second.job_id, first.job_id);
    }

    #[tokio::test]
    async fn read_back_gives_up_with_a_transient_error() {
        let store = lagging(100);
        let gw = gateway(store.clone()).with_read_back(ReadBackPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
        });
        let request = SubmitRequest::new("sleep_test", json!({})).with_idempotency_key("k");

        gw.create(request.clone()).await.unwrap();
        let err = gw.create(request).await.unwrap_err();

        assert!(matches!(err, SubmitError::NotVisible(ref k) if k == "k"));
        assert!(err.is_transient());
        assert_eq!(store.misses.load(Ordering::SeqCst), 97);
    }
}
