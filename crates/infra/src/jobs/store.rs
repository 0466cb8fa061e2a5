//! Job storage abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::{DomainError, Job, JobId, JobStatus, NewJob};

/// Persistent job store.
///
/// The store owns every state transition. `claim_next` is the only operation
/// that may move a job to `IN_PROGRESS`, and it must be atomic with respect to
/// concurrent callers: two claims never return the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job unconditionally.
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Insert a new pending job unless its idempotency key is already taken.
    ///
    /// Returns `None` when another job holds the key. Jobs without a key are
    /// always inserted.
    async fn insert_if_absent(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Get a job by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Look a job up by its idempotency key.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim the eligible job with the lowest id.
    ///
    /// Eligible means `PENDING` with `run_at <= now`. The returned job is
    /// already `IN_PROGRESS` with `started_at = now`.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Persist the outcome of an execution.
    ///
    /// `job` is the post-transition snapshot. The write only applies while the
    /// stored row is still `IN_PROGRESS` under the same claim (`started_at`
    /// unchanged); otherwise the lease was lost and `LeaseLost` is returned.
    async fn finalize(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Return every `IN_PROGRESS` job whose `started_at` is older than `cutoff`
    /// to `PENDING`. Returns the ids that were reclaimed.
    async fn reclaim_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError>;

    /// List jobs, newest first, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Job counts by status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// The backing store could not be reached. Transient.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The job was reclaimed or finalized by someone else since it was claimed.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl JobStoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Decode(msg) => JobStoreError::Corrupt(msg),
            other => JobStoreError::InvalidState(other.to_string()),
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub in_progress: u64,
    pub succeeded: u64,
    pub failed_permanent: u64,
    pub total: u64,
}

impl JobStats {
    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::InProgress => self.in_progress += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::FailedPermanent => self.failed_permanent += count,
        }
        self.total += count;
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    keys: HashMap<String, JobId>,
    next_id: i64,
}

impl State {
    fn insert(&mut self, job: NewJob, now: DateTime<Utc>) -> Job {
        self.next_id += 1;
        let id = JobId::new(self.next_id);
        let job = job.into_job(id, now);
        if let Some(key) = &job.idempotency_key {
            self.keys.insert(key.clone(), id);
        }
        self.jobs.insert(id, job.clone());
        job
    }

    fn key_taken(&self, job: &NewJob) -> bool {
        job.idempotency_key
            .as_ref()
            .is_some_and(|k| self.keys.contains_key(k))
    }
}

/// In-memory job store for tests/dev.
///
/// A single mutex serializes every operation, which gives `claim_next` the
/// same exclusivity the Postgres store gets from `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut state = self.lock()?;
        if state.key_taken(&job) {
            return Err(JobStoreError::Conflict(format!(
                "idempotency key already used: {}",
                job.idempotency_key.unwrap_or_default()
            )));
        }
        Ok(state.insert(job, now))
    }

    async fn insert_if_absent(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.lock()?;
        if state.key_taken(&job) {
            return Ok(None);
        }
        Ok(Some(state.insert(job, now)))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        let state = self.lock()?;
        Ok(state
            .keys
            .get(key)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.lock()?;
        // BTreeMap iterates in id order
        let Some(job) = state.jobs.values_mut().find(|j| j.is_claimable(now)) else {
            return Ok(None);
        };
        job.mark_claimed(now)?;
        Ok(Some(job.clone()))
    }

    async fn finalize(&self, job: &Job) -> Result<(), JobStoreError> {
        if job.status == JobStatus::InProgress {
            return Err(JobStoreError::InvalidState(format!(
                "job {} finalized while still IN_PROGRESS",
                job.id
            )));
        }
        let mut state = self.lock()?;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or(JobStoreError::NotFound(job.id))?;
        if stored.status != JobStatus::InProgress || stored.started_at != job.started_at {
            return Err(JobStoreError::LeaseLost(job.id));
        }
        *stored = job.clone();
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let mut state = self.lock()?;
        let mut reclaimed = Vec::new();
        for job in state.jobs.values_mut().filter(|j| j.lease_expired(cutoff)) {
            job.reclaim(now)?;
            reclaimed.push(job.id);
        }
        Ok(reclaimed)
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .rev()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobforge_core::{RetryPolicy, TaskFailure};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn new_job() -> NewJob {
        NewJob::new("sleep_test", serde_json::json!({"seconds": 0}), 3)
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let store = InMemoryJobStore::new();
        let a = store.insert(new_job(), t0()).await.unwrap();
        let b = store.insert(new_job(), t0()).await.unwrap();

        assert!(a.id < b.id);
        assert_eq!(a.status, JobStatus::Pending);
        assert_eq!(store.get(b.id).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn insert_if_absent_noops_on_taken_key() {
        let store = InMemoryJobStore::new();
        let first = store
            .insert_if_absent(new_job().with_idempotency_key("abc"), t0())
            .await
            .unwrap()
            .unwrap();
        let second = store
            .insert_if_absent(new_job().with_idempotency_key("abc"), t0())
            .await
            .unwrap();

        assert!(second.is_none());
        let found = store.find_by_idempotency_key("abc").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn plain_insert_rejects_taken_key() {
        let store = InMemoryJobStore::new();
        store
            .insert(new_job().with_idempotency_key("k"), t0())
            .await
            .unwrap();
        let err = store
            .insert(new_job().with_idempotency_key("k"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn claim_takes_lowest_eligible_id() {
        let store = InMemoryJobStore::new();
        let delayed = store
            .insert(new_job().with_run_at(t0() + Duration::seconds(30)), t0())
            .await
            .unwrap();
        let ready = store.insert(new_job(), t0()).await.unwrap();

        let claimed = store.claim_next(t0()).await.unwrap().unwrap();
        assert_eq!(claimed.id, ready.id);
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert_eq!(claimed.started_at, Some(t0()));

        assert!(store.claim_next(t0()).await.unwrap().is_none());

        let later = store
            .claim_next(t0() + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.id, delayed.id);
    }

    #[tokio::test]
    async fn finalize_writes_outcome() {
        let store = InMemoryJobStore::new();
        store.insert(new_job(), t0()).await.unwrap();
        let mut job = store.claim_next(t0()).await.unwrap().unwrap();

        job.mark_succeeded(t0() + Duration::seconds(1)).unwrap();
        store.finalize(&job).await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.updated_at, t0() + Duration::seconds(1));
    }

    #[tokio::test]
    async fn finalize_after_reclaim_reports_lease_lost() {
        let store = InMemoryJobStore::new();
        store.insert(new_job(), t0()).await.unwrap();
        let mut job = store.claim_next(t0()).await.unwrap().unwrap();

        let later = t0() + Duration::minutes(10);
        let reclaimed = store
            .reclaim_expired(later - Duration::minutes(5), later)
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![job.id]);

        job.mark_succeeded(later).unwrap();
        let err = store.finalize(&job).await.unwrap_err();
        assert!(matches!(err, JobStoreError::LeaseLost(id) if id == job.id));
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn terminal_jobs_are_never_touched_again() {
        let store = InMemoryJobStore::new();
        store.insert(new_job(), t0()).await.unwrap();
        let job = store.claim_next(t0()).await.unwrap().unwrap();

        let mut failed = job.clone();
        let decision = RetryPolicy::default().decide(&failed, &TaskFailure::non_retryable("bad"), t0());
        failed.apply_failure(&decision, t0()).unwrap();
        store.finalize(&failed).await.unwrap();

        let far = t0() + Duration::days(1);
        assert!(store.reclaim_expired(far, far).await.unwrap().is_empty());
        assert!(store.claim_next(far).await.unwrap().is_none());

        let mut late = job.clone();
        late.mark_succeeded(far).unwrap();
        assert!(matches!(
            store.finalize(&late).await,
            Err(JobStoreError::LeaseLost(_))
        ));
        assert_eq!(store.get(job.id).await.unwrap().unwrap(), failed);
    }

    #[tokio::test]
    async fn reclaim_keeps_attempts_and_run_at() {
        let store = InMemoryJobStore::new();
        store.insert(new_job(), t0()).await.unwrap();
        let claimed = store.claim_next(t0()).await.unwrap().unwrap();

        let now = t0() + Duration::minutes(6);
        store
            .reclaim_expired(now - Duration::minutes(5), now)
            .await
            .unwrap();

        let job = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.started_at, None);
        assert_eq!(job.attempt_count, claimed.attempt_count);
        assert_eq!(job.run_at, claimed.run_at);
        assert_eq!(job.updated_at, now);
    }

    #[tokio::test]
    async fn fresh_leases_survive_a_sweep() {
        let store = InMemoryJobStore::new();
        store.insert(new_job(), t0()).await.unwrap();
        store.claim_next(t0()).await.unwrap().unwrap();

        let now = t0() + Duration::minutes(4);
        let reclaimed = store
            .reclaim_expired(now - Duration::minutes(5), now)
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn list_and_stats_group_by_status() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.insert(new_job(), t0()).await.unwrap();
        }
        store.claim_next(t0()).await.unwrap().unwrap();

        let pending = store.list(Some(JobStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id > pending[1].id, "newest first");
        assert_eq!(store.list(None, 1).await.unwrap().len(), 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            JobStats {
                pending: 2,
                in_progress: 1,
                succeeded: 0,
                failed_permanent: 0,
                total: 3,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_share_a_job() {
        let store = InMemoryJobStore::arc();
        for _ in 0..50 {
            store.insert(new_job(), t0()).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = store.claim_next(t0()).await.unwrap() {
                    mine.push(job.id);
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 50);
        assert_eq!(all.len(), 50);
    }
}
