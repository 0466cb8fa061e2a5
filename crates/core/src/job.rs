//! The job entity and its state machine.
//!
//! ```text
//!            claim                 success
//! PENDING ──────────▶ IN_PROGRESS ─────────▶ SUCCEEDED
//!    ▲                   │  │
//!    │  retry (backoff)  │  │ non-retryable / attempts exhausted
//!    ├───────────────────┘  └──────────────▶ FAILED_PERMANENT
//!    │  lease reclaimed     │
//!    └──────────────────────┘
//! ```
//!
//! Every mutation goes through a method on [`Job`] so the in-memory and
//! persistent stores apply identical rules. Terminal jobs reject all of them.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::retry::FailureDecision;

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued; claimable once `run_at` has passed.
    Pending,
    /// Claimed by exactly one worker.
    InProgress,
    /// Finished successfully (terminal).
    Succeeded,
    /// Failed without further retries (terminal).
    FailedPermanent,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Succeeded,
        JobStatus::FailedPermanent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::FailedPermanent => "FAILED_PERMANENT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::FailedPermanent)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED_PERMANENT" => Ok(JobStatus::FailedPermanent),
            _ => Err(DomainError::decode(format!("invalid job status: {s}"))),
        }
    }
}

/// Largest accepted `max_attempts`; attempt counters are stored as 32-bit
/// signed integers.
pub const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX as u32;

/// A job as submitted, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub max_attempts: u32,
    /// Earliest execution time; `None` means "at creation time".
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            idempotency_key: None,
            max_attempts,
            run_at: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.task_type.trim().is_empty() {
            return Err(DomainError::validation("task_type must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be greater than zero"));
        }
        if self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(DomainError::validation(format!(
                "max_attempts must be at most {MAX_ATTEMPTS_LIMIT}"
            )));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() {
                return Err(DomainError::validation("idempotency_key must not be empty"));
            }
        }
        Ok(())
    }

    /// Materialize the persisted form with a store-assigned id.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            task_type: self.task_type,
            payload: self.payload,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            failed_at: None,
            run_at: self.run_at.unwrap_or(now),
            attempt_count: 0,
            max_attempts: self.max_attempts,
            error_message: None,
            idempotency_key: self.idempotency_key,
        }
    }
}

/// A persisted job record. Field names match the storage columns and are
/// exposed verbatim by read interfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub run_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    pub idempotency_key: Option<String>,
}

impl Job {
    /// A job is claim-eligible iff it is pending and its `run_at` has passed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    /// Whether an in-progress job's lease has expired.
    pub fn lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::InProgress && self.started_at.is_some_and(|s| s < cutoff)
    }

    /// PENDING → IN_PROGRESS. Only the store's claim operation may call this.
    pub fn mark_claimed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_claimable(now) {
            return Err(DomainError::invalid_transition(format!(
                "job {} is not claimable (status {}, run_at {})",
                self.id, self.status, self.run_at
            )));
        }
        self.status = JobStatus::InProgress;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// IN_PROGRESS → SUCCEEDED. `attempt_count` is left untouched.
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_in_progress("succeed")?;
        self.status = JobStatus::Succeeded;
        self.updated_at = now;
        Ok(())
    }

    /// IN_PROGRESS → PENDING (retry) or FAILED_PERMANENT, as decided by the
    /// retry policy.
    pub fn apply_failure(&mut self, decision: &FailureDecision, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_in_progress("fail")?;
        match decision {
            FailureDecision::Retry {
                attempt_count,
                run_at,
                error_message,
            } => {
                self.status = JobStatus::Pending;
                self.attempt_count = *attempt_count;
                self.run_at = *run_at;
                self.error_message = Some(error_message.clone());
            }
            FailureDecision::Permanent {
                attempt_count,
                error_message,
                ..
            } => {
                self.status = JobStatus::FailedPermanent;
                self.attempt_count = *attempt_count;
                self.error_message = Some(error_message.clone());
                self.failed_at = Some(now);
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// IN_PROGRESS → PENDING after the lease expired. Attempts and `run_at`
    /// are preserved so the job is immediately eligible again.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_in_progress("reclaim")?;
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn require_in_progress(&self, action: &str) -> DomainResult<()> {
        if self.status != JobStatus::InProgress {
            return Err(DomainError::invalid_transition(format!(
                "cannot {action} job {} in status {}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::task::TaskFailure;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn pending_job(max_attempts: u32) -> Job {
        NewJob::new("sleep_test", serde_json::json!({"seconds": 1}), max_attempts)
            .into_job(JobId::new(1), t0())
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("in_progress".parse::<JobStatus>().unwrap(), JobStatus::InProgress);
        assert!("RUNNING".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_value(JobStatus::FailedPermanent).unwrap();
        assert_eq!(json, serde_json::json!("FAILED_PERMANENT"));
    }

    #[test]
    fn new_job_defaults_run_at_to_creation_time() {
        let job = pending_job(3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.run_at, job.created_at);
        assert_eq!(job.attempt_count, 0);
        assert!(job.started_at.is_none());
        assert!(job.is_claimable(t0()));
    }

    #[test]
    fn validation_rejects_empty_type_and_zero_attempts() {
        assert!(NewJob::new("", serde_json::json!({}), 3).validate().is_err());
        assert!(NewJob::new("x", serde_json::json!({}), 0).validate().is_err());
        assert!(NewJob::new("x", serde_json::json!({}), 1)
            .with_idempotency_key("")
            .validate()
            .is_err());
        assert!(NewJob::new("x", serde_json::json!({}), 1).validate().is_ok());
    }

    #[test]
    fn validation_bounds_max_attempts_to_storable_range() {
        let at_limit = NewJob::new("x", serde_json::json!({}), MAX_ATTEMPTS_LIMIT);
        assert!(at_limit.validate().is_ok());

        let over = NewJob::new("x", serde_json::json!({}), MAX_ATTEMPTS_LIMIT + 1);
        assert!(matches!(over.validate(), Err(DomainError::Validation(_))));
        assert!(matches!(
            NewJob::new("x", serde_json::json!({}), u32::MAX).validate(),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn delayed_job_is_not_claimable_before_run_at() {
        let mut job = NewJob::new("x", serde_json::json!({}), 3)
            .with_run_at(t0() + Duration::seconds(10))
            .into_job(JobId::new(1), t0());

        assert!(!job.is_claimable(t0()));
        assert!(job.mark_claimed(t0()).is_err());
        assert!(job.mark_claimed(t0() + Duration::seconds(10)).is_ok());
    }

    #[test]
    fn claim_sets_started_at() {
        let mut job = pending_job(3);
        let now = t0() + Duration::seconds(1);
        job.mark_claimed(now).unwrap();

        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.started_at, Some(now));
        assert_eq!(job.updated_at, now);
        assert!(job.mark_claimed(now).is_err(), "double claim must be rejected");
    }

    #[test]
    fn success_keeps_attempt_count() {
        let mut job = pending_job(3);
        job.mark_claimed(t0()).unwrap();
        job.mark_succeeded(t0() + Duration::seconds(2)).unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempt_count, 0);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn terminal_jobs_reject_every_transition() {
        let policy = RetryPolicy::default();
        let mut job = pending_job(3);
        job.mark_claimed(t0()).unwrap();
        job.mark_succeeded(t0()).unwrap();
        let before = job.clone();

        let decision = policy.decide(&job, &TaskFailure::retryable("late"), t0());
        assert!(job.apply_failure(&decision, t0()).is_err());
        assert!(job.reclaim(t0()).is_err());
        assert!(job.mark_succeeded(t0()).is_err());
        assert!(job.mark_claimed(t0()).is_err());
        assert_eq!(job, before);
    }

    #[test]
    fn reclaim_clears_started_at_only() {
        let mut job = pending_job(3);
        job.mark_claimed(t0()).unwrap();
        let later = t0() + Duration::minutes(10);

        assert!(job.lease_expired(t0() + Duration::minutes(5)));
        job.reclaim(later).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert_eq!(job.run_at, t0());
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.updated_at, later);
    }
}
