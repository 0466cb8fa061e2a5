//! Job lifecycle events and the default metrics sink.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobforge_core::{JobId, PermanentReason};

/// A transition observed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Claimed {
        job_id: JobId,
        task_type: String,
        attempt_count: u32,
    },
    Succeeded {
        job_id: JobId,
        task_type: String,
    },
    Retrying {
        job_id: JobId,
        attempt_count: u32,
        run_at: DateTime<Utc>,
    },
    FailedPermanently {
        job_id: JobId,
        attempt_count: u32,
        reason: PermanentReason,
    },
    /// Jobs returned to pending by a lease sweep.
    Reclaimed { job_ids: Vec<JobId> },
    /// The worker finished a job whose lease had already been taken away.
    LeaseLost { job_id: JobId },
}

/// Receives job events. Implementations must not block.
pub trait JobEventSink: Send + Sync {
    fn emit(&self, event: &JobEvent);
}

/// Process-wide counters fed by [`JobEvent`]s.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    claimed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    reclaimed: AtomicU64,
    lease_lost: AtomicU64,
}

/// Point-in-time copy of [`WorkerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_reclaimed: u64,
    pub leases_lost: u64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_processed: self.claimed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_reclaimed: self.reclaimed.load(Ordering::Relaxed),
            leases_lost: self.lease_lost.load(Ordering::Relaxed),
        }
    }
}

impl JobEventSink for WorkerMetrics {
    fn emit(&self, event: &JobEvent) {
        let (counter, by) = match event {
            JobEvent::Claimed { .. } => (&self.claimed, 1),
            JobEvent::Succeeded { .. } => (&self.succeeded, 1),
            JobEvent::Retrying { .. } => (&self.retried, 1),
            JobEvent::FailedPermanently { .. } => (&self.failed, 1),
            JobEvent::Reclaimed { job_ids } => (&self.reclaimed, job_ids.len() as u64),
            JobEvent::LeaseLost { .. } => (&self.lease_lost, 1),
        };
        counter.fetch_add(by, Ordering::Relaxed);
    }
}
