//! Lease reclamation: the safety net for jobs abandoned by crashed workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use jobforge_core::JobId;

use super::store::{JobStore, JobStoreError};

/// Periodically returns expired `IN_PROGRESS` jobs to `PENDING`.
///
/// Each worker owns one; sweeps are idempotent so several workers sweeping
/// the same store is harmless.
pub struct LeaseReclaimer {
    store: Arc<dyn JobStore>,
    lease: Duration,
    interval: Duration,
    last_sweep: Option<DateTime<Utc>>,
}

impl LeaseReclaimer {
    pub fn new(store: Arc<dyn JobStore>, lease: Duration, interval: Duration) -> Self {
        Self {
            store,
            lease,
            interval,
            last_sweep: None,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Whether `interval` has elapsed since the last successful sweep.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.last_sweep.is_none_or(|last| {
            (now - last)
                .to_std()
                .map(|elapsed| elapsed >= self.interval)
                .unwrap_or(false)
        })
    }

    /// Reclaim every job whose lease started before `now - lease`.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let reclaimed = self.store.reclaim_expired(cutoff, now).await?;
        self.last_sweep = Some(now);

        if !reclaimed.is_empty() {
            warn!(
                count = reclaimed.len(),
                job_ids = ?reclaimed,
                lease_secs = self.lease.as_secs(),
                "reclaimed jobs with expired leases"
            );
        }
        Ok(reclaimed)
    }

    /// Sweep only when the interval has elapsed. `None` means skipped.
    pub async fn sweep_if_due(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<JobId>>, JobStoreError> {
        if !self.is_due(now) {
            return Ok(None);
        }
        self.sweep(now).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use chrono::Duration as ChronoDuration;
    use jobforge_core::{JobStatus, NewJob};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn reclaimer(store: Arc<InMemoryJobStore>) -> LeaseReclaimer {
        LeaseReclaimer::new(store, Duration::from_secs(300), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn expired_lease_returns_job_to_pending() {
        let store = InMemoryJobStore::arc();
        let job = store
            .insert(NewJob::new("sleep_test", serde_json::json!({}), 3), t0())
            .await
            .unwrap();
        let claimed = store.claim_next(t0()).await.unwrap().unwrap();
        let mut reclaimer = reclaimer(store.clone());

        let now = t0() + ChronoDuration::seconds(301);
        let ids = reclaimer.sweep(now).await.unwrap();
        assert_eq!(ids, vec![job.id]);

        let after = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Pending);
        assert_eq!(after.started_at, None);
        assert_eq!(after.attempt_count, claimed.attempt_count);
        assert_eq!(after.run_at, claimed.run_at);

        // Immediately claimable again.
        assert_eq!(store.claim_next(now).await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn lease_boundary_is_exclusive() {
        let store = InMemoryJobStore::arc();
        store
            .insert(NewJob::new("sleep_test", serde_json::json!({}), 3), t0())
            .await
            .unwrap();
        store.claim_next(t0()).await.unwrap().unwrap();
        let mut reclaimer = reclaimer(store.clone());

        let ids = reclaimer.sweep(t0() + ChronoDuration::seconds(300)).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn sweeps_are_gated_by_interval() {
        let store = InMemoryJobStore::arc();
        let mut reclaimer = reclaimer(store);

        assert!(reclaimer.is_due(t0()));
        assert_eq!(reclaimer.sweep_if_due(t0()).await.unwrap(), Some(vec![]));
        assert_eq!(
            reclaimer
                .sweep_if_due(t0() + ChronoDuration::seconds(10))
                .await
                .unwrap(),
            None
        );
        assert!(reclaimer.is_due(t0() + ChronoDuration::seconds(30)));
        assert!(!reclaimer.is_due(t0() - ChronoDuration::seconds(1)));
    }
}
