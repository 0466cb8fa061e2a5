use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::JobId;
use jobforge_infra::jobs::{JobStats, SubmitRequest};

/// Task type used when a submission names none.
pub const DEFAULT_TASK_TYPE: &str = "sleep_test";

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

// -------------------------
// Request DTOs
// -------------------------

/// `POST /jobs` body. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateJobRequest {
    pub task_type: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<u32>,
    pub run_at: Option<DateTime<Utc>>,
}

impl CreateJobRequest {
    pub fn into_submit_request(self) -> SubmitRequest {
        let mut request = SubmitRequest::new(
            self.task_type.unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string()),
            self.payload.unwrap_or_else(|| serde_json::json!({})),
        );
        request.idempotency_key = self.idempotency_key;
        request.max_attempts = self.max_attempts;
        request.run_at = self.run_at;
        request
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

/// `GET /metrics` body.
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub by_status: JobStats,
}

impl From<JobStats> for MetricsResponse {
    fn from(stats: JobStats) -> Self {
        Self {
            jobs_processed: stats.succeeded + stats.failed_permanent,
            jobs_succeeded: stats.succeeded,
            jobs_failed: stats.failed_permanent,
            by_status: stats,
        }
    }
}
