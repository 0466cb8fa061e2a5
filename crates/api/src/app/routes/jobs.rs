use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use jobforge_core::{JobId, JobStatus};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", get(get_job))
}

/// `POST /jobs`: 201 for a new job, 200 when the idempotency key matched an
/// existing one. An empty body submits a default `sleep_test` job.
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        dto::CreateJobRequest::default()
    } else {
        match serde_json::from_slice::<dto::CreateJobRequest>(&body) {
            Ok(r) => r,
            Err(e) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.to_string());
            }
        }
    };

    match services.gateway.create(request.into_submit_request()).await {
        Ok(submission) if submission.is_created() => (
            StatusCode::CREATED,
            Json(dto::CreateJobResponse {
                job_id: submission.job_id,
                message: None,
            }),
        )
            .into_response(),
        Ok(submission) => (
            StatusCode::OK,
            Json(dto::CreateJobResponse {
                job_id: submission.job_id,
                message: Some("Existing job returned"),
            }),
        )
            .into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// `GET /jobs/:id`: the full persisted job record.
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_id", e.to_string()),
    };

    match services.store.get(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "Job not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// `GET /jobs?status=&limit=`: newest first.
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref().map(str::parse::<JobStatus>).transpose() {
        Ok(s) => s,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string()),
    };

    match services.store.list(status, query.limit()).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
