use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use jobforge_infra::jobs::{JobStoreError, SubmitError};

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "Job not found"),
        e if e.is_transient() => {
            error!(error = %e, "job store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string())
        }
        e => {
            error!(error = %e, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        SubmitError::NotVisible(key) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_visible",
            format!("job for idempotency key {key:?} is not visible yet; retry"),
        ),
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
