use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}

pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "message": "Job queue API is running",
    }))
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.store.stats().await {
        Ok(stats) => Json(dto::MetricsResponse::from(stats)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
