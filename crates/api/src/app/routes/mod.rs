use axum::Router;

pub mod jobs;
pub mod system;

/// Router for all endpoints.
pub fn router() -> Router {
    Router::new()
        .merge(system::router())
        .merge(jobs::router())
}
