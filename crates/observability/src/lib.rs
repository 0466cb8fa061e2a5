//! Tracing and logging setup shared by the API and worker binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize process-wide observability (tracing/logging).
///
/// The output format is read from `LOG_FORMAT` (`json` by default, `pretty`
/// for local development). Safe to call multiple times; subsequent calls
/// become no-ops.
pub fn init() {
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    tracing::init(format);
}
