//! Database bootstrap: pool creation with startup retries and store selection.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::jobs::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};

/// How hard to try reaching Postgres at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetry {
    pub attempts: u32,
    pub delay: Duration,
    pub max_connections: u32,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(2),
            max_connections: 10,
        }
    }
}

/// Connect to Postgres, retrying while the database is still starting up.
///
/// Returns the last connection error once `attempts` are used up.
pub async fn connect_with_retry(url: &str, retry: ConnectRetry) -> Result<PgPool, sqlx::Error> {
    let attempts = retry.attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = PgPoolOptions::new()
            .max_connections(retry.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await;

        match result {
            Ok(pool) => {
                info!(attempt, "connected to postgres");
                return Ok(pool);
            }
            Err(e) if attempt < attempts => {
                warn!(attempt, max_attempts = attempts, error = %e, "postgres not ready, retrying");
                tokio::time::sleep(retry.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Failure to bring up the job store at startup.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to connect to postgres: {0}")]
    Connect(#[from] sqlx::Error),
    #[error("failed to prepare job schema: {0}")]
    Schema(#[from] JobStoreError),
}

/// Open the store selected by `config`: Postgres when `DATABASE_URL` is set
/// (schema bootstrapped), otherwise a process-local in-memory store.
pub async fn open_store(config: &QueueConfig) -> Result<Arc<dyn JobStore>, BootstrapError> {
    match &config.database_url {
        Some(url) => {
            let pool = connect_with_retry(url, ConnectRetry::default()).await?;
            let store = PostgresJobStore::new(pool);
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory job store (jobs are not shared between processes)");
            Ok(InMemoryJobStore::arc())
        }
    }
}
