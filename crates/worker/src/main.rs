use std::sync::Arc;

use anyhow::Context;

use jobforge_infra::QueueConfig;
use jobforge_infra::db::open_store;
use jobforge_infra::jobs::{HandlerRegistry, JobWorker, WorkerHandle, WorkerMetrics, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = QueueConfig::load().context("invalid configuration")?;
    jobforge_observability::init();

    let store = open_store(&config)
        .await
        .context("failed to initialize job store")?;

    let metrics = Arc::new(WorkerMetrics::new());
    let registry = Arc::new(HandlerRegistry::with_builtin_tasks());
    let settings = WorkerSettings::from(&config);

    let workers = (0..config.worker_concurrency)
        .map(|_| {
            JobWorker::new(store.clone(), registry.clone(), settings.clone())
                .with_event_sink(metrics.clone())
        })
        .collect();
    let handle = WorkerHandle::spawn(workers);

    tracing::info!(
        workers = handle.len(),
        handlers = ?registry.patterns(),
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        lease_secs = settings.lease_duration.as_secs(),
        "worker pool started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received, waiting for in-flight jobs");

    handle.shutdown().await;

    let snapshot = metrics.snapshot();
    tracing::info!(
        processed = snapshot.jobs_processed,
        succeeded = snapshot.jobs_succeeded,
        retried = snapshot.jobs_retried,
        failed = snapshot.jobs_failed,
        reclaimed = snapshot.jobs_reclaimed,
        leases_lost = snapshot.leases_lost,
        "worker pool stopped"
    );
    Ok(())
}
