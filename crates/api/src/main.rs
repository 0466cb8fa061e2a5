use std::sync::Arc;

use anyhow::Context;

use jobforge_infra::QueueConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = QueueConfig::load().context("invalid configuration")?;
    jobforge_observability::init();

    let services = jobforge_api::app::services::build_services(&config)
        .await
        .context("failed to initialize job store")?;
    let app = jobforge_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
