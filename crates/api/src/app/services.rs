use std::sync::Arc;

use jobforge_infra::QueueConfig;
use jobforge_infra::db::{BootstrapError, open_store};
use jobforge_infra::jobs::{InMemoryJobStore, JobStore, SubmissionGateway};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn JobStore>,
    pub gateway: SubmissionGateway,
}

impl AppServices {
    pub fn new(store: Arc<dyn JobStore>, config: &QueueConfig) -> Self {
        let gateway = SubmissionGateway::new(store.clone(), config.default_max_attempts);
        Self { store, gateway }
    }

    /// Services over a fresh in-memory store (dev/tests).
    pub fn in_memory(config: &QueueConfig) -> Self {
        Self::new(InMemoryJobStore::arc(), config)
    }
}

/// Open the configured store and wire services around it.
pub async fn build_services(config: &QueueConfig) -> Result<AppServices, BootstrapError> {
    let store = open_store(config).await?;
    Ok(AppServices::new(store, config))
}
