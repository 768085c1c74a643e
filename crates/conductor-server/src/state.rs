//! Shared application state.

use std::sync::Arc;

use conductor_billing::{AutoReloadProcessor, PaymentGateway};
use conductor_core::ConductorConfig;
use conductor_llm::ModelClient;
use conductor_runtime::{AttachmentStore, JobTracker, Orchestrator};
use conductor_store::SqliteStore;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: ConductorConfig,
    pub store: Arc<SqliteStore>,
    pub orchestrator: Arc<Orchestrator>,
    /// Lifecycle observer fed from `run/finished` events.
    pub jobs: JobTracker,
    /// Billing collaborator fed from auto-reload events.
    pub reloads: AutoReloadProcessor,
}

impl AppState {
    pub fn new(
        config: ConductorConfig,
        store: Arc<SqliteStore>,
        client: Arc<dyn ModelClient>,
        attachments: Arc<dyn AttachmentStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::from_config(
            &config,
            store.clone(),
            client,
            attachments,
        ));
        Self {
            jobs: JobTracker::new(store.clone()),
            reloads: AutoReloadProcessor::new(store.clone(), gateway),
            orchestrator,
            store,
            config,
        }
    }
}
