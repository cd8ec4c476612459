use std::sync::Arc;

use tenant_core::TenantOrchestrator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TenantOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<TenantOrchestrator>) -> Self {
        Self { orchestrator }
    }
}
