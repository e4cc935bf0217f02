use std::sync::Arc;

use refinery_engine::WorkflowService;

/// Shared application state for axum handlers.
pub struct AppState {
    pub service: Arc<WorkflowService>,
}
