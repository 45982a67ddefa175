use crate::orchestrator::Orchestrator;
use std::sync::Arc;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub api_token: String,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, api_token: impl Into<String>) -> Self {
        Self {
            orchestrator,
            api_token: api_token.into(),
        }
    }

    pub fn is_accepting(&self) -> bool {
        !self.orchestrator.is_shutdown()
    }
}
