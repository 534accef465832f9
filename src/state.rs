use std::sync::Arc;

use crate::hub::IntelligenceHub;
use crate::middleware::AccessManager;
use crate::vector::VectorEngine;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<IntelligenceHub>,
    pub access: Arc<AccessManager>,
    pub vector_engine: Option<Arc<VectorEngine>>,
}

impl AppState {
    pub fn new(
        hub: Arc<IntelligenceHub>,
        access: Arc<AccessManager>,
        vector_engine: Option<Arc<VectorEngine>>,
    ) -> Self {
        Self {
            hub,
            access,
            vector_engine,
        }
    }
}
