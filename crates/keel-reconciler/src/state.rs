use crate::engine::ReconciliationEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: ReconciliationEngine,
}
