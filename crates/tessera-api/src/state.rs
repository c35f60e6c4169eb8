// Shared app state

use std::sync::Arc;

use tessera_durable::{ExecutionStore, SignalFanout, WorkflowExecutor};

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<WorkflowExecutor>,
    pub store: Arc<dyn ExecutionStore>,
    pub fanout: Arc<SignalFanout>,
}
