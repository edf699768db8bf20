use std::sync::Arc;

use crate::{ports::PortAllocator, workers::WorkerSupervisor};

pub struct AppState {
    pub allocator: Arc<PortAllocator>,
    pub supervisor: Arc<WorkerSupervisor>,
}
