use std::time::Duration;

use crate::scheduler::Scheduler;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub scheduler: Scheduler,
    /// Heartbeat age beyond which a service reads as offline.
    pub heartbeat_window: Duration,
}
