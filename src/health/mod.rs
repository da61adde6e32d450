//! Service health -- online/offline from scheduler heartbeats.
//!
//! Status is computed on demand. Anything short of a heartbeat inside the
//! window reads as offline: no beat yet, a stale beat, or a beat stamped in
//! the future.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::storage::{self, Pool, StorageResult};

/// Service name under which the scheduling loop reports heartbeats.
pub const SCHEDULER_SERVICE: &str = "scheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Online,
    Offline,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Online => write!(f, "online"),
            ServiceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Judge a heartbeat against `window` at time `now`.
pub fn evaluate(last_beat: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> ServiceStatus {
    let Some(last) = last_beat else {
        return ServiceStatus::Offline;
    };
    let Ok(age) = (now - last).to_std() else {
        return ServiceStatus::Offline;
    };
    if age < window {
        ServiceStatus::Online
    } else {
        ServiceStatus::Offline
    }
}

/// Status of `service` from its persisted heartbeat. Unknown services are offline.
pub fn persisted_status(
    pool: &Pool,
    service: &str,
    window: Duration,
    now: DateTime<Utc>,
) -> StorageResult<ServiceStatus> {
    let last = storage::last_heartbeat(pool, service)?;
    Ok(evaluate(last, now, window))
}

/// In-process view of the scheduling loop's liveness.
pub struct HealthMonitor {
    last_beat: Mutex<Option<DateTime<Utc>>>,
    window: Duration,
}

impl HealthMonitor {
    pub fn new(window: Duration) -> Self {
        Self { last_beat: Mutex::new(None), window }
    }

    pub fn beat(&self, at: DateTime<Utc>) {
        let mut last = self.last_beat.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(at);
    }

    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        *self.last_beat.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> ServiceStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> ServiceStatus {
        evaluate(self.last_beat(), now, self.window)
    }
}
