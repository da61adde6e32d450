//! Execution engine: per-query state, retries and the scheduling loop.

pub mod engine;
pub mod history;
pub mod retry;
pub mod state;

use serde::Serialize;
use thiserror::Error;

use crate::storage::catalog::QueryId;
use crate::storage::StorageError;

pub use self::engine::{Scheduler, SchedulerHandle};
pub use self::history::{ChangeCounts, ExecutionId, ExecutionRecord, Outcome, TriggerKind};
pub use self::state::{QueryState, QueryStatus};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown query {0}")]
    UnknownQuery(QueryId),

    #[error("query {0} is disabled")]
    QueryDisabled(QueryId),

    #[error("scheduler is stopped")]
    Stopped,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Reply to a trigger request.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerAck {
    pub query_id: QueryId,
    pub execution_id: ExecutionId,
    /// True when the request joined an execution that was already queued or
    /// running.
    pub coalesced: bool,
}
