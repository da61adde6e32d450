//! Execution records -- the audit trail of every attempted query run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::catalog::QueryId;

pub type ExecutionId = Uuid;

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerKind::Scheduled),
            "manual" => Some(TriggerKind::Manual),
            _ => None,
        }
    }
}

/// Result of an execution. `Pending` only while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Partial,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Outcome::Pending),
            "success" => Some(Outcome::Success),
            "partial" => Some(Outcome::Partial),
            "failure" => Some(Outcome::Failure),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record of one attempted run of a query.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub query_id: QueryId,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub error: Option<String>,
    /// Tracker calls made, retries included.
    pub attempts: u32,
    /// Bugs persisted in this execution's snapshot, if one was written.
    pub record_count: Option<usize>,
    /// Movement against the query's previous snapshot.
    pub changes: Option<ChangeCounts>,
}

/// Bugs that appeared, disappeared or had a field change since the previous
/// snapshot of the same query. A first snapshot counts every bug as added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

/// Final state written when an execution ends.
#[derive(Debug, Clone)]
pub struct Completion {
    pub ended_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub error: Option<String>,
    pub attempts: u32,
    pub record_count: Option<usize>,
    pub changes: Option<ChangeCounts>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_strings_round_trip() {
        for o in [Outcome::Pending, Outcome::Success, Outcome::Partial, Outcome::Failure] {
            assert_eq!(Outcome::parse(o.as_str()), Some(o));
        }
        assert_eq!(Outcome::parse("running"), None);
        assert!(!Outcome::Pending.is_final());
        assert!(Outcome::Partial.is_final());
    }

    #[test]
    fn test_trigger_kind_parse() {
        assert_eq!(TriggerKind::parse("manual"), Some(TriggerKind::Manual));
        assert_eq!(TriggerKind::parse("cron"), None);
    }
}
