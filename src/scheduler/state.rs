//! Per-query execution state machine.
//!
//! `Idle -> Queued -> Running -> Cooldown -> Idle`. A trigger that arrives
//! while a query is queued or running is coalesced onto the execution already
//! under way. Disabled queries stay idle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::history::{ExecutionId, TriggerKind};
use crate::storage::catalog::{Query, QueryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Idle,
    Queued,
    Running,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Trigger,
    WorkerAcquired,
    Completed,
    Released,
}

/// The transition table. `None` means the event is not valid in `state`.
pub fn next_state(state: QueryState, event: Event) -> Option<QueryState> {
    use Event::*;
    use QueryState::*;
    match (state, event) {
        (Idle, Trigger) => Some(Queued),
        (Queued, WorkerAcquired) => Some(Running),
        (Running, Completed) => Some(Cooldown),
        (Cooldown, Released) => Some(Idle),
        _ => None,
    }
}

#[derive(Debug, Error)]
#[error("query {query_id}: {event:?} not valid in state {state:?}")]
pub struct TransitionError {
    pub query_id: QueryId,
    pub state: QueryState,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// A new execution was queued.
    Accepted(ExecutionId),
    /// An execution is already queued or running; callers share it.
    Coalesced(ExecutionId),
    Disabled,
}

/// One query's definition plus its live execution state.
#[derive(Debug, Clone)]
pub struct QuerySlot {
    pub query: Query,
    pub state: QueryState,
    pub current: Option<(ExecutionId, TriggerKind)>,
    pub last_started: Option<DateTime<Utc>>,
}

impl QuerySlot {
    pub fn new(query: Query, last_started: Option<DateTime<Utc>>) -> Self {
        Self { query, state: QueryState::Idle, current: None, last_started }
    }

    pub fn current_execution(&self) -> Option<ExecutionId> {
        self.current.map(|(id, _)| id)
    }

    /// Whether the schedule interval has elapsed for an idle, enabled query.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.query.enabled || self.state != QueryState::Idle {
            return false;
        }
        let Some(interval) = self.query.schedule_interval() else {
            return false;
        };
        match self.last_started {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed >= interval)
                .unwrap_or(false),
        }
    }

    pub fn trigger(&mut self, kind: TriggerKind) -> TriggerDecision {
        if let Some((id, _)) = self.current {
            if matches!(self.state, QueryState::Queued | QueryState::Running) {
                return TriggerDecision::Coalesced(id);
            }
        }
        if !self.query.enabled {
            return TriggerDecision::Disabled;
        }
        match next_state(self.state, Event::Trigger) {
            Some(next) => {
                let id = Uuid::new_v4();
                self.state = next;
                self.current = Some((id, kind));
                TriggerDecision::Accepted(id)
            }
            // Cooldown is left synchronously on release, so this is not
            // observable from outside the engine; refuse rather than queue twice.
            None => TriggerDecision::Disabled,
        }
    }

    /// A worker picked up the queued execution `id`.
    pub fn start(&mut self, id: ExecutionId, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_current(id, Event::WorkerAcquired)?;
        self.apply(Event::WorkerAcquired)?;
        self.last_started = Some(now);
        Ok(())
    }

    /// Execution `id` is finalized: pass through cooldown back to idle.
    pub fn finish(&mut self, id: ExecutionId) -> Result<(), TransitionError> {
        self.ensure_current(id, Event::Completed)?;
        if self.state == QueryState::Queued {
            // Never reached a worker (shutdown or a closed pool).
            self.state = QueryState::Cooldown;
        } else {
            self.apply(Event::Completed)?;
        }
        self.apply(Event::Released)?;
        self.current = None;
        Ok(())
    }

    fn ensure_current(&self, id: ExecutionId, event: Event) -> Result<(), TransitionError> {
        match self.current {
            Some((current, _)) if current == id => Ok(()),
            _ => Err(self.invalid(event)),
        }
    }

    fn apply(&mut self, event: Event) -> Result<(), TransitionError> {
        let next = next_state(self.state, event).ok_or_else(|| self.invalid(event))?;
        self.state = next;
        Ok(())
    }

    fn invalid(&self, event: Event) -> TransitionError {
        TransitionError { query_id: self.query.id, state: self.state, event }
    }
}

/// Snapshot of a slot for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct QueryStatus {
    pub query: Query,
    pub state: QueryState,
    pub current_execution: Option<ExecutionId>,
    pub last_started: Option<DateTime<Utc>>,
}

impl From<&QuerySlot> for QueryStatus {
    fn from(slot: &QuerySlot) -> Self {
        Self {
            query: slot.query.clone(),
            state: slot.state,
            current_execution: slot.current_execution(),
            last_started: slot.last_started,
        }
    }
}
