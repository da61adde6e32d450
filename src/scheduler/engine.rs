//! Execution engine -- turns triggers into executions on a bounded worker pool.
//!
//! Each query owns a [`QuerySlot`]; every state change happens under one
//! mutex that is never held across an await. Executions run as spawned tasks
//! and hand their slot back through a drop guard, so a panicking or cancelled
//! run cannot leave a query wedged in `Running`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::history::{ChangeCounts, Completion, ExecutionId, ExecutionRecord, Outcome, TriggerKind};
use super::retry::{fetch_with_retry, FetchOutcome, FetchProgress, RetryPolicy};
use super::state::{QuerySlot, QueryState, QueryStatus, TriggerDecision};
use super::{SchedulerError, TriggerAck};
use crate::config::{PartialPolicy, SchedulerConfig};
use crate::diff::{diff_snapshots, field_history, FieldHistoryEntry};
use crate::health::{HealthMonitor, SCHEDULER_SERVICE};
use crate::storage::catalog::{Query, QueryId};
use crate::storage::snapshots::Snapshot;
use crate::storage::{self, blocking, Catalog, ExecutionLog, Pool, SnapshotStore, StorageError};
use crate::tracker::{BugId, FetchError, TrackerAdapter};

struct Inner {
    pool: Pool,
    catalog: Catalog,
    executions: ExecutionLog,
    snapshots: SnapshotStore,
    tracker: Arc<dyn TrackerAdapter>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    health: Arc<HealthMonitor>,
    slots: Mutex<HashMap<QueryId, QuerySlot>>,
    /// Completions whose record could not be finalized; retried every tick.
    unfinalized: Mutex<Vec<(ExecutionId, Completion)>>,
    workers: Arc<Semaphore>,
    released: Notify,
    stopped: AtomicBool,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<QueryId, QuerySlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to the execution engine. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Running scheduling loop.
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop after its current tick. In-flight executions keep
    /// running until the runtime shuts down.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler loop task failed");
        }
    }
}

impl Scheduler {
    pub fn new(
        pool: Pool,
        tracker: Arc<dyn TrackerAdapter>,
        config: SchedulerConfig,
        health: Arc<HealthMonitor>,
    ) -> Self {
        let inner = Inner {
            catalog: Catalog::new(pool.clone()),
            executions: ExecutionLog::new(pool.clone()),
            snapshots: SnapshotStore::new(pool.clone()),
            pool,
            tracker,
            retry: RetryPolicy::from_config(&config),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            health,
            slots: Mutex::new(HashMap::new()),
            unfinalized: Mutex::new(Vec::new()),
            released: Notify::new(),
            stopped: AtomicBool::new(false),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.inner.health
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// Fail execution records left pending by a previous process, then load
    /// the query catalog. Must run before any execution is dispatched.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let log = self.inner.executions.clone();
        let reconciled = blocking(move || log.reconcile_interrupted(Utc::now())).await?;
        if reconciled > 0 {
            warn!(count = reconciled, "marked executions interrupted by restart as failed");
        }
        self.sync_queries().await?;
        Ok(reconciled)
    }

    /// Refresh query definitions from the catalog. New queries pick up the
    /// start time of their last recorded execution.
    pub async fn sync_queries(&self) -> Result<(), SchedulerError> {
        let catalog = self.inner.catalog.clone();
        let log = self.inner.executions.clone();
        let (queries, last_started) =
            blocking(move || Ok((catalog.list_queries()?, log.last_started()?))).await?;
        let last_started: HashMap<QueryId, DateTime<Utc>> = last_started.into_iter().collect();
        let known: HashSet<QueryId> = queries.iter().map(|q| q.id).collect();

        let mut slots = self.inner.slots();
        for query in queries {
            let id = query.id;
            match slots.get_mut(&id) {
                Some(slot) => slot.query = query,
                None => {
                    slots.insert(id, QuerySlot::new(query, last_started.get(&id).copied()));
                }
            }
        }
        slots.retain(|id, slot| known.contains(id) || slot.state != QueryState::Idle);
        Ok(())
    }

    /// Request an execution of `query_id`. Concurrent requests for a query
    /// that is already queued or running share that execution.
    pub async fn trigger(&self, query_id: QueryId, kind: TriggerKind) -> Result<TriggerAck, SchedulerError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }
        // Manual triggers see the catalog as it is now, not as of the last tick.
        if kind == TriggerKind::Manual {
            self.sync_queries().await?;
        }

        let decision = self
            .inner
            .slots()
            .get_mut(&query_id)
            .map(|slot| slot.trigger(kind))
            .ok_or(SchedulerError::UnknownQuery(query_id))?;

        match decision {
            TriggerDecision::Accepted(execution_id) => {
                info!(query_id, execution_id = %execution_id, trigger = kind.as_str(), "execution queued");
                let engine = self.clone();
                tokio::spawn(async move { engine.execute(query_id, execution_id, kind).await });
                Ok(TriggerAck { query_id, execution_id, coalesced: false })
            }
            TriggerDecision::Coalesced(execution_id) => {
                debug!(query_id, execution_id = %execution_id, trigger = kind.as_str(), "trigger coalesced");
                Ok(TriggerAck { query_id, execution_id, coalesced: true })
            }
            TriggerDecision::Disabled => Err(SchedulerError::QueryDisabled(query_id)),
        }
    }

    /// One pass of the scheduling loop: refresh queries, dispatch due ones,
    /// finish or reconcile lost executions, then heartbeat.
    pub async fn tick(&self) -> Vec<TriggerAck> {
        let now = Utc::now();
        if let Err(e) = self.sync_queries().await {
            warn!(error = %e, "failed to refresh queries from catalog");
        }

        let due: Vec<QueryId> = self
            .inner
            .slots()
            .values()
            .filter(|slot| slot.is_due(now))
            .map(|slot| slot.query.id)
            .collect();

        // A query whose last record is still pending cannot open a new one.
        self.finalize_deferred().await;

        let mut dispatched = Vec::with_capacity(due.len());
        for query_id in due {
            match self.trigger(query_id, TriggerKind::Scheduled).await {
                Ok(ack) => dispatched.push(ack),
                Err(e) => warn!(query_id, error = %e, "scheduled trigger rejected"),
            }
        }

        self.reconcile_stale(now).await;
        self.heartbeat().await;
        dispatched
    }

    /// Recover, then run [`Scheduler::tick`] every tick interval until stopped.
    pub async fn start(&self) -> Result<SchedulerHandle, SchedulerError> {
        self.recover().await?;

        let (stop, mut stop_rx) = watch::channel(false);
        let engine = self.clone();
        let period = self.inner.config.tick_interval();
        let join = tokio::spawn(async move {
            info!(
                tick_secs = period.as_secs(),
                workers = engine.inner.config.workers,
                "scheduler started"
            );
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        engine.tick().await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            engine.inner.stopped.store(true, Ordering::SeqCst);
            info!("scheduler stopped");
        });

        Ok(SchedulerHandle { stop, join })
    }

    /// Wait until execution `id` has left its query slot, then load its record.
    pub async fn wait(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, SchedulerError> {
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let active = self
                .inner
                .slots()
                .values()
                .any(|slot| slot.current_execution() == Some(id));
            if !active {
                break;
            }
            released.await;
        }
        self.execution(id).await
    }

    pub fn query_states(&self) -> Vec<QueryStatus> {
        let mut states: Vec<QueryStatus> = self.inner.slots().values().map(QueryStatus::from).collect();
        states.sort_by_key(|s| s.query.id);
        states
    }

    pub fn query_state(&self, query_id: QueryId) -> Option<QueryState> {
        self.inner.slots().get(&query_id).map(|slot| slot.state)
    }

    pub async fn execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, SchedulerError> {
        let log = self.inner.executions.clone();
        Ok(blocking(move || log.get(id)).await?)
    }

    pub async fn executions(&self, query_id: QueryId, limit: usize) -> Result<Vec<ExecutionRecord>, SchedulerError> {
        let log = self.inner.executions.clone();
        Ok(blocking(move || log.list(query_id, limit)).await?)
    }

    pub async fn latest_snapshot(&self, query_id: QueryId) -> Result<Option<Snapshot>, SchedulerError> {
        let store = self.inner.snapshots.clone();
        Ok(blocking(move || store.latest(query_id)).await?)
    }

    pub async fn snapshot(&self, execution_id: ExecutionId) -> Result<Option<Snapshot>, SchedulerError> {
        let store = self.inner.snapshots.clone();
        Ok(blocking(move || store.get(execution_id)).await?)
    }

    /// Change history of one field of one bug across every stored snapshot.
    pub async fn field_history(&self, bug_id: BugId, field: &str) -> Result<Vec<FieldHistoryEntry>, SchedulerError> {
        let store = self.inner.snapshots.clone();
        let name = field.to_string();
        let observations = blocking(move || store.history(bug_id, &name)).await?;
        Ok(field_history(bug_id, field, &observations))
    }

    /// Run only the tracker search for `filter`.
    pub async fn test_filter(&self, filter: &str) -> Result<Vec<BugId>, FetchError> {
        self.inner.tracker.test_filter(filter).await
    }

    async fn execute(self, query_id: QueryId, id: ExecutionId, kind: TriggerKind) {
        let inner = Arc::clone(&self.inner);
        let _release = SlotRelease { inner: Arc::clone(&inner), query_id, id };

        let _permit = match Arc::clone(&inner.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(query_id, execution_id = %id, "worker pool closed, dropping queued execution");
                return;
            }
        };

        let started_at = Utc::now();
        let query = {
            let mut slots = inner.slots();
            let Some(slot) = slots.get_mut(&query_id) else {
                return;
            };
            if let Err(e) = slot.start(id, started_at) {
                error!(error = %e, "execution lost its query slot");
                return;
            }
            slot.query.clone()
        };

        let log = inner.executions.clone();
        match blocking(move || log.open(id, query_id, kind, started_at)).await {
            Ok(()) => {}
            Err(StorageError::Busy(_)) => {
                warn!(query_id, execution_id = %id, "query already has a pending execution, skipping run");
                return;
            }
            Err(e) => {
                error!(query_id, execution_id = %id, error = %e, "failed to open execution record, skipping run");
                return;
            }
        }
        info!(query_id, execution_id = %id, query = %query.name, "execution started");

        let completion = self.run(&query, id).await;
        let outcome = completion.outcome;
        let attempts = completion.attempts;
        let records = completion.record_count;
        let reason = completion.error.clone();

        let log = inner.executions.clone();
        let done = completion.clone();
        match blocking(move || log.finalize(id, &done)).await {
            Ok(true) if outcome == Outcome::Failure => warn!(
                query_id,
                execution_id = %id,
                attempts,
                records = ?records,
                error = reason.as_deref().unwrap_or(""),
                "execution failed"
            ),
            Ok(true) => info!(
                query_id,
                execution_id = %id,
                outcome = %outcome,
                attempts,
                records = ?records,
                "execution finished"
            ),
            Ok(false) => warn!(query_id, execution_id = %id, "execution record was already final"),
            Err(e) => {
                error!(query_id, execution_id = %id, error = %e, "failed to finalize execution record, retrying next tick");
                inner
                    .unfinalized
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((id, completion));
            }
        }
    }

    /// Fetch, persist and classify one execution. Only the fetch stage is
    /// bounded by the execution timeout; local writes always run to the end.
    async fn run(&self, query: &Query, id: ExecutionId) -> Completion {
        let inner = &self.inner;

        let catalog = inner.catalog.clone();
        let fields = match blocking(move || catalog.field_names()).await {
            Ok(fields) => fields,
            Err(e) => return failed(format!("storage: {}", e), 0),
        };

        let progress = FetchProgress::default();
        let timeout = inner.config.execution_timeout();
        let fetched = tokio::time::timeout(
            timeout,
            fetch_with_retry(inner.tracker.as_ref(), &query.tracker_filter, &fields, &inner.retry, &progress),
        )
        .await;
        let attempts = progress.attempts();

        let (records, complete, outcome, error) = match fetched {
            Ok(FetchOutcome::Complete(records)) => (records, true, Outcome::Success, None),
            Ok(FetchOutcome::Partial { records, error }) => {
                let outcome = match inner.config.partial_policy {
                    PartialPolicy::RecordPartial => Outcome::Partial,
                    PartialPolicy::RecordFailure => Outcome::Failure,
                };
                let reason = format!("partial: {} records kept after {}", records.len(), error);
                (records, false, outcome, Some(reason))
            }
            Ok(FetchOutcome::Failed(error)) => return failed(error.to_string(), attempts),
            Err(_) => {
                let reason = format!("timeout: execution exceeded {}s", timeout.as_secs());
                match progress.take_partial() {
                    Some(records) => (records, false, Outcome::Failure, Some(reason)),
                    None => return failed(reason, attempts),
                }
            }
        };

        let snapshot = Snapshot::new(id, query.id, Utc::now(), complete, records);
        let record_count = snapshot.records.len();

        let store = inner.snapshots.clone();
        let query_id = query.id;
        let changes = match blocking(move || store.latest(query_id)).await {
            Ok(Some(previous)) => {
                let diff = diff_snapshots(&previous, &snapshot);
                if diff.is_empty() {
                    debug!(query_id, "result set unchanged since last snapshot");
                } else {
                    info!(
                        query_id,
                        appeared = diff.appeared.len(),
                        disappeared = diff.disappeared.len(),
                        changed = diff.changed.len(),
                        "result set changes since last snapshot"
                    );
                }
                Some(diff.counts())
            }
            Ok(None) => {
                debug!(query_id, "first snapshot for query");
                Some(ChangeCounts { added: record_count, ..ChangeCounts::default() })
            }
            Err(e) => {
                warn!(query_id, error = %e, "could not load previous snapshot");
                None
            }
        };

        let store = inner.snapshots.clone();
        if let Err(e) = blocking(move || store.write(&snapshot)).await {
            return failed(format!("storage: failed to persist snapshot: {}", e), attempts);
        }

        Completion {
            ended_at: Utc::now(),
            outcome,
            error,
            attempts,
            record_count: Some(record_count),
            changes,
        }
    }

    /// Retry finalizing records whose first finalize failed. The stored end
    /// time is the one observed when the execution ended.
    async fn finalize_deferred(&self) {
        let pending = std::mem::take(&mut *self.inner.unfinalized.lock().unwrap_or_else(|e| e.into_inner()));
        if pending.is_empty() {
            return;
        }

        let log = self.inner.executions.clone();
        let result = blocking(move || {
            let mut still_pending = Vec::new();
            for (id, done) in pending {
                match log.finalize(id, &done) {
                    Ok(true) => info!(execution_id = %id, outcome = %done.outcome, "finalized deferred execution record"),
                    Ok(false) => debug!(execution_id = %id, "deferred execution record was already final"),
                    Err(e) => {
                        warn!(execution_id = %id, error = %e, "execution record still cannot be finalized");
                        still_pending.push((id, done));
                    }
                }
            }
            Ok(still_pending)
        })
        .await;

        match result {
            Ok(still_pending) if !still_pending.is_empty() => {
                self.inner.unfinalized.lock().unwrap_or_else(|e| e.into_inner()).extend(still_pending);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "deferred finalize task failed"),
        }
    }

    async fn reconcile_stale(&self, now: DateTime<Utc>) {
        let grace = self.inner.config.execution_timeout() + self.inner.config.tick_interval();
        let Ok(grace) = chrono::Duration::from_std(grace) else {
            return;
        };
        let in_flight: Vec<ExecutionId> = self
            .inner
            .slots()
            .values()
            .filter_map(|slot| slot.current_execution())
            .collect();

        let log = self.inner.executions.clone();
        match blocking(move || log.reconcile_stale(now - grace, &in_flight, now)).await {
            Ok(lost) if !lost.is_empty() => {
                warn!(count = lost.len(), "marked lost executions as failed");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale execution reconciliation failed"),
        }
    }

    async fn heartbeat(&self) {
        let at = Utc::now();
        self.inner.health.beat(at);
        let pool = self.inner.pool.clone();
        if let Err(e) = blocking(move || storage::record_heartbeat(&pool, SCHEDULER_SERVICE, &at)).await {
            warn!(error = %e, "failed to persist scheduler heartbeat");
        }
    }
}

fn failed(reason: String, attempts: u32) -> Completion {
    Completion {
        ended_at: Utc::now(),
        outcome: Outcome::Failure,
        error: Some(reason),
        attempts,
        record_count: None,
        changes: None,
    }
}

/// Returns the query slot to idle when an execution task ends, however it ends.
struct SlotRelease {
    inner: Arc<Inner>,
    query_id: QueryId,
    id: ExecutionId,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        {
            let mut slots = self.inner.slots();
            if let Some(slot) = slots.get_mut(&self.query_id) {
                if slot.current_execution() == Some(self.id) {
                    if let Err(e) = slot.finish(self.id) {
                        error!(error = %e, "failed to release query slot");
                    }
                }
            }
        }
        self.inner.released.notify_waiters();
    }
}
