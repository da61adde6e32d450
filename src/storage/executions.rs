//! Execution log -- one row per attempted run, finalized exactly once.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{format_ts, parse_id, parse_ts, Pool, StorageError, StorageResult};
use crate::scheduler::history::{ChangeCounts, Completion, ExecutionId, ExecutionRecord, Outcome, TriggerKind};
use crate::storage::catalog::QueryId;

pub const RESTART_REASON: &str = "interrupted: service restarted";
pub const LOST_REASON: &str = "reconciled: execution lost";

const RECORD_SELECT: &str = "SELECT id, query_id, trigger_kind, started_at, ended_at, outcome, error,
            attempts, record_count, bugs_added, bugs_removed, bugs_changed
     FROM executions";

#[derive(Clone)]
pub struct ExecutionLog {
    pool: Pool,
}

impl ExecutionLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert a pending record. Fails with [`StorageError::Busy`] while the
    /// query already has a pending record, whichever process opened it.
    pub fn open(
        &self,
        id: ExecutionId,
        query_id: QueryId,
        trigger: TriggerKind,
        started_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT INTO executions (id, query_id, trigger_kind, started_at, outcome)
             VALUES (?1, ?2, ?3, ?4, 'pending')",
            params![id.to_string(), query_id, trigger.as_str(), format_ts(&started_at)],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(StorageError::Busy(query_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Set the final outcome. Returns false if the record was already final
    /// or never opened.
    pub fn finalize(&self, id: ExecutionId, done: &Completion) -> StorageResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE executions
             SET ended_at = MAX(?2, started_at), outcome = ?3, error = ?4, attempts = ?5, record_count = ?6,
                 bugs_added = ?7, bugs_removed = ?8, bugs_changed = ?9
             WHERE id = ?1 AND outcome = 'pending'",
            params![
                id.to_string(),
                format_ts(&done.ended_at),
                done.outcome.as_str(),
                done.error,
                done.attempts,
                done.record_count.map(|n| n as i64),
                done.changes.map(|c| c.added as i64),
                done.changes.map(|c| c.removed as i64),
                done.changes.map(|c| c.changed as i64),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: ExecutionId) -> StorageResult<Option<ExecutionRecord>> {
        let conn = self.pool.get()?;
        let raw = conn
            .query_row(&format!("{} WHERE id = ?1", RECORD_SELECT), [id.to_string()], RawRecord::from_row)
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Records for a query, newest first.
    pub fn list(&self, query_id: QueryId, limit: usize) -> StorageResult<Vec<ExecutionRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE query_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
            RECORD_SELECT
        ))?;
        let rows = stmt.query_map(params![query_id, limit as i64], RawRecord::from_row)?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?.decode()?);
        }
        Ok(records)
    }

    /// Start time of the most recent execution of each query.
    pub fn last_started(&self) -> StorageResult<Vec<(QueryId, DateTime<Utc>)>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT query_id, MAX(started_at) FROM executions GROUP BY query_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut out = Vec::new();
        for r in rows {
            let (query_id, ts) = r?;
            out.push((query_id, parse_ts(&ts)?));
        }
        Ok(out)
    }

    /// Mark every pending record as failed. Called once at startup, before
    /// any execution can be in flight.
    pub fn reconcile_interrupted(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE executions
             SET outcome = 'failure', error = ?1, ended_at = MAX(?2, started_at)
             WHERE outcome = 'pending'",
            params![RESTART_REASON, format_ts(&now)],
        )?;
        Ok(changed)
    }

    /// Fail pending records that started before `cutoff` and are not owned by
    /// an in-flight execution.
    pub fn reconcile_stale(
        &self,
        cutoff: DateTime<Utc>,
        in_flight: &[ExecutionId],
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<ExecutionId>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM executions WHERE outcome = 'pending' AND started_at < ?1",
        )?;
        let candidates: Vec<String> = stmt
            .query_map([format_ts(&cutoff)], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut reconciled = Vec::new();
        for raw_id in candidates {
            let id = parse_id(&raw_id)?;
            if in_flight.contains(&id) {
                continue;
            }
            let changed = conn.execute(
                "UPDATE executions
                 SET outcome = 'failure', error = ?2, ended_at = MAX(?3, started_at)
                 WHERE id = ?1 AND outcome = 'pending'",
                params![raw_id, LOST_REASON, format_ts(&now)],
            )?;
            if changed > 0 {
                reconciled.push(id);
            }
        }
        Ok(reconciled)
    }
}

struct RawRecord {
    id: String,
    query_id: i64,
    trigger: String,
    started_at: String,
    ended_at: Option<String>,
    outcome: String,
    error: Option<String>,
    attempts: i64,
    record_count: Option<i64>,
    bugs_added: Option<i64>,
    bugs_removed: Option<i64>,
    bugs_changed: Option<i64>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            query_id: row.get(1)?,
            trigger: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            outcome: row.get(5)?,
            error: row.get(6)?,
            attempts: row.get(7)?,
            record_count: row.get(8)?,
            bugs_added: row.get(9)?,
            bugs_removed: row.get(10)?,
            bugs_changed: row.get(11)?,
        })
    }

    fn decode(self) -> StorageResult<ExecutionRecord> {
        let count = |n: i64| n.max(0) as usize;
        let changes = match (self.bugs_added, self.bugs_removed, self.bugs_changed) {
            (Some(added), Some(removed), Some(changed)) => Some(ChangeCounts {
                added: count(added),
                removed: count(removed),
                changed: count(changed),
            }),
            _ => None,
        };
        Ok(ExecutionRecord {
            id: parse_id(&self.id)?,
            query_id: self.query_id,
            trigger: TriggerKind::parse(&self.trigger)
                .ok_or_else(|| StorageError::Corrupt(format!("trigger kind '{}'", self.trigger)))?,
            started_at: parse_ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            outcome: Outcome::parse(&self.outcome)
                .ok_or_else(|| StorageError::Corrupt(format!("outcome '{}'", self.outcome)))?,
            error: self.error,
            attempts: self.attempts.max(0) as u32,
            record_count: self.record_count.map(count),
            changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use crate::storage::catalog::{Catalog, NewQuery};
    use crate::storage::schema::DEFAULT_WORKPLACE;
    use crate::storage::temp_pool;
    use chrono::Duration;

    fn add_query(pool: &Pool, name: &str) -> QueryId {
        Catalog::new(pool.clone())
            .add_query(&NewQuery {
                name: name.into(),
                workplace: DEFAULT_WORKPLACE.into(),
                tracker_filter: "product=X".into(),
                details: None,
                schedule_interval_secs: None,
            })
            .unwrap()
    }

    fn setup() -> (tempfile::TempDir, ExecutionLog, QueryId) {
        let (dir, pool) = temp_pool();
        let query_id = add_query(&pool, "q");
        (dir, ExecutionLog::new(pool), query_id)
    }

    fn done(outcome: Outcome, at: DateTime<Utc>) -> Completion {
        Completion {
            ended_at: at,
            outcome,
            error: None,
            attempts: 1,
            record_count: Some(2),
            changes: Some(ChangeCounts { added: 1, removed: 0, changed: 1 }),
        }
    }

    #[test]
    fn test_open_then_finalize_once() {
        let (_dir, log, q) = setup();
        let id = Uuid::new_v4();
        let start = Utc::now();
        log.open(id, q, TriggerKind::Manual, start).unwrap();

        let pending = log.get(id).unwrap().unwrap();
        assert_eq!(pending.outcome, Outcome::Pending);
        assert!(pending.ended_at.is_none());

        assert!(log.finalize(id, &done(Outcome::Success, start + Duration::seconds(1))).unwrap());
        assert!(!log.finalize(id, &done(Outcome::Failure, start + Duration::seconds(2))).unwrap());

        let rec = log.get(id).unwrap().unwrap();
        assert_eq!(rec.outcome, Outcome::Success);
        assert_eq!(rec.record_count, Some(2));
        assert_eq!(rec.changes, Some(ChangeCounts { added: 1, removed: 0, changed: 1 }));
        assert!(rec.ended_at.unwrap() >= rec.started_at);
    }

    #[test]
    fn test_second_open_of_a_running_query_is_busy() {
        let (_dir, log, q) = setup();
        let first = Uuid::new_v4();
        let start = Utc::now();
        log.open(first, q, TriggerKind::Scheduled, start).unwrap();

        let second = Uuid::new_v4();
        let err = log.open(second, q, TriggerKind::Manual, start).unwrap_err();
        assert!(matches!(err, StorageError::Busy(id) if id == q));
        assert!(log.get(second).unwrap().is_none());

        log.finalize(first, &done(Outcome::Success, start + Duration::seconds(1))).unwrap();
        log.open(second, q, TriggerKind::Manual, start + Duration::seconds(2)).unwrap();
    }

    #[test]
    fn test_end_time_clamped_to_start() {
        let (_dir, log, q) = setup();
        let id = Uuid::new_v4();
        let start = Utc::now();
        log.open(id, q, TriggerKind::Scheduled, start).unwrap();
        log.finalize(id, &done(Outcome::Failure, start - Duration::seconds(5))).unwrap();
        let rec = log.get(id).unwrap().unwrap();
        assert_eq!(rec.ended_at, Some(rec.started_at));
    }

    #[test]
    fn test_list_is_newest_first() {
        let (_dir, log, q) = setup();
        let base = Utc::now();
        let ids: Vec<_> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            let at = base + Duration::seconds(i as i64);
            log.open(*id, q, TriggerKind::Scheduled, at).unwrap();
            log.finalize(*id, &done(Outcome::Success, at)).unwrap();
        }

        let listed = log.list(q, 10).unwrap();
        assert_eq!(listed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[2], ids[1], ids[0]]);
        assert_eq!(log.list(q, 1).unwrap().len(), 1);

        let last = log.last_started().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].0, q);
    }

    #[test]
    fn test_restart_reconciles_pending_to_failure() {
        let (_dir, log, q) = setup();
        let id = Uuid::new_v4();
        log.open(id, q, TriggerKind::Manual, Utc::now()).unwrap();

        assert_eq!(log.reconcile_interrupted(Utc::now()).unwrap(), 1);
        let rec = log.get(id).unwrap().unwrap();
        assert_eq!(rec.outcome, Outcome::Failure);
        assert_eq!(rec.error.as_deref(), Some(RESTART_REASON));
        assert_eq!(log.reconcile_interrupted(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn test_stale_reconcile_skips_in_flight_and_recent() {
        let (_dir, pool) = temp_pool();
        let log = ExecutionLog::new(pool.clone());
        let now = Utc::now();
        let old_owned = Uuid::new_v4();
        let old_lost = Uuid::new_v4();
        let recent = Uuid::new_v4();
        log.open(old_owned, add_query(&pool, "owned"), TriggerKind::Scheduled, now - Duration::minutes(30))
            .unwrap();
        log.open(old_lost, add_query(&pool, "lost"), TriggerKind::Scheduled, now - Duration::minutes(30))
            .unwrap();
        log.open(recent, add_query(&pool, "recent"), TriggerKind::Manual, now).unwrap();

        let reconciled = log
            .reconcile_stale(now - Duration::minutes(10), &[old_owned], now)
            .unwrap();
        assert_eq!(reconciled, vec![old_lost]);
        assert_eq!(log.get(old_owned).unwrap().unwrap().outcome, Outcome::Pending);
        assert_eq!(log.get(recent).unwrap().unwrap().outcome, Outcome::Pending);
        assert_eq!(log.get(old_lost).unwrap().unwrap().error.as_deref(), Some(LOST_REASON));
    }
}
