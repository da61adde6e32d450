//! Snapshot store -- append-only result sets, one per execution.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{format_ts, parse_id, parse_ts, Pool, StorageResult};
use crate::scheduler::history::ExecutionId;
use crate::storage::catalog::QueryId;
use crate::tracker::{BugId, BugRecord, FieldValue};

/// The immutable result set of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub execution_id: ExecutionId,
    pub query_id: QueryId,
    pub captured_at: DateTime<Utc>,
    /// False when the fetch was interrupted and only part of the result is here.
    pub complete: bool,
    pub records: Vec<BugRecord>,
}

impl Snapshot {
    /// Build a snapshot; records are keyed by bug id, a later duplicate wins.
    /// The capture time is truncated to the stored microsecond precision.
    pub fn new(
        execution_id: ExecutionId,
        query_id: QueryId,
        captured_at: DateTime<Utc>,
        complete: bool,
        records: Vec<BugRecord>,
    ) -> Self {
        let by_id: BTreeMap<BugId, BugRecord> =
            records.into_iter().map(|r| (r.bug_id, r)).collect();
        Self {
            execution_id,
            query_id,
            captured_at: captured_at.trunc_subsecs(6),
            complete,
            records: by_id.into_values().collect(),
        }
    }

    pub fn record(&self, bug_id: BugId) -> Option<&BugRecord> {
        self.records.iter().find(|r| r.bug_id == bug_id)
    }
}

/// A bug's value for one field in one snapshot. `value` is `None` when the
/// snapshot holds the bug but not the field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldObservation {
    pub execution_id: ExecutionId,
    pub query_id: QueryId,
    pub captured_at: DateTime<Utc>,
    pub value: Option<FieldValue>,
}

#[derive(Clone)]
pub struct SnapshotStore {
    pool: Pool,
}

impl SnapshotStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Persist a snapshot and all of its bug records in one transaction.
    pub fn write(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let execution_id = snapshot.execution_id.to_string();

        tx.execute(
            "INSERT INTO snapshots (execution_id, query_id, captured_at, complete, record_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                execution_id,
                snapshot.query_id,
                format_ts(&snapshot.captured_at),
                snapshot.complete as i64,
                snapshot.records.len() as i64,
            ],
        )?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO bug_records (execution_id, bug_id, fields_json) VALUES (?1, ?2, ?3)",
            )?;
            for record in &snapshot.records {
                let fields_json = serde_json::to_string(&record.fields)?;
                insert.execute(params![execution_id, record.bug_id, fields_json])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Most recent snapshot of a query, if it ever produced one.
    pub fn latest(&self, query_id: QueryId) -> StorageResult<Option<Snapshot>> {
        let conn = self.pool.get()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT execution_id FROM snapshots WHERE query_id = ?1
                 ORDER BY captured_at DESC, rowid DESC LIMIT 1",
                [query_id],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);

        match id {
            Some(id) => self.get(parse_id(&id)?),
            None => Ok(None),
        }
    }

    pub fn get(&self, execution_id: ExecutionId) -> StorageResult<Option<Snapshot>> {
        let conn = self.pool.get()?;
        let key = execution_id.to_string();

        let header = conn
            .query_row(
                "SELECT query_id, captured_at, complete FROM snapshots WHERE execution_id = ?1",
                [&key],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?)),
            )
            .optional()?;
        let Some((query_id, captured_at, complete)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT bug_id, fields_json FROM bug_records WHERE execution_id = ?1 ORDER BY bug_id",
        )?;
        let rows = stmt.query_map([&key], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut records = Vec::new();
        for r in rows {
            let (bug_id, fields_json) = r?;
            records.push(BugRecord { bug_id, fields: serde_json::from_str(&fields_json)? });
        }

        Ok(Some(Snapshot {
            execution_id,
            query_id,
            captured_at: parse_ts(&captured_at)?,
            complete: complete != 0,
            records,
        }))
    }

    /// Every observation of `bug_id` across all snapshots, oldest first.
    pub fn history(&self, bug_id: BugId, field: &str) -> StorageResult<Vec<FieldObservation>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT s.execution_id, s.query_id, s.captured_at, r.fields_json
             FROM bug_records r JOIN snapshots s ON s.execution_id = r.execution_id
             WHERE r.bug_id = ?1
             ORDER BY s.captured_at ASC, s.rowid ASC",
        )?;
        let rows = stmt.query_map([bug_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut observations = Vec::new();
        for r in rows {
            let (execution_id, query_id, captured_at, fields_json) = r?;
            let mut fields: BTreeMap<String, FieldValue> = serde_json::from_str(&fields_json)?;
            observations.push(FieldObservation {
                execution_id: parse_id(&execution_id)?,
                query_id,
                captured_at: parse_ts(&captured_at)?,
                value: fields.remove(field),
            });
        }
        Ok(observations)
    }
}
