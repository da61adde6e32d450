//! Query and column configuration.
//!
//! The update service only reads this catalog; the insert/toggle helpers
//! exist for the administrative CLI.

use std::time::Duration;

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{Pool, StorageResult};

pub type QueryId = i64;

/// A stored tracker search plus its schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    pub id: QueryId,
    pub name: String,
    pub workplace_id: i64,
    pub workplace: String,
    pub tracker_filter: String,
    pub details: Option<String>,
    /// `None` means manual-only.
    pub schedule_interval_secs: Option<u64>,
    pub enabled: bool,
}

impl Query {
    pub fn schedule_interval(&self) -> Option<Duration> {
        self.schedule_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            workplace_id: row.get(2)?,
            workplace: row.get(3)?,
            tracker_filter: row.get(4)?,
            details: row.get(5)?,
            schedule_interval_secs: row.get::<_, Option<i64>>(6)?.map(|s| s.max(0) as u64),
            enabled: row.get::<_, i64>(7)? != 0,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Column {
    pub id: i64,
    pub name: String,
    pub tracker_field: String,
    pub data_type: String,
}

/// Input for [`Catalog::add_query`].
#[derive(Debug, Clone)]
pub struct NewQuery {
    pub name: String,
    pub workplace: String,
    pub tracker_filter: String,
    pub details: Option<String>,
    pub schedule_interval_secs: Option<u64>,
}

const QUERY_SELECT: &str = "SELECT q.id, q.name, q.workplace_id, w.name, q.tracker_filter, q.details,
            q.schedule_interval_secs, q.enabled
     FROM queries q JOIN workplaces w ON w.id = q.workplace_id";

#[derive(Clone)]
pub struct Catalog {
    pool: Pool,
}

impl Catalog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn list_queries(&self) -> StorageResult<Vec<Query>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY q.id", QUERY_SELECT))?;
        let rows = stmt.query_map([], Query::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_query(&self, id: QueryId) -> StorageResult<Option<Query>> {
        let conn = self.pool.get()?;
        let query = conn
            .query_row(&format!("{} WHERE q.id = ?1", QUERY_SELECT), [id], Query::from_row)
            .optional()?;
        Ok(query)
    }

    /// Tracker field names of every configured column.
    pub fn field_names(&self) -> StorageResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT tracker_field FROM columns ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_columns(&self) -> StorageResult<Vec<Column>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT id, name, tracker_field, data_type FROM columns ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Column {
                id: row.get(0)?,
                name: row.get(1)?,
                tracker_field: row.get(2)?,
                data_type: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Insert a query, creating its workplace if needed.
    pub fn add_query(&self, new: &NewQuery) -> StorageResult<QueryId> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO workplaces (name) VALUES (?1)",
            [&new.workplace],
        )?;
        let workplace_id: i64 = tx.query_row(
            "SELECT id FROM workplaces WHERE name = ?1",
            [&new.workplace],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO queries (name, workplace_id, tracker_filter, details, schedule_interval_secs, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                new.name,
                workplace_id,
                new.tracker_filter,
                new.details,
                new.schedule_interval_secs.map(|s| s as i64),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Returns false if the query does not exist.
    pub fn set_enabled(&self, id: QueryId, enabled: bool) -> StorageResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE queries SET enabled = ?1 WHERE id = ?2",
            params![enabled as i64, id],
        )?;
        Ok(changed > 0)
    }

    pub fn add_column(&self, name: &str, tracker_field: &str, data_type: &str) -> StorageResult<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO columns (name, tracker_field, data_type) VALUES (?1, ?2, ?3)",
            params![name, tracker_field, data_type],
        )?;
        Ok(conn.last_insert_rowid())
    }
}
