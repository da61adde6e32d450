//! Database schema and migrations.
//!
//! History tables are append-only at the schema level: triggers abort any
//! update or delete of a snapshot or its bug rows, and any change to an
//! execution record once its outcome is final.

use rusqlite::Connection;

pub const DEFAULT_WORKPLACE: &str = "My Dashboard";
const SCHEMA_VERSION: i64 = 2;

/// Detail written on pending rows that lost the one-pending-per-query race
/// before the unique index existed.
pub const SUPERSEDED_REASON: &str = "superseded: another execution of the query was pending";

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS workplaces (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS queries (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            workplace_id INTEGER NOT NULL REFERENCES workplaces(id),
            tracker_filter TEXT NOT NULL,
            details TEXT,
            schedule_interval_secs INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS columns (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            tracker_field TEXT NOT NULL UNIQUE,
            data_type TEXT NOT NULL DEFAULT 'char'
        );

        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            query_id INTEGER NOT NULL REFERENCES queries(id),
            trigger_kind TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            outcome TEXT NOT NULL DEFAULT 'pending'
                CHECK (outcome IN ('pending', 'success', 'partial', 'failure')),
            error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            record_count INTEGER,
            bugs_added INTEGER,
            bugs_removed INTEGER,
            bugs_changed INTEGER,
            CHECK (ended_at IS NULL OR ended_at >= started_at)
        );
        CREATE INDEX IF NOT EXISTS idx_executions_query ON executions(query_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_executions_outcome ON executions(outcome);

        CREATE TRIGGER IF NOT EXISTS executions_final_once
        BEFORE UPDATE ON executions WHEN OLD.outcome <> 'pending'
        BEGIN
            SELECT RAISE(ABORT, 'execution record already finalized');
        END;

        CREATE TRIGGER IF NOT EXISTS executions_no_delete
        BEFORE DELETE ON executions
        BEGIN
            SELECT RAISE(ABORT, 'execution records are append-only');
        END;

        CREATE TABLE IF NOT EXISTS snapshots (
            execution_id TEXT PRIMARY KEY REFERENCES executions(id),
            query_id INTEGER NOT NULL REFERENCES queries(id),
            captured_at TEXT NOT NULL,
            complete INTEGER NOT NULL,
            record_count INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_query ON snapshots(query_id, captured_at);

        CREATE TABLE IF NOT EXISTS bug_records (
            execution_id TEXT NOT NULL REFERENCES snapshots(execution_id),
            bug_id INTEGER NOT NULL,
            fields_json TEXT NOT NULL,
            PRIMARY KEY (execution_id, bug_id)
        );
        CREATE INDEX IF NOT EXISTS idx_bug_records_bug ON bug_records(bug_id);

        CREATE TRIGGER IF NOT EXISTS snapshots_no_update
        BEFORE UPDATE ON snapshots
        BEGIN
            SELECT RAISE(ABORT, 'snapshots are append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS snapshots_no_delete
        BEFORE DELETE ON snapshots
        BEGIN
            SELECT RAISE(ABORT, 'snapshots are append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS bug_records_no_update
        BEFORE UPDATE ON bug_records
        BEGIN
            SELECT RAISE(ABORT, 'bug records are append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS bug_records_no_delete
        BEFORE DELETE ON bug_records
        BEGIN
            SELECT RAISE(ABORT, 'bug records are append-only');
        END;

        CREATE TABLE IF NOT EXISTS service_heartbeats (
            service_name TEXT PRIMARY KEY,
            last_heartbeat TEXT NOT NULL
        );",
    )?;

    // Migration: change counts on execution records
    for column in ["bugs_added", "bugs_removed", "bugs_changed"] {
        let present: i64 = conn.query_row(
            "SELECT count(*) FROM pragma_table_info('executions') WHERE name = ?1",
            [column],
            |row| row.get(0),
        )?;
        if present == 0 {
            conn.execute(&format!("ALTER TABLE executions ADD COLUMN {} INTEGER", column), [])?;
        }
    }

    // At most one pending execution per query, across processes. Only the
    // newest pending row of a query survives from before the index.
    conn.execute(
        "UPDATE executions
         SET outcome = 'failure', error = ?1, ended_at = started_at
         WHERE outcome = 'pending'
           AND rowid NOT IN (SELECT MAX(rowid) FROM executions WHERE outcome = 'pending' GROUP BY query_id)",
        [SUPERSEDED_REASON],
    )?;
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_pending
         ON executions(query_id) WHERE outcome = 'pending';",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO workplaces (name) VALUES (?1)",
        [DEFAULT_WORKPLACE],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
