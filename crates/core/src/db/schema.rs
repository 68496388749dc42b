//! Database schema definitions and migration runner.
//!
//! Migrations are applied in order; the SQLite `user_version` pragma records
//! the last one applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order: `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS watermarks (
            stream      TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_runs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            stream          TEXT    NOT NULL,
            status          TEXT    NOT NULL DEFAULT 'running',
            watermark_from  TEXT    NOT NULL,
            watermark_to    TEXT,
            fetched         INTEGER NOT NULL DEFAULT 0,
            written         INTEGER NOT NULL DEFAULT 0,
            failed          INTEGER NOT NULL DEFAULT 0,
            job_id          TEXT,
            details         TEXT,
            started_at      TEXT    NOT NULL,
            completed_at    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_runs_stream ON sync_runs (stream);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT    NOT NULL,
            stream      TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        "#,
    ),
    (
        2,
        "per-record outcomes",
        r#"
        CREATE TABLE IF NOT EXISTS record_outcomes (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id      INTEGER NOT NULL REFERENCES sync_runs (id) ON DELETE CASCADE,
            source_id   TEXT    NOT NULL,
            target_id   TEXT,
            outcome     TEXT    NOT NULL CHECK (outcome IN ('pending', 'succeeded', 'failed', 'unmapped')),
            error       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_record_outcomes_run ON record_outcomes (run_id);
        "#,
    ),
    (
        3,
        "pinned watermark starting points",
        r#"
        CREATE TABLE IF NOT EXISTS watermark_origins (
            stream      TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            pinned_at   TEXT NOT NULL
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in [
            "watermarks",
            "watermark_origins",
            "sync_runs",
            "audit_log",
            "record_outcomes",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }
}
