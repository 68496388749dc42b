//! Typed query helpers for every table in the crmsync database.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{JobItem, MappingFailure, RecordOutcome};

// ---------------------------------------------------------------------------
// Row structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `watermarks` table.
#[derive(Debug, Clone, Serialize)]
pub struct WatermarkEntry {
    pub stream: String,
    pub value: String,
    pub updated_at: String,
}

/// A row from the `sync_runs` table.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunEntry {
    pub id: i64,
    pub stream: String,
    pub status: String,
    pub watermark_from: String,
    pub watermark_to: Option<String>,
    pub fetched: i64,
    pub written: i64,
    pub failed: i64,
    pub job_id: Option<String>,
    pub details: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Final figures written when a run completes.
#[derive(Debug, Clone, Default)]
pub struct SyncRunCompletion<'a> {
    pub status: &'a str,
    pub watermark_to: Option<&'a str>,
    pub fetched: usize,
    pub written: usize,
    pub failed: usize,
    pub job_id: Option<&'a str>,
    pub details: Option<&'a str>,
}

/// A row from the `record_outcomes` table.
#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcomeEntry {
    pub source_id: String,
    pub target_id: Option<String>,
    pub outcome: String,
    pub error: Option<String>,
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub stream: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

/// Read a stream's stored watermark value.
pub(crate) fn read_watermark(conn: &Connection, stream: &str) -> Result<Option<String>, DatabaseError> {
    let value = conn
        .query_row(
            "SELECT value FROM watermarks WHERE stream = ?1",
            params![stream],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Upsert a stream's watermark value.
pub(crate) fn write_watermark(conn: &Connection, stream: &str, value: &str) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO watermarks (stream, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(stream) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![stream, value, now],
    )?;
    debug!(stream, value, "wrote watermark");
    Ok(())
}

/// Read the starting point pinned for a stream that has never advanced.
pub(crate) fn read_watermark_origin(conn: &Connection, stream: &str) -> Result<Option<String>, DatabaseError> {
    let value = conn
        .query_row(
            "SELECT value FROM watermark_origins WHERE stream = ?1",
            params![stream],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Pin a stream's starting point. An existing pin is kept.
pub(crate) fn write_watermark_origin(conn: &Connection, stream: &str, value: &str) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO watermark_origins (stream, value, pinned_at) VALUES (?1, ?2, ?3)",
        params![stream, value, now],
    )?;
    debug!(stream, value, "pinned watermark origin");
    Ok(())
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- watermarks ---------------------------------------------------------

    /// Get the raw watermark value for a stream.
    pub fn get_watermark(&self, stream: &str) -> Result<Option<String>, DatabaseError> {
        read_watermark(&self.conn(), stream)
    }

    /// List all watermarks.
    pub fn list_watermarks(&self) -> Result<Vec<WatermarkEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT stream, value, updated_at FROM watermarks ORDER BY stream")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(WatermarkEntry {
                    stream: row.get(0)?,
                    value: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- sync_runs ----------------------------------------------------------

    /// Record the start of a sync cycle.
    pub fn start_sync_run(&self, stream: &str, watermark_from: &str) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_runs (stream, watermark_from, started_at) VALUES (?1, ?2, ?3)",
            params![stream, watermark_from, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, stream, "started sync run");
        Ok(id)
    }

    /// Mark a sync run as completed.
    pub fn complete_sync_run(&self, id: i64, done: &SyncRunCompletion<'_>) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sync_runs
             SET status = ?1, watermark_to = ?2, fetched = ?3, written = ?4, failed = ?5,
                 job_id = ?6, details = ?7, completed_at = ?8
             WHERE id = ?9",
            params![
                done.status,
                done.watermark_to,
                done.fetched as i64,
                done.written as i64,
                done.failed as i64,
                done.job_id,
                done.details,
                now,
                id
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "sync_run".into(),
                id: id.to_string(),
            });
        }
        debug!(id, status = done.status, "completed sync run");
        Ok(())
    }

    /// Most recent runs for a stream, newest first.
    pub fn list_sync_runs(&self, stream: &str, limit: u32) -> Result<Vec<SyncRunEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, stream, status, watermark_from, watermark_to, fetched, written, failed,
                    job_id, details, started_at, completed_at
             FROM sync_runs WHERE stream = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![stream, limit], |row| {
                Ok(SyncRunEntry {
                    id: row.get(0)?,
                    stream: row.get(1)?,
                    status: row.get(2)?,
                    watermark_from: row.get(3)?,
                    watermark_to: row.get(4)?,
                    fetched: row.get(5)?,
                    written: row.get(6)?,
                    failed: row.get(7)?,
                    job_id: row.get(8)?,
                    details: row.get(9)?,
                    started_at: row.get(10)?,
                    completed_at: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- record_outcomes ----------------------------------------------------

    /// Persist the per-record detail of a run in one transaction.
    pub fn insert_record_outcomes(
        &self,
        run_id: i64,
        items: &[JobItem],
        unmapped: &[MappingFailure],
    ) -> Result<(), DatabaseError> {
        self.transaction(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO record_outcomes (run_id, source_id, target_id, outcome, error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for item in items {
                let (target_id, error) = match &item.outcome {
                    RecordOutcome::Succeeded { target_id, .. } => (Some(target_id.as_str()), None),
                    RecordOutcome::Failed { error, .. } => (None, Some(error.as_str())),
                    RecordOutcome::Pending => (None, None),
                };
                stmt.execute(params![
                    run_id,
                    item.source_id.as_str(),
                    target_id,
                    item.outcome.label(),
                    error
                ])?;
            }
            for failure in unmapped {
                stmt.execute(params![
                    run_id,
                    failure.source_id.as_str(),
                    Option::<&str>::None,
                    "unmapped",
                    failure.error
                ])?;
            }
            Ok(())
        })
    }

    /// Per-record detail for one run.
    pub fn list_record_outcomes(&self, run_id: i64) -> Result<Vec<RecordOutcomeEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, outcome, error
             FROM record_outcomes WHERE run_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(RecordOutcomeEntry {
                    source_id: row.get(0)?,
                    target_id: row.get(1)?,
                    outcome: row.get(2)?,
                    error: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit-log entry.
    pub fn insert_audit_log(
        &self,
        action: &str,
        stream: Option<&str>,
        details: Option<&str>,
        success: bool,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, stream, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![action, stream, details, success, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action, "inserted audit_log entry");
        Ok(id)
    }

    /// Return the most recent N audit-log entries.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, stream, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    stream: row.get(2)?,
                    details: row.get(3)?,
                    success: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count failed audit entries.
    pub fn count_errors(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM audit_log WHERE success = 0", [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }
}
