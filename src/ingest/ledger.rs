//! Per-file load ledger keyed by content digest.
//!
//! Every status write is its own small transaction, separate from the data
//! load it describes, so a failed load still leaves its `failed` record.

use std::path::Path;

use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::warn;

use crate::error::IngestError;
use crate::model::{DocType, LoadStatus, PerformanceRow, SourceFile, StatusCount, StatusRecord};
use crate::util::{now_utc_string, sha256_file};

const STATUS_COLUMNS: &str = "digest, region, doc_type, version, status, error, rows, attempts, \
                              started_at, completed_at, last_updated";

impl FromSql for LoadStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        LoadStatus::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown load status {text:?}").into()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusUpdate<'a> {
    pub digest: &'a str,
    pub region: &'a str,
    pub doc_type: DocType,
    pub version: &'a str,
    pub status: LoadStatus,
    pub error: Option<&'a str>,
    pub rows: Option<usize>,
}

impl<'a> StatusUpdate<'a> {
    pub fn for_file(file: &'a SourceFile, digest: &'a str, status: LoadStatus) -> Self {
        Self {
            digest,
            region: &file.region,
            doc_type: file.doc_type,
            version: &file.version,
            status,
            error: None,
            rows: None,
        }
    }

    pub fn with_error(mut self, error: &'a str) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = Some(rows);
        self
    }
}

/// Identity of a file for change detection: the SHA-256 of its bytes.
pub fn file_digest(path: &Path) -> Result<String, IngestError> {
    Ok(sha256_file(path)?)
}

/// Inserts or updates the ledger row for `update.digest`. A failed status
/// bumps the attempt counter; `started` resets the completion time.
pub fn upsert_status(connection: &mut Connection, update: &StatusUpdate<'_>) -> Result<(), IngestError> {
    let result = write_status(connection, update, &now_utc_string());
    if let Err(err) = &result {
        warn!(
            digest = update.digest,
            status = update.status.as_str(),
            error = %err,
            "status write rolled back"
        );
    }
    result
}

fn write_status(connection: &mut Connection, update: &StatusUpdate<'_>, now: &str) -> Result<(), IngestError> {
    let tx = connection.transaction()?;
    tx.execute(
        "INSERT INTO loading_status(
           digest, region, doc_type, version, status, error, rows, attempts,
           started_at, completed_at, last_updated
         ) VALUES (
           ?1, ?2, ?3, ?4, ?5, ?6, ?7,
           CASE WHEN ?5 = 'failed' THEN 1 ELSE 0 END,
           CASE WHEN ?5 = 'started' THEN ?8 END,
           CASE WHEN ?5 IN ('completed', 'failed') THEN ?8 END,
           ?8
         )
         ON CONFLICT(digest) DO UPDATE SET
           region=excluded.region,
           doc_type=excluded.doc_type,
           version=excluded.version,
           status=excluded.status,
           error=excluded.error,
           rows=excluded.rows,
           attempts=loading_status.attempts + CASE WHEN excluded.status = 'failed' THEN 1 ELSE 0 END,
           started_at=CASE WHEN excluded.status = 'started' THEN excluded.last_updated
                           ELSE loading_status.started_at END,
           completed_at=CASE WHEN excluded.status = 'started' THEN NULL
                             ELSE excluded.last_updated END,
           last_updated=excluded.last_updated",
        params![
            update.digest,
            update.region,
            update.doc_type.as_str(),
            update.version,
            update.status.as_str(),
            update.error,
            update.rows.map(|rows| rows as i64),
            now,
        ],
    )?;
    // Dropping `tx` on an error above rolls the write back.
    tx.commit()?;
    Ok(())
}

/// True when no ledger record exists for `digest`.
pub fn is_new(connection: &Connection, digest: &str) -> Result<bool, IngestError> {
    let known = connection
        .query_row(
            "SELECT 1 FROM loading_status WHERE digest = ?1",
            [digest],
            |_| Ok(()),
        )
        .optional()?;
    Ok(known.is_none())
}

pub fn lookup(connection: &Connection, digest: &str) -> Result<Option<StatusRecord>, IngestError> {
    let sql = format!("SELECT {STATUS_COLUMNS} FROM loading_status WHERE digest = ?1");
    let record = connection.query_row(&sql, [digest], status_record).optional()?;
    Ok(record)
}

/// Failed records, newest first. With `ceiling`, only those whose attempt
/// count is still below it.
pub fn failed_loads(connection: &Connection, ceiling: Option<u32>) -> Result<Vec<StatusRecord>, IngestError> {
    let sql = format!(
        "SELECT {STATUS_COLUMNS} FROM loading_status
         WHERE status = 'failed' AND (?1 IS NULL OR attempts < ?1)
         ORDER BY last_updated DESC, digest"
    );
    let mut statement = connection.prepare(&sql)?;
    let records = statement
        .query_map([ceiling], status_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn performance_summary(connection: &Connection) -> Result<Vec<PerformanceRow>, IngestError> {
    let mut statement = connection.prepare(
        "SELECT doc_type,
                AVG(elapsed), MIN(elapsed), MAX(elapsed), COUNT(*)
         FROM (
           SELECT doc_type,
                  (julianday(completed_at) - julianday(started_at)) * 86400.0 AS elapsed
           FROM loading_status
           WHERE status = 'completed'
             AND started_at IS NOT NULL
             AND completed_at IS NOT NULL
         )
         GROUP BY doc_type
         ORDER BY doc_type",
    )?;
    let rows = statement
        .query_map([], |row| {
            Ok(PerformanceRow {
                doc_type: row.get(0)?,
                avg_seconds: row.get(1)?,
                min_seconds: row.get(2)?,
                max_seconds: row.get(3)?,
                sample_size: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Ledger activity within the last `days`, grouped by status.
pub fn status_summary(connection: &Connection, days: i64) -> Result<Vec<StatusCount>, IngestError> {
    let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut statement = connection.prepare(
        "SELECT status, COUNT(*), COUNT(DISTINCT region), COUNT(DISTINCT doc_type)
         FROM loading_status
         WHERE last_updated >= ?1
         GROUP BY status
         ORDER BY status",
    )?;
    let counts = statement
        .query_map([cutoff], |row| {
            Ok(StatusCount {
                status: row.get(0)?,
                count: row.get(1)?,
                regions: row.get(2)?,
                doc_types: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(counts)
}

fn status_record(row: &Row<'_>) -> rusqlite::Result<StatusRecord> {
    Ok(StatusRecord {
        digest: row.get(0)?,
        region: row.get(1)?,
        doc_type: row.get(2)?,
        version: row.get(3)?,
        status: row.get(4)?,
        error: row.get(5)?,
        rows: row.get(6)?,
        attempts: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        last_updated: row.get(10)?,
    })
}
