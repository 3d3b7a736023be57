use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::error::IngestError;
use crate::util::now_utc_string;

mod copy;
#[cfg(test)]
mod tests;

pub use copy::{CopyValue, StagingBuffer, copy_in};

pub const DB_SCHEMA_VERSION: &str = "0.3.0";

/// Hands out one dedicated connection per caller. Connections are never
/// shared between workers.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> Result<Connection, IngestError>;
}

#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    db_path: PathBuf,
    lock_timeout: Duration,
}

impl SqliteConnectionFactory {
    pub fn new(db_path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            db_path: db_path.into(),
            lock_timeout,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Opens one connection and makes sure every table exists.
    pub fn bootstrap(&self) -> Result<(), IngestError> {
        let connection = self.connect()?;
        ensure_schema(&connection)?;
        Ok(())
    }
}

impl ConnectionFactory for SqliteConnectionFactory {
    fn connect(&self) -> Result<Connection, IngestError> {
        let connection = Connection::open(&self.db_path)?;
        configure_connection(&connection, self.lock_timeout)?;
        debug!(path = %self.db_path.display(), "opened store connection");
        Ok(connection)
    }
}

fn configure_connection(connection: &Connection, lock_timeout: Duration) -> Result<(), IngestError> {
    connection.busy_timeout(lock_timeout)?;
    connection.pragma_update(None, "journal_mode", "WAL")?;
    connection.pragma_update(None, "synchronous", "NORMAL")?;
    connection.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<(), IngestError> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS document_versions (
          document_version_id INTEGER PRIMARY KEY AUTOINCREMENT,
          region TEXT NOT NULL,
          doc_type TEXT NOT NULL,
          version TEXT NOT NULL,
          effective_date TEXT NOT NULL,
          metadata TEXT NOT NULL,
          source_digest TEXT,
          loaded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS definition_items (
          item_id INTEGER PRIMARY KEY AUTOINCREMENT,
          document_version_id INTEGER NOT NULL,
          category TEXT NOT NULL CHECK (category IN ('admin', 'product', 'holiday')),
          code TEXT NOT NULL,
          group_name TEXT,
          description TEXT NOT NULL,
          taxable INTEGER,
          exempt INTEGER,
          included INTEGER,
          excluded INTEGER,
          threshold REAL,
          reference TEXT,
          comment TEXT,
          CHECK (NOT (taxable = 1 AND exempt = 1)),
          FOREIGN KEY(document_version_id) REFERENCES document_versions(document_version_id)
        );

        CREATE TABLE IF NOT EXISTS compliance_items (
          item_id INTEGER PRIMARY KEY AUTOINCREMENT,
          document_version_id INTEGER NOT NULL,
          section TEXT NOT NULL,
          question_number TEXT NOT NULL,
          topic TEXT NOT NULL,
          question_text TEXT NOT NULL,
          answer TEXT NOT NULL,
          compliance_met INTEGER,
          citation TEXT NOT NULL,
          effective_dates TEXT NOT NULL,
          notes TEXT NOT NULL,
          FOREIGN KEY(document_version_id) REFERENCES document_versions(document_version_id)
        );

        CREATE TABLE IF NOT EXISTS practice_items (
          item_id INTEGER PRIMARY KEY AUTOINCREMENT,
          document_version_id INTEGER NOT NULL,
          group_name TEXT NOT NULL,
          question_number TEXT NOT NULL,
          question_text TEXT NOT NULL,
          answer TEXT NOT NULL,
          compliance_met INTEGER,
          citation TEXT NOT NULL,
          notes TEXT NOT NULL,
          FOREIGN KEY(document_version_id) REFERENCES document_versions(document_version_id)
        );

        CREATE TABLE IF NOT EXISTS loading_status (
          digest TEXT PRIMARY KEY,
          region TEXT NOT NULL,
          doc_type TEXT NOT NULL,
          version TEXT NOT NULL,
          status TEXT NOT NULL CHECK (status IN ('started', 'completed', 'failed')),
          error TEXT,
          rows INTEGER,
          attempts INTEGER NOT NULL DEFAULT 0,
          started_at TEXT,
          completed_at TEXT,
          last_updated TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_document_versions_lookup
          ON document_versions(region, doc_type, version);
        CREATE INDEX IF NOT EXISTS idx_definition_items_doc ON definition_items(document_version_id);
        CREATE INDEX IF NOT EXISTS idx_compliance_items_doc ON compliance_items(document_version_id);
        CREATE INDEX IF NOT EXISTS idx_practice_items_doc ON practice_items(document_version_id);
        CREATE INDEX IF NOT EXISTS idx_loading_status_status ON loading_status(status);
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

pub fn count_rows(connection: &Connection, table: &str) -> Result<i64, IngestError> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    let count = connection.query_row(&sql, [], |row| row.get(0))?;
    Ok(count)
}
