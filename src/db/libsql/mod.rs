//! libSQL backend for the hub store traits.
//!
//! Embedded SQLite-compatible storage with two modes:
//! - Local file (production default)
//! - In-memory (tests)

mod catalog;
mod keys;
mod policy;
mod runs;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};

use crate::db::{CatalogStore, HubStore, PolicyStore, RunStore, libsql_migrations};
use crate::domain::{self, State};
use crate::error::AppError;

/// Tables the schema precheck requires before the hub will serve.
const REQUIRED_TABLES: [&str; 11] = [
    "tasks",
    "notes",
    "changelog",
    "benchmarks",
    "agent_runs",
    "prompt_attempts",
    "run_events",
    "agent_api_keys",
    "idempotency_keys",
    "orchestration_policy",
    "policy_caps",
];

/// libSQL database backend.
///
/// Holds one connection created at build time and hands out clones of it.
/// In-memory libSQL databases are connection-local, so fresh connections per
/// operation would each see an empty database; cloning one handle keeps
/// `:memory:` usable for tests and costs nothing for file databases.
pub struct LibSqlBackend {
    _db: LibSqlDatabase,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local embedded database file.
    pub async fn new_local(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::internal_with("failed to create database directory", e)
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| AppError::internal_with("failed to open libSQL database", e))?;
        Self::from_database(db).await
    }

    /// In-memory database for tests.
    pub async fn new_memory() -> Result<Self, AppError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| AppError::internal_with("failed to create in-memory database", e))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, AppError> {
        let conn = db
            .connect()
            .map_err(|e| AppError::internal_with("failed to create connection", e))?;
        // Concurrent writers wait up to 5 seconds instead of failing instantly
        // with "database is locked".
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| AppError::internal_with("failed to set busy_timeout", e))?;
        // Run/attempt/event cascade deletes rely on enforced foreign keys.
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| AppError::internal_with("failed to enable foreign keys", e))?;
        Ok(Self { _db: db, conn })
    }

    pub(crate) fn conn(&self) -> Connection {
        self.conn.clone()
    }
}

#[async_trait]
impl HubStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), AppError> {
        let conn = self.conn();
        // WAL persists in the database file: readers stop blocking writers.
        conn.query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| AppError::internal_with("failed to enable WAL mode", e))?;
        conn.execute_batch(libsql_migrations::SCHEMA)
            .await
            .map_err(|e| AppError::internal_with("libSQL migration failed", e))?;
        Ok(())
    }

    async fn verify_schema_ready(&self) -> Result<(), AppError> {
        let conn = self.conn();
        for table in REQUIRED_TABLES {
            let mut rows = conn
                .query(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    libsql::params![table],
                )
                .await
                .map_err(|e| AppError::internal_with("failed to verify database schema", e))?;
            let present = rows
                .next()
                .await
                .map_err(|e| AppError::internal_with("failed to verify database schema", e))?
                .is_some();
            if !present {
                return Err(AppError::failed_precondition(format!(
                    "required table {table:?} is missing; run migrations before starting modeloman",
                )));
            }
        }
        Ok(())
    }

    async fn export_state(&self) -> Result<State, AppError> {
        Ok(State {
            tasks: self.list_tasks().await?,
            notes: self.list_notes().await?,
            changelog: self.list_changelog().await?,
            benchmarks: self.list_benchmarks().await?,
            runs: self.list_runs().await?,
            attempts: self.list_prompt_attempts("").await?,
            run_events: self.list_run_events("").await?,
            policy: self.get_policy().await?,
            policy_caps: self.list_policy_caps().await?,
        })
    }
}

// ==================== Helper functions ====================

/// Canonical timestamp format for storage: RFC 3339 with exactly nine
/// fractional digits, so `TEXT` comparison in SQL is chronological.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    domain::ts::to_string(dt)
}

pub(crate) fn opt_ts_value(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

pub(crate) fn text(s: impl Into<String>) -> libsql::Value {
    libsql::Value::Text(s.into())
}

/// Extract a text column, returning empty string for NULL.
pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

pub(crate) fn get_f64(row: &libsql::Row, idx: i32) -> f64 {
    row.get::<f64>(idx).unwrap_or(0.0)
}

pub(crate) fn get_bool(row: &libsql::Row, idx: i32) -> bool {
    row.get::<i64>(idx).unwrap_or(0) != 0
}

/// Parse a timestamp column. NULL or unparseable values surface as the Unix
/// epoch so the defect is detectable rather than replaced by the current time.
pub(crate) fn get_ts(row: &libsql::Row, idx: i32) -> DateTime<Utc> {
    match row.get::<String>(idx) {
        Ok(s) => match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!("timestamp parse failure at column {}: {}", idx, e);
                DateTime::UNIX_EPOCH
            }
        },
        Err(_) => DateTime::UNIX_EPOCH,
    }
}

/// Parse an optional timestamp column. Returns None for SQL NULL.
pub(crate) fn get_opt_ts(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    match row.get::<String>(idx) {
        Ok(s) if s.is_empty() => None,
        Ok(s) => match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!("timestamp parse failure at column {}: {}", idx, e);
                None
            }
        },
        Err(_) => None,
    }
}

/// Parse a JSON string-array column (tag and scope sets).
pub(crate) fn get_json_string_array(row: &libsql::Row, idx: i32) -> Vec<String> {
    match row.get::<String>(idx) {
        Ok(s) if s.is_empty() => Vec::new(),
        Ok(s) => serde_json::from_str::<Vec<String>>(&s).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

pub(crate) fn json_string_array(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use crate::db::HubStore;
    use crate::db::libsql::LibSqlBackend;

    #[tokio::test]
    async fn test_precheck_passes_after_migrations() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.run_migrations().await.unwrap();
        backend.verify_schema_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_precheck_fails_on_empty_database() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let err = backend.verify_schema_ready().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::FailedPrecondition);
        assert!(err.message.contains("tasks"), "message: {}", err.message);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.run_migrations().await.unwrap();
        backend.run_migrations().await.unwrap();
        backend.verify_schema_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_on_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.db");
        let backend = LibSqlBackend::new_local(&path).await.unwrap();
        backend.run_migrations().await.unwrap();
        backend.verify_schema_ready().await.unwrap();
    }
}
