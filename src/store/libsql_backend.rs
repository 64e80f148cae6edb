//! libSQL result store.
//!
//! One row per task: the JSON-encoded `TaskState` plus the columns the
//! stale-write guard and expiry sweep need. Supports local file and
//! in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{PutOutcome, ResultStore, expiry_for};
use crate::task::{TaskId, TaskState};

/// libSQL-backed `ResultStore`.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlResultStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    ttl: Duration,
}

impl LibSqlResultStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, ttl: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db, ttl).await?;
        info!(path = %path.display(), "Result store opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory(ttl: Duration) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, ttl).await
    }

    async fn from_database(db: LibSqlDatabase, ttl: Duration) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            ttl,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamps so that text comparison orders them correctly.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_timestamp(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(timestamp(dt)),
        None => libsql::Value::Null,
    }
}

fn row_to_state(row: &libsql::Row) -> Result<TaskState, StoreError> {
    let raw: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("task_results row: {e}")))?;
    Ok(serde_json::from_str(&raw)?)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ResultStore for LibSqlResultStore {
    async fn put(&self, state: &TaskState) -> Result<PutOutcome, StoreError> {
        let encoded = serde_json::to_string(state)?;
        let changed = self
            .conn()
            .execute(
                "INSERT INTO task_results
                    (task_id, task_name, phase, version, terminal, state, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(task_id) DO UPDATE SET
                    task_name = excluded.task_name,
                    phase = excluded.phase,
                    version = excluded.version,
                    terminal = excluded.terminal,
                    state = excluded.state,
                    updated_at = excluded.updated_at,
                    expires_at = excluded.expires_at
                 WHERE task_results.terminal = 0 AND task_results.version < excluded.version",
                params![
                    state.task_id.to_string(),
                    state.task_name.as_str(),
                    state.phase.as_str(),
                    state.version as i64,
                    state.is_terminal() as i64,
                    encoded,
                    timestamp(state.updated_at),
                    opt_timestamp(expiry_for(state, self.ttl)),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("put: {e}")))?;

        if changed == 0 {
            debug!(task_id = %state.task_id, version = state.version, "Stale result write rejected");
            return Ok(PutOutcome::Stale);
        }
        Ok(PutOutcome::Written)
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskState>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state FROM task_results
                 WHERE task_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![task_id.to_string(), timestamp(Utc::now())],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_state(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get: {e}"))),
        }
    }

    async fn remove(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM task_results WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("remove: {e}")))?;
        Ok(count > 0)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM task_results WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![timestamp(Utc::now())],
            )
            .await
            .map_err(|e| StoreError::Query(format!("purge_expired: {e}")))?;

        if count > 0 {
            info!(count, "Purged expired task results");
        }
        Ok(count as usize)
    }
}
