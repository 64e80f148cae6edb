//! Version-tracked schema migrations for the libSQL result store.
//!
//! `_migrations` records which steps a database has seen; `run_migrations`
//! applies the missing ones in order.

use libsql::Connection;

use crate::error::StoreError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "task_results",
        sql: r#"
            CREATE TABLE IF NOT EXISTS task_results (
                task_id TEXT PRIMARY KEY,
                task_name TEXT NOT NULL,
                phase TEXT NOT NULL,
                version INTEGER NOT NULL,
                terminal INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_task_results_phase ON task_results(phase);
        "#,
    },
    Migration {
        version: 2,
        name: "expiry_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_task_results_expires_at
                ON task_results(expires_at) WHERE expires_at IS NOT NULL;
        "#,
    },
];

const CREATE_TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

fn migration_error(step: impl std::fmt::Display, e: libsql::Error) -> StoreError {
    StoreError::Migration(format!("{step}: {e}"))
}

/// Bring the schema up to date. Each pending step runs in its own transaction
/// together with its `_migrations` record.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(CREATE_TRACKING_TABLE, ())
        .await
        .map_err(|e| migration_error("create _migrations", e))?;

    let applied = schema_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    for step in pending {
        let label = format!("V{} ({})", step.version, step.name);
        tracing::info!(version = step.version, name = step.name, "Applying result store migration");

        let tx = conn
            .transaction()
            .await
            .map_err(|e| migration_error(&label, e))?;
        tx.execute_batch(step.sql)
            .await
            .map_err(|e| migration_error(&label, e))?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![step.version, step.name],
        )
        .await
        .map_err(|e| migration_error(&label, e))?;
        tx.commit().await.map_err(|e| migration_error(&label, e))?;
    }

    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| migration_error("read schema version", e))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| migration_error("read schema version", e))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| migration_error("decode schema version", e))
}
