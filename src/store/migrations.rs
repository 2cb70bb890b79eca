//! Schema migrations for the libSQL store.
//!
//! Versions are recorded in `schema_version`. Each pending migration and its
//! version row commit in one transaction, so a crash mid-upgrade leaves the
//! schema at the last complete version.

use libsql::Connection;

use crate::error::StoreError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered by version. Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "orchestrator_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS worker_context (
                worker_id TEXT PRIMARY KEY,
                context TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                cadence TEXT,
                calendar_key TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                outcome TEXT,
                error_message TEXT,
                result_payload TEXT NOT NULL DEFAULT 'null',
                UNIQUE (worker_id, started_at)
            );
            CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
            CREATE INDEX IF NOT EXISTS idx_runs_worker_started ON runs(worker_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_runs_in_flight ON runs(worker_id) WHERE finished_at IS NULL;

            CREATE TABLE IF NOT EXISTS metrics (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                worker_id TEXT NOT NULL,
                run_id TEXT,
                ts TEXT NOT NULL,
                name TEXT NOT NULL,
                value_num REAL,
                value_text TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics(ts);
            CREATE INDEX IF NOT EXISTS idx_metrics_worker_ts ON metrics(worker_id, ts);
            CREATE INDEX IF NOT EXISTS idx_metrics_name_ts ON metrics(name, ts);

            CREATE TABLE IF NOT EXISTS reports (
                cadence TEXT NOT NULL,
                calendar_key TEXT NOT NULL,
                content TEXT NOT NULL,
                generated_at TEXT NOT NULL,
                PRIMARY KEY (cadence, calendar_key)
            );
            CREATE INDEX IF NOT EXISTS idx_reports_generated ON reports(generated_at);
        "#,
    },
    Migration {
        version: 2,
        name: "scheduler_state",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduler_state (
                cadence TEXT PRIMARY KEY,
                calendar_key TEXT NOT NULL,
                fire_at TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
        "#,
    },
];

/// Apply every migration newer than the recorded version. Returns how many ran.
pub async fn run_migrations(conn: &Connection) -> Result<usize, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("creating schema_version: {e}")))?;

    let from = current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();

    for step in &pending {
        apply(conn, step).await?;
    }

    if !pending.is_empty() {
        tracing::info!(
            from,
            to = pending.last().map_or(from, |m| m.version),
            applied = pending.len(),
            "Schema upgraded"
        );
    }
    Ok(pending.len())
}

async fn apply(conn: &Connection, step: &Migration) -> Result<(), StoreError> {
    let failed =
        |e: libsql::Error| StoreError::Migration(format!("V{} {}: {e}", step.version, step.name));

    let tx = conn.transaction().await.map_err(failed)?;
    tx.execute_batch(step.sql).await.map_err(failed)?;
    tx.execute(
        "INSERT INTO schema_version (version, name) VALUES (?1, ?2)",
        libsql::params![step.version, step.name],
    )
    .await
    .map_err(failed)?;
    tx.commit().await.map_err(failed)?;
    Ok(())
}

/// Highest recorded version; 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(|e| StoreError::Migration(format!("reading schema_version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("reading schema_version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(StoreError::Migration(format!("reading schema_version: {e}"))),
    }
}
