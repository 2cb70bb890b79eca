//! libSQL backend: async `Store` trait implementation.
//!
//! A single connection sits behind a `tokio::sync::Mutex`. All DB access is
//! serialized, which is fine for our write-light workload and means a reader
//! never sees a half-applied multi-row write.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{
    FiredMark, MetricEvent, MetricSummary, ReportArtifact, ReportRef, RunCompletion, RunOutcome,
    RunQuery, RunRecord, RunSnapshot, Store,
};
use crate::worker::contract::{Context, MetricValue};
use crate::worker::descriptor::Cadence;

/// Wall-clock format used for scheduler anchors.
const FIRE_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// libSQL database store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        // Durable before acknowledged.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;",
        )
        .await
        .map_err(|e| StoreError::Unavailable(format!("Failed to set pragmas: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    /// Run raw SQL against the underlying connection.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(sql, ())
            .await
            .map_err(|e| StoreError::Write(format!("raw: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text order equals time order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string. Anything else is a corrupt row.
fn parse_datetime(field: &str, s: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| StoreError::Serialization(format!("{field} '{s}': {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn metric_columns(value: &MetricValue) -> (libsql::Value, libsql::Value) {
    match value {
        MetricValue::Number(n) => (libsql::Value::Real(*n), libsql::Value::Null),
        MetricValue::Text(s) => (libsql::Value::Null, libsql::Value::Text(s.clone())),
    }
}

fn metric_value(num: Option<f64>, text: Option<String>) -> MetricValue {
    match (num, text) {
        (Some(n), _) => MetricValue::Number(n),
        (None, Some(t)) => MetricValue::Text(t),
        (None, None) => MetricValue::Text(String::new()),
    }
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

const RUN_COLUMNS: &str = "id, worker_id, cadence, calendar_key, started_at, finished_at, outcome, error_message, result_payload";

/// Map a row selected with `RUN_COLUMNS` to a `RunRecord`.
fn row_to_run(row: &libsql::Row) -> Result<RunRecord, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Read(format!("run.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Serialization(format!("run.id '{id_str}': {e}")))?;
    let worker_id: String = row
        .get(1)
        .map_err(|e| StoreError::Read(format!("run.worker_id: {e}")))?;
    let cadence_str: Option<String> = row.get(2).ok();
    let calendar_key: Option<String> = row.get(3).ok();
    let started_str: String = row
        .get(4)
        .map_err(|e| StoreError::Read(format!("run.started_at: {e}")))?;
    let finished_str: Option<String> = row.get(5).ok();
    let outcome_str: Option<String> = row.get(6).ok();
    let error_message: Option<String> = row.get(7).ok();
    let payload_str: String = row.get(8).unwrap_or_else(|_| "null".to_string());

    let outcome = outcome_str
        .map(|s| s.parse::<RunOutcome>())
        .transpose()
        .map_err(StoreError::Serialization)?;

    Ok(RunRecord {
        id,
        worker_id,
        cadence: cadence_str.and_then(|s| s.parse().ok()),
        calendar_key,
        started_at: parse_datetime("run.started_at", &started_str)?,
        finished_at: finished_str
            .as_deref()
            .map(|s| parse_datetime("run.finished_at", s))
            .transpose()?,
        outcome,
        error_message,
        result_payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
    })
}

async fn collect_runs(mut rows: libsql::Rows) -> Result<Vec<RunRecord>, StoreError> {
    let mut runs = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| StoreError::Read(format!("runs: {e}")))?
    {
        runs.push(row_to_run(&row)?);
    }
    Ok(runs)
}

async fn insert_run(conn: &Connection, record: &RunRecord) -> Result<(), StoreError> {
    let payload = serde_json::to_string(&record.result_payload)
        .map_err(|e| StoreError::Serialization(format!("run payload: {e}")))?;
    conn.execute(
        &format!("INSERT INTO runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            record.id.to_string(),
            record.worker_id.clone(),
            opt_text(record.cadence.map(|c| c.as_str())),
            opt_text(record.calendar_key.as_deref()),
            fmt_ts(&record.started_at),
            opt_text(record.finished_at.map(|t| fmt_ts(&t)).as_deref()),
            opt_text(record.outcome.map(|o| o.to_string()).as_deref()),
            opt_text(record.error_message.as_deref()),
            payload,
        ],
    )
    .await
    .map_err(|e| StoreError::Write(format!("insert_run: {e}")))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(|e| StoreError::Unavailable(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| StoreError::Unavailable(format!("ping: {e}")))?;
        Ok(())
    }

    // ── Contexts ────────────────────────────────────────────────────

    async fn save_context(&self, worker_id: &str, context: &Context) -> Result<(), StoreError> {
        let json = serde_json::to_string(context)
            .map_err(|e| StoreError::Serialization(format!("context for {worker_id}: {e}")))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO worker_context (worker_id, context, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(worker_id) DO UPDATE SET context = excluded.context, updated_at = excluded.updated_at",
            params![worker_id, json, fmt_ts(&Utc::now())],
        )
        .await
        .map_err(|e| StoreError::Write(format!("save_context: {e}")))?;
        debug!(worker = worker_id, "Context saved");
        Ok(())
    }

    async fn load_context(&self, worker_id: &str) -> Result<Context, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT context FROM worker_context WHERE worker_id = ?1",
                params![worker_id],
            )
            .await
            .map_err(|e| StoreError::Read(format!("load_context: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Read(format!("load_context: {e}")))?
        {
            Some(row) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| StoreError::Read(format!("context column: {e}")))?;
                serde_json::from_str(&json).map_err(|e| {
                    StoreError::Serialization(format!("context for {worker_id}: {e}"))
                })
            }
            None => Ok(Context::Null),
        }
    }

    // ── Runs ────────────────────────────────────────────────────────

    async fn start_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        insert_run(&conn, record).await
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        completion: &RunCompletion,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&completion.result_payload)
            .map_err(|e| StoreError::Serialization(format!("run payload: {e}")))?;
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE runs SET finished_at = MAX(?1, started_at), outcome = ?2,
                     error_message = ?3, result_payload = ?4
                 WHERE id = ?5 AND finished_at IS NULL",
                params![
                    fmt_ts(&completion.finished_at),
                    completion.outcome.to_string(),
                    opt_text(completion.error_message.as_deref()),
                    payload,
                    run_id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Write(format!("finish_run: {e}")))?;

        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "in-flight run".to_string(),
                id: run_id.to_string(),
            });
        }
        Ok(())
    }

    async fn append_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        insert_run(&conn, record).await
    }

    async fn list_recent_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs
                     WHERE (?1 IS NULL OR worker_id = ?1) AND (?2 IS NULL OR started_at >= ?2)
                     ORDER BY started_at DESC, id DESC LIMIT ?3"
                ),
                params![
                    opt_text(query.worker_id.as_deref()),
                    opt_text(query.since.map(|t| fmt_ts(&t)).as_deref()),
                    to_limit(query.limit),
                ],
            )
            .await
            .map_err(|e| StoreError::Read(format!("list_recent_runs: {e}")))?;
        collect_runs(rows).await
    }

    async fn run_snapshot(&self) -> Result<RunSnapshot, StoreError> {
        let conn = self.conn.lock().await;
        // One statement, one read snapshot.
        let rows = conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs r
                     WHERE r.finished_at IS NULL
                        OR r.started_at = (
                            SELECT MAX(started_at) FROM runs
                            WHERE worker_id = r.worker_id AND finished_at IS NOT NULL
                        )
                     ORDER BY worker_id, started_at"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Read(format!("run_snapshot: {e}")))?;

        let (in_flight, latest_terminal): (Vec<_>, Vec<_>) = collect_runs(rows)
            .await?
            .into_iter()
            .partition(RunRecord::is_in_flight);
        Ok(RunSnapshot {
            in_flight,
            latest_terminal,
        })
    }

    async fn in_flight_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE finished_at IS NULL
                     ORDER BY started_at"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Read(format!("in_flight_runs: {e}")))?;
        collect_runs(rows).await
    }

    async fn recover_in_flight(&self, reason: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE runs SET finished_at = MAX(?1, started_at), outcome = 'failure',
                     error_message = ?2
                 WHERE finished_at IS NULL",
                params![fmt_ts(&Utc::now()), reason],
            )
            .await
            .map_err(|e| StoreError::Write(format!("recover_in_flight: {e}")))?;
        if updated > 0 {
            warn!(count = updated, reason, "Recovered in-flight runs");
        }
        Ok(updated as usize)
    }

    // ── Metrics ─────────────────────────────────────────────────────

    async fn append_metrics(&self, events: &[MetricEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| StoreError::Write(format!("append_metrics begin: {e}")))?;

        for event in events {
            let (num, text) = metric_columns(&event.value);
            tx.execute(
                "INSERT INTO metrics (worker_id, run_id, ts, name, value_num, value_text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.worker_id.clone(),
                    opt_text(event.run_id.map(|id| id.to_string()).as_deref()),
                    fmt_ts(&event.timestamp),
                    event.name.clone(),
                    num,
                    text,
                ],
            )
            .await
            .map_err(|e| StoreError::Write(format!("append_metrics: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Write(format!("append_metrics commit: {e}")))?;
        Ok(())
    }

    async fn list_metrics(
        &self,
        since: DateTime<Utc>,
        worker_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MetricEvent>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT worker_id, run_id, ts, name, value_num, value_text FROM metrics
                 WHERE ts >= ?1 AND (?2 IS NULL OR worker_id = ?2)
                 ORDER BY ts DESC, seq DESC LIMIT ?3",
                params![fmt_ts(&since), opt_text(worker_id), to_limit(limit)],
            )
            .await
            .map_err(|e| StoreError::Read(format!("list_metrics: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Read(format!("list_metrics: {e}")))?
        {
            let worker_id: String = row
                .get(0)
                .map_err(|e| StoreError::Read(format!("metric.worker_id: {e}")))?;
            let run_id: Option<String> = row.get(1).ok();
            let ts: String = row
                .get(2)
                .map_err(|e| StoreError::Read(format!("metric.ts: {e}")))?;
            let name: String = row
                .get(3)
                .map_err(|e| StoreError::Read(format!("metric.name: {e}")))?;
            events.push(MetricEvent {
                worker_id,
                run_id: run_id.and_then(|s| Uuid::parse_str(&s).ok()),
                timestamp: parse_datetime("metric.ts", &ts)?,
                name,
                value: metric_value(row.get::<f64>(4).ok(), row.get(5).ok()),
            });
        }
        Ok(events)
    }

    async fn metric_summaries(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSummary>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT name, value_num, value_text, ts, worker_id, cnt, total FROM (
                     SELECT name, value_num, value_text, ts, worker_id,
                            ROW_NUMBER() OVER (PARTITION BY name ORDER BY ts DESC, seq DESC) AS rn,
                            COUNT(*) OVER (PARTITION BY name) AS cnt,
                            SUM(value_num) OVER (PARTITION BY name) AS total
                     FROM metrics WHERE ts >= ?1
                 ) WHERE rn = 1 ORDER BY name",
                params![fmt_ts(&since)],
            )
            .await
            .map_err(|e| StoreError::Read(format!("metric_summaries: {e}")))?;

        let mut summaries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Read(format!("metric_summaries: {e}")))?
        {
            let name: String = row
                .get(0)
                .map_err(|e| StoreError::Read(format!("summary.name: {e}")))?;
            let ts: String = row
                .get(3)
                .map_err(|e| StoreError::Read(format!("summary.ts: {e}")))?;
            let latest_worker: String = row
                .get(4)
                .map_err(|e| StoreError::Read(format!("summary.worker_id: {e}")))?;
            let count: i64 = row.get(5).unwrap_or(0);
            summaries.push(MetricSummary {
                name,
                latest: metric_value(row.get::<f64>(1).ok(), row.get(2).ok()),
                latest_at: parse_datetime("summary.ts", &ts)?,
                latest_worker,
                count: count.max(0) as u64,
                sum: row.get::<f64>(6).ok(),
            });
        }
        Ok(summaries)
    }

    // ── Reports ─────────────────────────────────────────────────────

    async fn write_report(&self, report: &ReportArtifact) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO reports (cadence, calendar_key, content, generated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cadence, calendar_key) DO UPDATE SET
                 content = excluded.content, generated_at = excluded.generated_at",
            params![
                report.cadence.as_str(),
                report.calendar_key.clone(),
                report.content.clone(),
                fmt_ts(&report.generated_at),
            ],
        )
        .await
        .map_err(|e| StoreError::Write(format!("write_report: {e}")))?;
        Ok(())
    }

    async fn read_report(
        &self,
        cadence: Cadence,
        calendar_key: &str,
    ) -> Result<Option<ReportArtifact>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT content, generated_at FROM reports WHERE cadence = ?1 AND calendar_key = ?2",
                params![cadence.as_str(), calendar_key],
            )
            .await
            .map_err(|e| StoreError::Read(format!("read_report: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Read(format!("read_report: {e}")))?
        {
            Some(row) => {
                let content: String = row
                    .get(0)
                    .map_err(|e| StoreError::Read(format!("report.content: {e}")))?;
                let generated: String = row
                    .get(1)
                    .map_err(|e| StoreError::Read(format!("report.generated_at: {e}")))?;
                Ok(Some(ReportArtifact {
                    cadence,
                    calendar_key: calendar_key.to_string(),
                    generated_at: parse_datetime("report.generated_at", &generated)?,
                    content,
                }))
            }
            None => Ok(None),
        }
    }

    async fn list_reports(
        &self,
        cadence: Option<Cadence>,
        limit: usize,
    ) -> Result<Vec<ReportRef>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT cadence, calendar_key, generated_at, LENGTH(CAST(content AS BLOB))
                 FROM reports WHERE (?1 IS NULL OR cadence = ?1)
                 ORDER BY generated_at DESC, calendar_key DESC LIMIT ?2",
                params![opt_text(cadence.map(|c| c.as_str())), to_limit(limit)],
            )
            .await
            .map_err(|e| StoreError::Read(format!("list_reports: {e}")))?;

        let mut refs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Read(format!("list_reports: {e}")))?
        {
            let cadence_str: String = row
                .get(0)
                .map_err(|e| StoreError::Read(format!("report.cadence: {e}")))?;
            let cadence = cadence_str
                .parse::<Cadence>()
                .map_err(StoreError::Serialization)?;
            let calendar_key: String = row
                .get(1)
                .map_err(|e| StoreError::Read(format!("report.calendar_key: {e}")))?;
            let generated: String = row
                .get(2)
                .map_err(|e| StoreError::Read(format!("report.generated_at: {e}")))?;
            let size: i64 = row.get(3).unwrap_or(0);
            refs.push(ReportRef {
                cadence,
                calendar_key,
                generated_at: parse_datetime("report.generated_at", &generated)?,
                size: size.max(0) as u64,
            });
        }
        Ok(refs)
    }

    // ── Scheduler bookkeeping ───────────────────────────────────────

    async fn last_fired(&self, cadence: Cadence) -> Result<Option<FiredMark>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT calendar_key, fire_at FROM scheduler_state WHERE cadence = ?1",
                params![cadence.as_str()],
            )
            .await
            .map_err(|e| StoreError::Read(format!("last_fired: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Read(format!("last_fired: {e}")))?
        else {
            return Ok(None);
        };

        let calendar_key: String = row
            .get(0)
            .map_err(|e| StoreError::Serialization(format!("last_fired.calendar_key: {e}")))?;
        let fire_at_str: String = row
            .get(1)
            .map_err(|e| StoreError::Serialization(format!("last_fired.fire_at: {e}")))?;
        if calendar_key.trim().is_empty() {
            return Err(StoreError::Serialization(format!(
                "empty calendar key for {cadence}"
            )));
        }
        let fire_at = NaiveDateTime::parse_from_str(&fire_at_str, FIRE_AT_FORMAT).map_err(|e| {
            StoreError::Serialization(format!("fire_at '{fire_at_str}' for {cadence}: {e}"))
        })?;

        Ok(Some(FiredMark {
            cadence,
            calendar_key,
            fire_at,
        }))
    }

    async fn mark_fired(&self, mark: &FiredMark) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scheduler_state (cadence, calendar_key, fire_at, recorded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cadence) DO UPDATE SET
                 calendar_key = excluded.calendar_key,
                 fire_at = excluded.fire_at,
                 recorded_at = excluded.recorded_at",
            params![
                mark.cadence.as_str(),
                mark.calendar_key.clone(),
                mark.fire_at.format(FIRE_AT_FORMAT).to_string(),
                fmt_ts(&Utc::now()),
            ],
        )
        .await
        .map_err(|e| StoreError::Write(format!("mark_fired: {e}")))?;
        Ok(())
    }
}
