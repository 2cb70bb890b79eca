//! `Store` trait: single async interface for all orchestrator persistence.
//!
//! Runs and metrics are logs: appended, never reordered or rewritten. Worker
//! contexts are last-write-wins. Reports are derived views keyed by
//! `(cadence, calendar_key)` and overwritten on regeneration.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::worker::contract::{Context, MetricValue};
use crate::worker::descriptor::Cadence;

/// Current time at the precision the store keeps (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
    Timeout,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::Failure => write!(f, "failure"),
            RunOutcome::Timeout => write!(f, "timeout"),
        }
    }
}

impl FromStr for RunOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "failure" => Ok(RunOutcome::Failure),
            "timeout" => Ok(RunOutcome::Timeout),
            other => Err(format!("unknown run outcome: {other}")),
        }
    }
}

/// One execution attempt of a worker.
///
/// A record without `finished_at`/`outcome` is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub worker_id: String,
    pub cadence: Option<Cadence>,
    pub calendar_key: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub error_message: Option<String>,
    /// Opaque data returned by the worker.
    pub result_payload: serde_json::Value,
}

impl RunRecord {
    /// A new in-flight record starting now.
    pub fn start(worker_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id: worker_id.into(),
            cadence: None,
            calendar_key: None,
            started_at: now(),
            finished_at: None,
            outcome: None,
            error_message: None,
            result_payload: serde_json::Value::Null,
        }
    }

    pub fn for_batch(mut self, cadence: Cadence, calendar_key: impl Into<String>) -> Self {
        self.cadence = Some(cadence);
        self.calendar_key = Some(calendar_key.into());
        self
    }

    /// Apply a completion, producing the terminal record.
    pub fn finish(mut self, completion: RunCompletion) -> Self {
        self.finished_at = Some(completion.finished_at.max(self.started_at));
        self.outcome = Some(completion.outcome);
        self.error_message = completion.error_message;
        self.result_payload = completion.result_payload;
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// Terminal fields written exactly once when a run finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Present iff `outcome` is not `Success`.
    pub error_message: Option<String>,
    pub result_payload: serde_json::Value,
}

impl RunCompletion {
    pub fn success(result_payload: serde_json::Value) -> Self {
        Self {
            finished_at: now(),
            outcome: RunOutcome::Success,
            error_message: None,
            result_payload,
        }
    }

    pub fn failed(outcome: RunOutcome, error: impl Into<String>) -> Self {
        Self {
            finished_at: now(),
            outcome,
            error_message: Some(error.into()),
            result_payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, result_payload: serde_json::Value) -> Self {
        self.result_payload = result_payload;
        self
    }
}

/// One named observation emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub worker_id: String,
    pub run_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: MetricValue,
}

/// Per-name aggregate over a metrics window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub name: String,
    pub latest: MetricValue,
    pub latest_at: DateTime<Utc>,
    pub latest_worker: String,
    pub count: u64,
    /// Sum over numeric observations, `None` if there were none.
    pub sum: Option<f64>,
}

/// A generated human-readable summary for one batch occurrence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportArtifact {
    pub cadence: Cadence,
    pub calendar_key: String,
    pub generated_at: DateTime<Utc>,
    pub content: String,
}

/// Listing entry for a report, without its content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRef {
    pub cadence: Cadence,
    pub calendar_key: String,
    pub generated_at: DateTime<Utc>,
    pub size: u64,
}

/// Every in-flight run plus each worker's latest terminal run, taken from
/// one read so a run finishing concurrently is seen in exactly one list.
#[derive(Debug, Clone, Default)]
pub struct RunSnapshot {
    pub in_flight: Vec<RunRecord>,
    pub latest_terminal: Vec<RunRecord>,
}

/// Scheduler bookkeeping: the last occurrence fired for a cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredMark {
    pub cadence: Cadence,
    pub calendar_key: String,
    /// Wall-clock anchor instant of the fired occurrence.
    pub fire_at: NaiveDateTime,
}

/// Filter for `list_recent_runs`.
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub worker_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl RunQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn for_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}

/// Backend-agnostic store covering contexts, runs, metrics, reports and
/// scheduler bookkeeping. All methods are safe under concurrent callers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;

    // ── Contexts ────────────────────────────────────────────────────

    /// Atomically replace a worker's context.
    async fn save_context(&self, worker_id: &str, context: &Context) -> Result<(), StoreError>;

    /// Most recently saved context, or `Context::Null` if none exists.
    async fn load_context(&self, worker_id: &str) -> Result<Context, StoreError>;

    // ── Runs ────────────────────────────────────────────────────────

    /// Record a run as in flight.
    async fn start_run(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Finalize an in-flight run. Fails with `NotFound` if it is not in flight.
    async fn finish_run(&self, run_id: Uuid, completion: &RunCompletion)
    -> Result<(), StoreError>;

    /// Append an already-terminal run.
    async fn append_run(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Runs newest first, filtered by worker and start time.
    async fn list_recent_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>, StoreError>;

    /// In-flight runs and the latest terminal run of every worker, read atomically.
    async fn run_snapshot(&self) -> Result<RunSnapshot, StoreError>;

    /// All runs currently in flight.
    async fn in_flight_runs(&self) -> Result<Vec<RunRecord>, StoreError>;

    /// Finalize every in-flight run as a failure. Returns the number recovered.
    async fn recover_in_flight(&self, reason: &str) -> Result<usize, StoreError>;

    // ── Metrics ─────────────────────────────────────────────────────

    /// Append events in one unit; either all land or none do.
    async fn append_metrics(&self, events: &[MetricEvent]) -> Result<(), StoreError>;

    /// Events at or after `since`, newest first.
    async fn list_metrics(
        &self,
        since: DateTime<Utc>,
        worker_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MetricEvent>, StoreError>;

    /// Latest value and aggregates per metric name since `since`.
    async fn metric_summaries(&self, since: DateTime<Utc>)
    -> Result<Vec<MetricSummary>, StoreError>;

    // ── Reports ─────────────────────────────────────────────────────

    /// Write a report, replacing any existing one for the same key.
    async fn write_report(&self, report: &ReportArtifact) -> Result<(), StoreError>;

    async fn read_report(
        &self,
        cadence: Cadence,
        calendar_key: &str,
    ) -> Result<Option<ReportArtifact>, StoreError>;

    /// Report references newest first.
    async fn list_reports(
        &self,
        cadence: Option<Cadence>,
        limit: usize,
    ) -> Result<Vec<ReportRef>, StoreError>;

    // ── Scheduler bookkeeping ───────────────────────────────────────

    /// Last fired occurrence for a cadence. `Serialization` means the row is corrupt.
    async fn last_fired(&self, cadence: Cadence) -> Result<Option<FiredMark>, StoreError>;

    async fn mark_fired(&self, mark: &FiredMark) -> Result<(), StoreError>;
}
