//! Status aggregator: read-only views over the store for the dashboard.
//!
//! Nothing here writes. Every record comes out of the store whole, so a
//! concurrent batch can make a view slightly stale but never torn.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::store::traits::{
    self, MetricEvent, MetricSummary, ReportArtifact, ReportRef, RunOutcome, Store,
};
use crate::worker::descriptor::Cadence;
use crate::worker::registry::WorkerRegistry;

/// Metrics window used when the client does not ask for one.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Longest accepted metrics window.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 3600);

/// Raw events returned alongside the metric summary.
pub const RECENT_METRICS: usize = 100;

/// Health threshold: share of started workers not in `Failed`.
const HEALTHY_RATIO: f64 = 0.7;

/// Derived state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Active,
    Idle,
    Failed,
    NotStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub display_name: String,
    pub category: String,
    pub cadence: Cadence,
    pub schedule: String,
    pub enabled: bool,
    pub state: WorkerState,
    pub last_outcome: Option<RunOutcome>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall_health: Health,
    pub active_workers: usize,
    pub failed_workers: usize,
    pub total_workers: usize,
    pub health_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub workers: BTreeMap<String, WorkerStatus>,
    pub system_health: SystemHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub window_secs: u64,
    pub since: DateTime<Utc>,
    pub summary: BTreeMap<String, MetricSummary>,
    pub recent: Vec<MetricEvent>,
}

pub struct StatusAggregator {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn Store>,
}

impl StatusAggregator {
    pub fn new(registry: Arc<WorkerRegistry>, store: Arc<dyn Store>) -> Self {
        Self { registry, store }
    }

    /// Current state of every registered worker plus overall health.
    pub async fn get_status(&self) -> Result<StatusSnapshot, StoreError> {
        let snapshot = self.store.run_snapshot().await?;
        let terminal: HashMap<String, _> = snapshot
            .latest_terminal
            .into_iter()
            .map(|r| (r.worker_id.clone(), r))
            .collect();
        let in_flight: HashMap<String, _> = snapshot
            .in_flight
            .into_iter()
            .map(|r| (r.worker_id.clone(), r))
            .collect();

        let mut workers = BTreeMap::new();
        for d in self.registry.descriptors() {
            let last = terminal.get(&d.id);
            let state = if in_flight.contains_key(&d.id) {
                WorkerState::Active
            } else {
                match last.and_then(|r| r.outcome) {
                    Some(RunOutcome::Success) => WorkerState::Idle,
                    Some(_) => WorkerState::Failed,
                    None => WorkerState::NotStarted,
                }
            };
            let last_run_at = in_flight
                .get(&d.id)
                .map(|r| r.started_at)
                .or_else(|| last.map(|r| r.started_at));

            workers.insert(
                d.id.clone(),
                WorkerStatus {
                    worker_id: d.id.clone(),
                    display_name: d.display_name.clone(),
                    category: d.category.clone(),
                    cadence: d.cadence(),
                    schedule: d.schedule.to_string(),
                    enabled: d.enabled,
                    state,
                    last_outcome: last.and_then(|r| r.outcome),
                    last_run_at,
                    last_error: last.and_then(|r| r.error_message.clone()),
                },
            );
        }

        let system_health = system_health(workers.values().map(|w| w.state));
        Ok(StatusSnapshot {
            generated_at: traits::now(),
            workers,
            system_health,
        })
    }

    /// Latest value and aggregates per metric name over `window`, plus the
    /// most recent raw events.
    pub async fn get_metrics_summary(
        &self,
        window: Duration,
    ) -> Result<MetricsSnapshot, StoreError> {
        let window = window.min(MAX_WINDOW);
        let span = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::days(1));
        let since = traits::now() - span;

        let summary = self
            .store
            .metric_summaries(since)
            .await?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        let recent = self.store.list_metrics(since, None, RECENT_METRICS).await?;

        Ok(MetricsSnapshot {
            window_secs: window.as_secs(),
            since,
            summary,
            recent,
        })
    }

    pub async fn list_reports(
        &self,
        cadence: Option<Cadence>,
        limit: usize,
    ) -> Result<Vec<ReportRef>, StoreError> {
        self.store.list_reports(cadence, limit).await
    }

    pub async fn get_report(
        &self,
        cadence: Cadence,
        calendar_key: &str,
    ) -> Result<Option<ReportArtifact>, StoreError> {
        self.store.read_report(cadence, calendar_key).await
    }

    /// Whether the store can be reached at all.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }
}

fn system_health(states: impl Iterator<Item = WorkerState>) -> SystemHealth {
    let (mut total, mut started, mut active, mut failed) = (0, 0, 0, 0);
    for state in states {
        total += 1;
        match state {
            WorkerState::NotStarted => continue,
            WorkerState::Active => active += 1,
            WorkerState::Failed => failed += 1,
            WorkerState::Idle => {}
        }
        started += 1;
    }

    let ratio = if started == 0 {
        1.0
    } else {
        (started - failed) as f64 / started as f64
    };
    SystemHealth {
        overall_health: if ratio >= HEALTHY_RATIO {
            Health::Healthy
        } else {
            Health::Degraded
        },
        active_workers: active,
        failed_workers: failed,
        total_workers: total,
        health_percentage: (ratio * 1000.0).round() / 10.0,
    }
}

/// Parse a metrics window: `30m`, `24h`, `7d`, `90s` or plain seconds.
pub fn parse_window(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid window '{raw}'"))?;
    let secs = match unit {
        "s" => amount,
        "m" => amount.saturating_mul(60),
        "h" => amount.saturating_mul(3600),
        "d" => amount.saturating_mul(86_400),
        _ => return Err(format!("invalid window unit in '{raw}' (use s, m, h or d)")),
    };
    if secs == 0 {
        return Err("window must be positive".to_string());
    }
    Ok(Duration::from_secs(secs).min(MAX_WINDOW))
}
