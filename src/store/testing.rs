//! Test double: a real in-memory store with injectable faults.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::libsql_backend::LibSqlStore;
use crate::store::traits::{
    FiredMark, MetricEvent, MetricSummary, ReportArtifact, ReportRef, RunCompletion, RunQuery,
    RunRecord, RunSnapshot, Store,
};
use crate::worker::contract::Context;
use crate::worker::descriptor::Cadence;

/// Delegates to a [`LibSqlStore`] unless told to misbehave.
pub(crate) struct HookedStore {
    pub inner: LibSqlStore,
    /// Refuse every `save_context`.
    pub fail_context_writes: AtomicBool,
    /// Finish this run right after the next `run_snapshot` has been read.
    pub finish_after_snapshot: Mutex<Option<(Uuid, RunCompletion)>>,
    /// Panic on any non-empty `append_metrics`.
    pub panic_on_metrics: AtomicBool,
}

impl HookedStore {
    pub async fn new() -> Self {
        Self {
            inner: LibSqlStore::new_memory().await.unwrap(),
            fail_context_writes: AtomicBool::new(false),
            finish_after_snapshot: Mutex::new(None),
            panic_on_metrics: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Store for HookedStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
    async fn save_context(&self, worker_id: &str, context: &Context) -> Result<(), StoreError> {
        if self.fail_context_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write("disk full".to_string()));
        }
        self.inner.save_context(worker_id, context).await
    }
    async fn load_context(&self, worker_id: &str) -> Result<Context, StoreError> {
        self.inner.load_context(worker_id).await
    }
    async fn start_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.inner.start_run(record).await
    }
    async fn finish_run(&self, run_id: Uuid, completion: &RunCompletion) -> Result<(), StoreError> {
        self.inner.finish_run(run_id, completion).await
    }
    async fn append_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.inner.append_run(record).await
    }
    async fn list_recent_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.list_recent_runs(query).await
    }
    async fn run_snapshot(&self) -> Result<RunSnapshot, StoreError> {
        let snapshot = self.inner.run_snapshot().await?;
        let pending = self.finish_after_snapshot.lock().unwrap().take();
        if let Some((run_id, completion)) = pending {
            self.inner.finish_run(run_id, &completion).await?;
        }
        Ok(snapshot)
    }
    async fn in_flight_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.in_flight_runs().await
    }
    async fn recover_in_flight(&self, reason: &str) -> Result<usize, StoreError> {
        self.inner.recover_in_flight(reason).await
    }
    async fn append_metrics(&self, events: &[MetricEvent]) -> Result<(), StoreError> {
        if !events.is_empty() && self.panic_on_metrics.load(Ordering::SeqCst) {
            panic!("metrics backend crashed");
        }
        self.inner.append_metrics(events).await
    }
    async fn list_metrics(
        &self,
        since: DateTime<Utc>,
        worker_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MetricEvent>, StoreError> {
        self.inner.list_metrics(since, worker_id, limit).await
    }
    async fn metric_summaries(&self, since: DateTime<Utc>) -> Result<Vec<MetricSummary>, StoreError> {
        self.inner.metric_summaries(since).await
    }
    async fn write_report(&self, report: &ReportArtifact) -> Result<(), StoreError> {
        self.inner.write_report(report).await
    }
    async fn read_report(
        &self,
        cadence: Cadence,
        calendar_key: &str,
    ) -> Result<Option<ReportArtifact>, StoreError> {
        self.inner.read_report(cadence, calendar_key).await
    }
    async fn list_reports(
        &self,
        cadence: Option<Cadence>,
        limit: usize,
    ) -> Result<Vec<ReportRef>, StoreError> {
        self.inner.list_reports(cadence, limit).await
    }
    async fn last_fired(&self, cadence: Cadence) -> Result<Option<FiredMark>, StoreError> {
        self.inner.last_fired(cadence).await
    }
    async fn mark_fired(&self, mark: &FiredMark) -> Result<(), StoreError> {
        self.inner.mark_fired(mark).await
    }
}
