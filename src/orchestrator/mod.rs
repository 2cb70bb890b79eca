//! Orchestrator: runs a due batch concurrently and records every outcome.
//!
//! Flow per worker:
//! 1. Take the worker's execution lock (a worker never overlaps itself)
//! 2. Load its prior context and record an in-flight run
//! 3. Execute in its own task, bounded by the timeout and the cancel token
//! 4. Append metrics, commit the new context on success, finalize the run
//!
//! The batch waits for every worker to reach a terminal state before the
//! report is written. One worker's failure never stops another.

pub mod report;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, WorkerError};
use crate::scheduler::{DueBatch, Scheduler};
use crate::store::traits::{self, MetricEvent, RunCompletion, RunOutcome, RunRecord, Store};
use crate::worker::contract::{Context, Metric, Worker, WorkerResult};
use crate::worker::descriptor::Cadence;
use crate::worker::registry::WorkerRegistry;

/// Execution bound for workers that do not set their own.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(900);

/// Error recorded for runs stopped by shutdown.
pub const CANCELLED: &str = "cancelled";

/// Terminal result of one worker within a batch.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerOutcome {
    pub worker_id: String,
    pub display_name: String,
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub summary: String,
    pub error: Option<String>,
    pub metrics: Vec<Metric>,
}

impl WorkerOutcome {
    /// A failure with no detail yet, filled in as the run progresses.
    fn unfinished(worker_id: &str, display_name: &str, run_id: Uuid) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            display_name: display_name.to_string(),
            run_id,
            outcome: RunOutcome::Failure,
            summary: String::new(),
            error: None,
            metrics: Vec::new(),
        }
    }
}

/// Result of a whole batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub cadence: Cadence,
    pub calendar_key: String,
    /// Ordered by worker id.
    pub workers: Vec<WorkerOutcome>,
    pub report_written: bool,
}

impl BatchOutcome {
    pub fn error_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !w.outcome.is_success())
            .count()
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerOutcome> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }
}

pub struct Orchestrator {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn Store>,
    worker_timeout: Duration,
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<WorkerRegistry>, store: Arc<dyn Store>) -> Self {
        let locks = registry
            .descriptors()
            .into_iter()
            .map(|d| (d.id, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            registry,
            store,
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
            locks,
        }
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Run a batch the scheduler claimed.
    pub async fn run_due(&self, batch: &DueBatch, cancel: &CancellationToken) -> BatchOutcome {
        self.run_batch(batch.cadence, &batch.calendar_key, cancel)
            .await
    }

    /// Run every enabled worker of `cadence` concurrently and write the
    /// batch report under `calendar_key`.
    pub async fn run_batch(
        &self,
        cadence: Cadence,
        calendar_key: &str,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let workers = self.registry.batch(cadence);
        info!(
            %cadence,
            calendar_key,
            workers = workers.len(),
            "Starting batch"
        );

        // Run ids are minted here so a task that dies can still be accounted for.
        let mut set = JoinSet::new();
        let mut pending = HashMap::new();
        for worker in workers {
            let descriptor = worker.identify();
            let record = RunRecord::start(&descriptor.id).for_batch(cadence, calendar_key);
            let placeholder = WorkerOutcome::unfinished(&descriptor.id, &descriptor.display_name, record.id);
            let record_copy = record.clone();
            let job = WorkerJob {
                lock: self.locks.get(&descriptor.id).cloned().unwrap_or_default(),
                timeout: descriptor.timeout.unwrap_or(self.worker_timeout),
                record,
                worker,
                store: self.store.clone(),
                cancel: cancel.clone(),
            };
            let handle = set.spawn(job.run());
            pending.insert(handle.id(), (record_copy, placeholder));
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    pending.remove(&id);
                    outcomes.push(outcome);
                }
                Err(e) => {
                    let Some((record, outcome)) = pending.remove(&e.id()) else {
                        error!(%cadence, error = %e, "Unknown worker task aborted");
                        continue;
                    };
                    outcomes.push(self.abandon(record, outcome, &e.to_string()).await);
                }
            }
        }
        outcomes.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let report = report::render(cadence, calendar_key, traits::now(), &outcomes);
        let report_written = match self.store.write_report(&report).await {
            Ok(()) => {
                info!(%cadence, calendar_key, "Report saved");
                true
            }
            Err(e) => {
                error!(%cadence, calendar_key, error = %e, "Failed to save report");
                false
            }
        };

        let batch = BatchOutcome {
            cadence,
            calendar_key: calendar_key.to_string(),
            workers: outcomes,
            report_written,
        };
        info!(
            %cadence,
            calendar_key,
            errors = batch.error_count(),
            "Batch complete - {} errors",
            batch.error_count()
        );
        batch
    }

    /// Account for a worker whose task died outside its own error handling.
    /// The run is finalized if it got as far as in-flight, appended otherwise.
    async fn abandon(&self, record: RunRecord, mut outcome: WorkerOutcome, reason: &str) -> WorkerOutcome {
        error!(worker = %outcome.worker_id, error = reason, "Worker task aborted");
        let message = format!("worker task aborted: {reason}");
        let completion = RunCompletion::failed(RunOutcome::Failure, message.clone());
        let persisted = match self.store.finish_run(record.id, &completion).await {
            Err(StoreError::NotFound { .. }) => self.store.append_run(&record.finish(completion)).await,
            other => other,
        };
        if let Err(e) = persisted {
            error!(worker = %outcome.worker_id, error = %e, "Failed to finalize run");
        }
        outcome.error = Some(message);
        outcome
    }
}

/// Everything one worker's task needs, owned so it can be spawned.
struct WorkerJob {
    worker: Arc<dyn Worker>,
    store: Arc<dyn Store>,
    lock: Arc<Mutex<()>>,
    record: RunRecord,
    timeout: Duration,
    cancel: CancellationToken,
}

enum Execution {
    Finished(WorkerResult),
    TimedOut,
    Cancelled,
    Panicked(String),
}

impl WorkerJob {
    async fn run(self) -> WorkerOutcome {
        let descriptor = self.worker.identify().clone();
        let record = self.record.clone();
        let mut outcome = WorkerOutcome::unfinished(&descriptor.id, &descriptor.display_name, record.id);

        let guard = tokio::select! {
            guard = self.lock.lock() => Some(guard),
            _ = self.cancel.cancelled() => None,
        };
        let Some(_guard) = guard else {
            let err = WorkerError::Cancelled {
                worker: descriptor.id.clone(),
            };
            warn!(worker = %descriptor.id, error = %err, "Cancelled while waiting for lock");
            outcome.error = Some(CANCELLED.to_string());
            let done = record.finish(RunCompletion::failed(RunOutcome::Failure, CANCELLED));
            if let Err(e) = self.store.append_run(&done).await {
                error!(worker = %descriptor.id, error = %e, "Failed to record cancelled run");
            }
            return outcome;
        };

        let prior = match self.store.load_context(&descriptor.id).await {
            Ok(context) => context,
            Err(e) => {
                error!(worker = %descriptor.id, error = %e, "Failed to load context");
                let message = e.to_string();
                outcome.error = Some(message.clone());
                let done = record.finish(RunCompletion::failed(RunOutcome::Failure, message));
                if let Err(e) = self.store.append_run(&done).await {
                    error!(worker = %descriptor.id, error = %e, "Failed to record run");
                }
                return outcome;
            }
        };

        let recorded_in_flight = match self.store.start_run(&record).await {
            Ok(()) => true,
            Err(e) => {
                error!(worker = %descriptor.id, error = %e, "Failed to record in-flight run");
                false
            }
        };

        debug!(worker = %descriptor.id, "Executing worker");
        let execution = self.execute(prior).await;

        let mut completion = match execution {
            Execution::Finished(result) => {
                outcome.summary = result.summary.clone();
                outcome.metrics = result.metrics.clone();
                self.settle(&descriptor.id, record.id, result).await
            }
            Execution::TimedOut => {
                let err = WorkerError::Timeout {
                    worker: descriptor.id.clone(),
                    timeout: self.timeout,
                };
                warn!(worker = %descriptor.id, error = %err, "Worker timed out");
                RunCompletion::failed(RunOutcome::Timeout, err.to_string())
            }
            Execution::Cancelled => {
                let err = WorkerError::Cancelled {
                    worker: descriptor.id.clone(),
                };
                warn!(worker = %descriptor.id, error = %err, "Worker cancelled");
                RunCompletion::failed(RunOutcome::Failure, CANCELLED)
            }
            Execution::Panicked(reason) => {
                let err = WorkerError::Panicked {
                    worker: descriptor.id.clone(),
                    reason,
                };
                warn!(worker = %descriptor.id, error = %err, "Worker panicked");
                RunCompletion::failed(RunOutcome::Failure, err.to_string())
            }
        };
        completion.finished_at = traits::now();

        let persisted = if recorded_in_flight {
            self.store.finish_run(record.id, &completion).await
        } else {
            self.store
                .append_run(&record.finish(completion.clone()))
                .await
        };
        if let Err(e) = persisted {
            error!(worker = %descriptor.id, error = %e, "Failed to finalize run");
            completion.outcome = RunOutcome::Failure;
            completion.error_message = Some(e.to_string());
        }

        outcome.outcome = completion.outcome;
        outcome.error = completion.error_message;
        outcome
    }

    /// Run `execute` in its own task so a panic or an abort stays contained.
    async fn execute(&self, prior: Context) -> Execution {
        let worker = self.worker.clone();
        let mut handle = tokio::spawn(async move { worker.execute(prior).await });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => Execution::Finished(result),
                Err(e) if e.is_panic() => Execution::Panicked(panic_message(e.into_panic())),
                Err(e) => Execution::Panicked(e.to_string()),
            },
            _ = tokio::time::sleep(self.timeout) => {
                handle.abort();
                Execution::TimedOut
            }
            _ = self.cancel.cancelled() => {
                handle.abort();
                Execution::Cancelled
            }
        }
    }

    /// Persist what a finished worker produced. Store failures degrade the
    /// run to a failure carrying the store error.
    async fn settle(
        &self,
        worker_id: &str,
        run_id: Uuid,
        result: WorkerResult,
    ) -> RunCompletion {
        let payload = serde_json::json!({
            "summary": result.summary,
            "metrics": result.metrics,
        });

        let timestamp = traits::now();
        let events: Vec<MetricEvent> = result
            .metrics
            .iter()
            .map(|m| MetricEvent {
                worker_id: worker_id.to_string(),
                run_id: Some(run_id),
                timestamp,
                name: m.name.clone(),
                value: m.value.clone(),
            })
            .collect();
        if let Err(e) = self.store.append_metrics(&events).await {
            error!(worker = worker_id, error = %e, "Failed to append metrics");
            return RunCompletion::failed(RunOutcome::Failure, e.to_string()).with_payload(payload);
        }

        if !result.success {
            let message = result
                .error
                .unwrap_or_else(|| "worker reported failure".to_string());
            let err = WorkerError::ExecutionFailed {
                worker: worker_id.to_string(),
                reason: message.clone(),
            };
            warn!(worker = worker_id, error = %err, "Worker failed");
            return RunCompletion::failed(RunOutcome::Failure, message).with_payload(payload);
        }

        if let Err(e) = self.store.save_context(worker_id, &result.new_context).await {
            error!(worker = worker_id, error = %e, "Failed to save context");
            return RunCompletion::failed(RunOutcome::Failure, e.to_string()).with_payload(payload);
        }

        info!(worker = worker_id, summary = %truncate(&result.summary, 200), "Worker succeeded");
        RunCompletion::success(payload)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

/// Spawn the scheduling loop: poll on every tick, run due batches in the
/// background, stop on cancellation after in-flight batches settle.
///
/// The first tick fires immediately so missed batches catch up at startup.
pub fn spawn_scheduler_loop(
    scheduler: Arc<Scheduler>,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            while running.try_join_next().is_some() {}

            match scheduler.poll().await {
                Ok(due) => {
                    for batch in due {
                        let orchestrator = orchestrator.clone();
                        let cancel = cancel.clone();
                        running.spawn(async move {
                            orchestrator.run_due(&batch, &cancel).await;
                        });
                    }
                }
                Err(e) => {
                    error!(error = %e, "Scheduler bookkeeping failed, dispatch halted until it recovers");
                }
            }
        }

        if !running.is_empty() {
            info!(batches = running.len(), "Waiting for running batches to stop");
        }
        while running.join_next().await.is_some() {}
        info!("Scheduler loop stopped");
    })
}
