//! Integration tests for the status query API.
//!
//! Each test spins up an Axum server on a random port over an in-memory
//! store, drives a batch through the real orchestrator, and exercises the
//! HTTP contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ai_agents::api::{ApiState, api_routes};
use ai_agents::error::StoreError;
use ai_agents::orchestrator::Orchestrator;
use ai_agents::status::StatusAggregator;
use ai_agents::store::{
    FiredMark, LibSqlStore, MetricEvent, MetricSummary, ReportArtifact, ReportRef,
    RunCompletion, RunQuery, RunRecord, RunSnapshot, Store,
};
use ai_agents::worker::descriptor::parse_anchor_time;
use ai_agents::worker::{Cadence, Context, Schedule, Worker, WorkerDescriptor, WorkerRegistry, WorkerResult};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Succeeds with `count=5`, or fails with "boom".
struct Scripted {
    descriptor: WorkerDescriptor,
    fail: bool,
}

#[async_trait]
impl Worker for Scripted {
    fn identify(&self) -> &WorkerDescriptor {
        &self.descriptor
    }
    async fn execute(&self, _prior: Context) -> WorkerResult {
        if self.fail {
            WorkerResult::failure("boom")
        } else {
            WorkerResult::success("processed 5 items").with_metric("count", 5i64)
        }
    }
}

fn scripted(id: &str, fail: bool) -> Arc<dyn Worker> {
    let at = parse_anchor_time("08:00").unwrap();
    Arc::new(Scripted {
        descriptor: WorkerDescriptor::new(id, format!("Worker {id}"), Schedule::Daily { at }),
        fail,
    })
}

fn registry() -> Arc<WorkerRegistry> {
    Arc::new(WorkerRegistry::new(vec![scripted("a", false), scripted("b", true)]).unwrap())
}

/// Start an Axum server on a random port over the given store.
async fn start_server(registry: Arc<WorkerRegistry>, store: Arc<dyn Store>) -> String {
    let status = Arc::new(StatusAggregator::new(registry, store));
    let app = api_routes(ApiState { status });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

/// Server over a store that has already run one daily batch.
async fn start_with_batch() -> String {
    let registry = registry();
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    Orchestrator::new(registry.clone(), store.clone())
        .run_batch(Cadence::Daily, "2024-03-04", &CancellationToken::new())
        .await;
    start_server(registry, store).await
}

async fn get_json(url: &str) -> (u16, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let base = start_server(registry(), store).await;

        let (status, body) = get_json(&format!("{base}/health")).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "ai-agents");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn status_reports_idle_and_failed() {
    timeout(TEST_TIMEOUT, async {
        let base = start_with_batch().await;

        let (status, body) = get_json(&format!("{base}/api/status")).await;
        assert_eq!(status, 200);
        assert_eq!(body["workers"]["a"]["state"], "idle");
        assert_eq!(body["workers"]["a"]["last_outcome"], "success");
        assert_eq!(body["workers"]["b"]["state"], "failed");
        assert_eq!(body["workers"]["b"]["last_error"], "boom");
        assert_eq!(body["system_health"]["total_workers"], 2);
        assert_eq!(body["system_health"]["failed_workers"], 1);
        assert_eq!(body["system_health"]["overall_health"], "degraded");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn status_before_any_run() {
    timeout(TEST_TIMEOUT, async {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let base = start_server(registry(), store).await;

        let (_, body) = get_json(&format!("{base}/api/status")).await;
        assert_eq!(body["workers"]["a"]["state"], "not_started");
        assert!(body["workers"]["a"]["last_run_at"].is_null());
        assert_eq!(body["system_health"]["overall_health"], "healthy");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn metrics_summary_and_window() {
    timeout(TEST_TIMEOUT, async {
        let base = start_with_batch().await;

        let (status, body) = get_json(&format!("{base}/api/metrics?window=7d")).await;
        assert_eq!(status, 200);
        assert_eq!(body["window_secs"], 7 * 86_400);
        assert_eq!(body["summary"]["count"]["latest"], 5.0);
        assert_eq!(body["summary"]["count"]["count"], 1);
        assert_eq!(body["summary"]["count"]["latest_worker"], "a");
        assert_eq!(body["recent"].as_array().unwrap().len(), 1);

        let (status, body) = get_json(&format!("{base}/api/metrics")).await;
        assert_eq!(status, 200);
        assert_eq!(body["window_secs"], 86_400);

        let (status, body) = get_json(&format!("{base}/api/metrics?window=soon")).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("window"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reports_listing_and_content() {
    timeout(TEST_TIMEOUT, async {
        let base = start_with_batch().await;

        let (status, body) = get_json(&format!("{base}/api/reports?cadence=daily&limit=5")).await;
        assert_eq!(status, 200);
        assert_eq!(body["count"], 1);
        let entry = &body["reports"][0];
        assert_eq!(entry["cadence"], "daily");
        assert_eq!(entry["calendar_key"], "2024-03-04");
        assert!(entry["size"].as_u64().unwrap() > 0);

        let (_, weekly) = get_json(&format!("{base}/api/reports?cadence=weekly")).await;
        assert_eq!(weekly["count"], 0);

        let (status, report) = get_json(&format!("{base}/api/report/daily/2024-03-04")).await;
        assert_eq!(status, 200);
        let content = report["content"].as_str().unwrap();
        assert!(content.contains("Summary: processed 5 items"));
        assert!(content.contains("Error: boom"));

        let (status, body) = get_json(&format!("{base}/api/report/daily/1999-01-01")).await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "report not found");

        let (status, _) = get_json(&format!("{base}/api/report/hourly/2024-03-04")).await;
        assert_eq!(status, 400);
        let (status, _) = get_json(&format!("{base}/api/reports?cadence=yearly")).await;
        assert_eq!(status, 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cors_allows_dashboard_origin() {
    timeout(TEST_TIMEOUT, async {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let base = start_server(registry(), store).await;

        let resp = reqwest::Client::new()
            .get(format!("{base}/api/status"))
            .header("Origin", "http://localhost:3000")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    })
    .await
    .expect("test timed out");
}

// ── Unreachable store ───────────────────────────────────────────────

/// A store whose backend cannot be reached.
struct DownStore;

fn down<T>() -> Result<T, StoreError> {
    Err(StoreError::Unavailable("connection refused".to_string()))
}

#[async_trait]
impl Store for DownStore {
    async fn ping(&self) -> Result<(), StoreError> {
        down()
    }
    async fn save_context(&self, _: &str, _: &Context) -> Result<(), StoreError> {
        down()
    }
    async fn load_context(&self, _: &str) -> Result<Context, StoreError> {
        down()
    }
    async fn start_run(&self, _: &RunRecord) -> Result<(), StoreError> {
        down()
    }
    async fn finish_run(&self, _: Uuid, _: &RunCompletion) -> Result<(), StoreError> {
        down()
    }
    async fn append_run(&self, _: &RunRecord) -> Result<(), StoreError> {
        down()
    }
    async fn list_recent_runs(&self, _: &RunQuery) -> Result<Vec<RunRecord>, StoreError> {
        down()
    }
    async fn run_snapshot(&self) -> Result<RunSnapshot, StoreError> {
        down()
    }
    async fn in_flight_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        down()
    }
    async fn recover_in_flight(&self, _: &str) -> Result<usize, StoreError> {
        down()
    }
    async fn append_metrics(&self, _: &[MetricEvent]) -> Result<(), StoreError> {
        down()
    }
    async fn list_metrics(
        &self,
        _: DateTime<Utc>,
        _: Option<&str>,
        _: usize,
    ) -> Result<Vec<MetricEvent>, StoreError> {
        down()
    }
    async fn metric_summaries(&self, _: DateTime<Utc>) -> Result<Vec<MetricSummary>, StoreError> {
        down()
    }
    async fn write_report(&self, _: &ReportArtifact) -> Result<(), StoreError> {
        down()
    }
    async fn read_report(
        &self,
        _: Cadence,
        _: &str,
    ) -> Result<Option<ReportArtifact>, StoreError> {
        down()
    }
    async fn list_reports(
        &self,
        _: Option<Cadence>,
        _: usize,
    ) -> Result<Vec<ReportRef>, StoreError> {
        down()
    }
    async fn last_fired(&self, _: Cadence) -> Result<Option<FiredMark>, StoreError> {
        down()
    }
    async fn mark_fired(&self, _: &FiredMark) -> Result<(), StoreError> {
        down()
    }
}

#[tokio::test]
async fn unreachable_store_is_503_not_stale_data() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(registry(), Arc::new(DownStore)).await;

        for path in ["/api/status", "/api/metrics", "/api/reports", "/api/report/daily/2024-03-04"] {
            let (status, body) = get_json(&format!("{base}{path}")).await;
            assert_eq!(status, 503, "{path}");
            assert!(
                body["error"]
                    .as_str()
                    .unwrap()
                    .starts_with("store unavailable"),
                "{path}"
            );
        }

        let (status, _) = get_json(&format!("{base}/health")).await;
        assert_eq!(status, 200);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn batch_against_unreachable_store_still_completes() {
    timeout(TEST_TIMEOUT, async {
        let store: Arc<dyn Store> = Arc::new(DownStore);
        let batch = Orchestrator::new(registry(), store)
            .run_batch(Cadence::Daily, "2024-03-04", &CancellationToken::new())
            .await;
        assert_eq!(batch.workers.len(), 2);
        assert_eq!(batch.error_count(), 2);
        assert!(!batch.report_written);
        assert!(batch
            .workers
            .iter()
            .all(|w| w.error.as_deref().unwrap().contains("unavailable")));
    })
    .await
    .expect("test timed out");
}
