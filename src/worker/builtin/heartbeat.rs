//! Heartbeat worker: counts its own runs. Useful for smoke-testing a deployment.

use async_trait::async_trait;
use chrono::Utc;

use crate::worker::contract::{Context, Worker, WorkerResult};
use crate::worker::descriptor::WorkerDescriptor;

pub struct HeartbeatWorker {
    descriptor: WorkerDescriptor,
}

impl HeartbeatWorker {
    pub fn new(descriptor: WorkerDescriptor) -> Self {
        Self { descriptor }
    }
}

#[async_trait]
impl Worker for HeartbeatWorker {
    fn identify(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    async fn execute(&self, prior_context: Context) -> WorkerResult {
        let runs = prior_context
            .get("runs_total")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + 1;

        WorkerResult::success(format!("heartbeat #{runs}"))
            .with_context(serde_json::json!({
                "runs_total": runs,
                "last_beat": Utc::now().to_rfc3339(),
            }))
            .with_metric("runs_total", runs)
    }
}
