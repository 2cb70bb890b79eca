//! The interface every schedulable worker implements.
//!
//! The orchestrator treats all workers identically: it hands each one its own
//! last-persisted context and receives a [`WorkerResult`] back. Workers never
//! return `Err` or panic on purpose; internal failures are reported as
//! `success = false` with a populated `error`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::worker::descriptor::WorkerDescriptor;

/// Worker-owned state carried from one run to the next. Opaque to the orchestrator.
///
/// `Value::Null` is the empty context handed to a worker on its first run.
pub type Context = serde_json::Value;

/// Value of a single metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            MetricValue::Number(n) => write!(f, "{n}"),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// A named observation emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: MetricValue,
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub success: bool,
    /// Replaces the prior context for the next run. Only committed on success.
    pub new_context: Context,
    pub metrics: Vec<Metric>,
    pub summary: String,
    pub error: Option<String>,
}

impl WorkerResult {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            new_context: Context::Null,
            metrics: Vec::new(),
            summary: summary.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            new_context: Context::Null,
            metrics: Vec::new(),
            summary: String::new(),
            error: Some(error),
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.new_context = context;
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.metrics.push(Metric {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }
}

/// A named, schedulable unit of work.
///
/// Implementations must be safe to run concurrently with *other* workers. The
/// orchestrator guarantees a single worker is never executed concurrently with
/// itself.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Identity of this worker. Pure and callable at any time.
    fn identify(&self) -> &WorkerDescriptor;

    /// Run once, given the context persisted by this worker's last successful run.
    async fn execute(&self, prior_context: Context) -> WorkerResult;
}
