//! Worker system: the contract every schedulable unit implements.
//!
//! Core components:
//! - `descriptor`: identity and recurrence (`WorkerDescriptor`, `Schedule`)
//! - `contract`: the `Worker` trait and `WorkerResult`
//! - `registry`: validated, read-only set of workers built at startup
//! - `builtin`: generic workers (`CommandWorker`, `HeartbeatWorker`)

pub mod builtin;
pub mod contract;
pub mod descriptor;
pub mod registry;

pub use contract::{Context, Metric, MetricValue, Worker, WorkerResult};
pub use descriptor::{Cadence, Schedule, WorkerDescriptor};
pub use registry::WorkerRegistry;
