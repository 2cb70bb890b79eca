//! Persistence layer: libSQL-backed storage for contexts, runs, metrics,
//! reports and scheduler bookkeeping.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use libsql_backend::LibSqlStore;
pub use traits::{
    FiredMark, MetricEvent, MetricSummary, ReportArtifact, ReportRef, RunCompletion, RunOutcome,
    RunQuery, RunRecord, RunSnapshot, Store,
};
