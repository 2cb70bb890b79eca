//! Error types for the agent orchestrator.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse registry {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid worker definition '{worker}': {reason}")]
    InvalidWorker { worker: String, reason: String },

    #[error("Duplicate worker id: {0}")]
    DuplicateWorker(String),

    #[error("Workers with {cadence} cadence disagree on anchor: {first} vs {second}")]
    ConflictingAnchor {
        cadence: String,
        first: String,
        second: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence-layer errors.
///
/// `Write` and `Read` are kept apart so callers can tell a lost write from a
/// stale read; `Unavailable` means the backend could not be reached at all.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store write failed: {0}")]
    Write(String),

    #[error("Store read failed: {0}")]
    Read(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },
}

/// Failures attributed to a single worker execution.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {worker} failed: {reason}")]
    ExecutionFailed { worker: String, reason: String },

    #[error("Worker {worker} timed out after {timeout:?}")]
    Timeout { worker: String, timeout: Duration },

    #[error("Worker {worker} was cancelled")]
    Cancelled { worker: String },

    #[error("Worker {worker} panicked: {reason}")]
    Panicked { worker: String, reason: String },
}

/// Scheduler bookkeeping errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler state for {cadence} is corrupt: {reason}")]
    StateCorruption { cadence: String, reason: String },

    #[error("Scheduler bookkeeping unavailable: {0}")]
    Bookkeeping(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_error_wraps_store_error() {
        let err: SchedulerError = StoreError::Write("disk full".to_string()).into();
        assert!(matches!(err, SchedulerError::Bookkeeping(StoreError::Write(_))));
        assert_eq!(
            err.to_string(),
            "Scheduler bookkeeping unavailable: Store write failed: disk full"
        );
    }

    #[test]
    fn timeout_message_includes_duration() {
        let err = WorkerError::Timeout {
            worker: "devops".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Worker devops timed out after 5s");

        let err = WorkerError::Timeout {
            worker: "devops".to_string(),
            timeout: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "Worker devops timed out after 200ms");
    }
}
