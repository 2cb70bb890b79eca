//! Configuration: process settings from the environment and the static
//! worker registry from a TOML file.
//!
//! ```toml
//! [[worker]]
//! id = "sales_dev"
//! display_name = "Lead Generation"
//! category = "sales"
//! schedule = { cadence = "daily", at = "08:00" }
//! kind = { type = "command", command = "./bin/lead-gen", timeout_secs = 600 }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Weekday;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::worker::builtin::{CommandWorker, HeartbeatWorker};
use crate::worker::contract::Worker;
use crate::worker::descriptor::{Cadence, Schedule, WorkerDescriptor, parse_anchor_time};
use crate::worker::registry::WorkerRegistry;

/// Process-level settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// TOML file listing the workers.
    pub registry_path: PathBuf,
    /// Port of the status API.
    pub api_port: u16,
    /// How often the scheduler is polled.
    pub poll_interval: Duration,
    /// Upper bound on a single worker execution.
    pub worker_timeout: Duration,
    /// Directory for the daily-rolling log file, if any.
    pub log_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/ai-agents.db"),
            registry_path: PathBuf::from("./agents.toml"),
            api_port: 11050,
            poll_interval: Duration::from_secs(60),
            worker_timeout: Duration::from_secs(900),
            log_dir: None,
        }
    }
}

impl OrchestratorConfig {
    /// Read settings from `AI_AGENTS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Unset keys take their defaults;
    /// set but unparsable values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_port = match get("AI_AGENTS_API_PORT") {
            Some(v) => parse_number::<u16>("AI_AGENTS_API_PORT", &v)?,
            None => defaults.api_port,
        };
        let poll_interval = match get("AI_AGENTS_POLL_SECS") {
            Some(v) => Duration::from_secs(parse_positive("AI_AGENTS_POLL_SECS", &v)?),
            None => defaults.poll_interval,
        };
        let worker_timeout = match get("AI_AGENTS_WORKER_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_positive("AI_AGENTS_WORKER_TIMEOUT_SECS", &v)?),
            None => defaults.worker_timeout,
        };

        Ok(Self {
            db_path: get("AI_AGENTS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            registry_path: get("AI_AGENTS_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            api_port,
            poll_interval,
            worker_timeout,
            log_dir: get("AI_AGENTS_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{value}': {e}"),
        })
}

fn parse_positive(key: &str, value: &str) -> Result<u64, ConfigError> {
    let n = parse_number::<u64>(key, value)?;
    if n == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(n)
}

// ── Worker registry file ────────────────────────────────────────────

/// The worker registry file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerDefinition>,
}

/// One `[[worker]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerDefinition {
    pub id: String,
    pub display_name: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub schedule: ScheduleDefinition,
    pub kind: WorkerKind,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleDefinition {
    pub cadence: Cadence,
    pub at: String,
    pub weekday: Option<String>,
    pub day: Option<u32>,
}

/// What a worker actually runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerKind {
    Command {
        command: String,
        timeout_secs: Option<u64>,
        working_dir: Option<PathBuf>,
    },
    Heartbeat,
}

impl RegistryConfig {
    /// Read and parse a registry file. Semantic checks happen in
    /// [`RegistryConfig::into_registry`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents, &path.display().to_string())
    }

    pub fn parse(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })
    }

    /// Instantiate every worker.
    pub fn build_workers(&self) -> Result<Vec<Arc<dyn Worker>>, ConfigError> {
        self.workers.iter().map(WorkerDefinition::build).collect()
    }

    /// Instantiate and validate the registry.
    pub fn into_registry(self) -> Result<WorkerRegistry, ConfigError> {
        WorkerRegistry::new(self.build_workers()?)
    }
}

impl WorkerDefinition {
    fn descriptor(&self) -> Result<WorkerDescriptor, ConfigError> {
        let schedule = self.schedule.to_schedule(&self.id)?;
        let name = self.display_name.clone().unwrap_or_else(|| self.id.clone());
        let mut descriptor =
            WorkerDescriptor::new(self.id.clone(), name, schedule).with_category(&self.category);
        if !self.enabled {
            descriptor = descriptor.disabled();
        }
        Ok(descriptor)
    }

    fn build(&self) -> Result<Arc<dyn Worker>, ConfigError> {
        let descriptor = self.descriptor()?;
        let worker: Arc<dyn Worker> = match &self.kind {
            WorkerKind::Command {
                command,
                timeout_secs,
                working_dir,
            } => {
                if command.trim().is_empty() {
                    return Err(self.invalid("command must not be empty"));
                }
                let descriptor = match timeout_secs {
                    Some(0) => return Err(self.invalid("timeout_secs must be greater than zero")),
                    Some(secs) => descriptor.with_timeout(Duration::from_secs(*secs)),
                    None => descriptor,
                };
                let mut worker = CommandWorker::new(descriptor, command);
                if let Some(dir) = working_dir {
                    worker = worker.with_working_dir(dir.clone());
                }
                Arc::new(worker)
            }
            WorkerKind::Heartbeat => Arc::new(HeartbeatWorker::new(descriptor)),
        };
        Ok(worker)
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::InvalidWorker {
            worker: self.id.clone(),
            reason: reason.to_string(),
        }
    }
}

impl ScheduleDefinition {
    fn to_schedule(&self, worker: &str) -> Result<Schedule, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidWorker {
            worker: worker.to_string(),
            reason,
        };
        let at = parse_anchor_time(&self.at).map_err(invalid)?;

        match self.cadence {
            Cadence::Daily => {
                if self.weekday.is_some() || self.day.is_some() {
                    return Err(invalid(
                        "daily schedules take only `at`".to_string(),
                    ));
                }
                Ok(Schedule::Daily { at })
            }
            Cadence::Weekly => {
                if self.day.is_some() {
                    return Err(invalid("weekly schedules take `weekday`, not `day`".to_string()));
                }
                let raw = self
                    .weekday
                    .as_deref()
                    .ok_or_else(|| invalid("weekly schedule needs `weekday`".to_string()))?;
                let weekday = raw
                    .trim()
                    .parse::<Weekday>()
                    .map_err(|_| invalid(format!("invalid weekday '{raw}'")))?;
                Ok(Schedule::Weekly { weekday, at })
            }
            Cadence::Monthly => {
                if self.weekday.is_some() {
                    return Err(invalid("monthly schedules take `day`, not `weekday`".to_string()));
                }
                let day = self
                    .day
                    .ok_or_else(|| invalid("monthly schedule needs `day`".to_string()))?;
                Ok(Schedule::Monthly { day, at })
            }
        }
    }
}
