//! Worker identity and recurrence types.

use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Recurrence class of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
}

impl Cadence {
    pub const ALL: [Cadence; 3] = [Cadence::Daily, Cadence::Weekly, Cadence::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Cadence::Daily),
            "weekly" => Ok(Cadence::Weekly),
            "monthly" => Ok(Cadence::Monthly),
            other => Err(format!("unknown cadence: {other}")),
        }
    }
}

/// A cadence together with its anchor within each period.
///
/// Monthly anchors past the end of a short month fall on that month's last day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "cadence", rename_all = "snake_case")]
pub enum Schedule {
    Daily { at: NaiveTime },
    Weekly { weekday: Weekday, at: NaiveTime },
    Monthly { day: u32, at: NaiveTime },
}

impl Schedule {
    pub fn cadence(&self) -> Cadence {
        match self {
            Schedule::Daily { .. } => Cadence::Daily,
            Schedule::Weekly { .. } => Cadence::Weekly,
            Schedule::Monthly { .. } => Cadence::Monthly,
        }
    }

    /// Time of day the anchor falls on.
    pub fn at(&self) -> NaiveTime {
        match self {
            Schedule::Daily { at } | Schedule::Weekly { at, .. } | Schedule::Monthly { at, .. } => {
                *at
            }
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Daily { at } => write!(f, "daily at {}", at.format("%H:%M")),
            Schedule::Weekly { weekday, at } => {
                write!(f, "weekly on {} at {}", weekday, at.format("%H:%M"))
            }
            Schedule::Monthly { day, at } => {
                write!(f, "monthly on day {} at {}", day, at.format("%H:%M"))
            }
        }
    }
}

/// Identity of a schedulable unit. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerDescriptor {
    pub id: String,
    pub display_name: String,
    pub category: String,
    pub schedule: Schedule,
    pub enabled: bool,
    /// Execution bound overriding the orchestrator default.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl WorkerDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            category: "general".to_string(),
            schedule,
            enabled: true,
            timeout: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn cadence(&self) -> Cadence {
        self.schedule.cadence()
    }
}

/// Parse an `HH:MM` anchor time.
pub fn parse_anchor_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| format!("invalid time '{s}': {e}"))
}
