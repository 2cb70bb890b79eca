//! Read-only registry of workers, built once at startup.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::ConfigError;
use crate::worker::contract::Worker;
use crate::worker::descriptor::{Cadence, Schedule, WorkerDescriptor};

static WORKER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("static regex"));

/// Validated set of workers. Requires no locking once built.
pub struct WorkerRegistry {
    workers: BTreeMap<String, Arc<dyn Worker>>,
    anchors: HashMap<Cadence, Schedule>,
}

impl WorkerRegistry {
    /// Validate and index the given workers.
    ///
    /// Ids must be unique and well-formed, and every worker in a cadence class
    /// must share one anchor, since a batch is exactly one cadence class.
    pub fn new(workers: Vec<Arc<dyn Worker>>) -> Result<Self, ConfigError> {
        let mut by_id = BTreeMap::new();
        let mut anchors: HashMap<Cadence, Schedule> = HashMap::new();

        for worker in workers {
            let descriptor = worker.identify();
            validate_descriptor(descriptor)?;

            let schedule = descriptor.schedule;
            if let Some(existing) = anchors.get(&schedule.cadence()) {
                if *existing != schedule {
                    return Err(ConfigError::ConflictingAnchor {
                        cadence: schedule.cadence().to_string(),
                        first: existing.to_string(),
                        second: schedule.to_string(),
                    });
                }
            } else {
                anchors.insert(schedule.cadence(), schedule);
            }

            let id = descriptor.id.clone();
            if by_id.insert(id.clone(), worker).is_some() {
                return Err(ConfigError::DuplicateWorker(id));
            }
        }

        tracing::info!(workers = by_id.len(), "Worker registry initialized");
        Ok(Self {
            workers: by_id,
            anchors,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// All descriptors, ordered by id.
    pub fn descriptors(&self) -> Vec<WorkerDescriptor> {
        self.workers
            .values()
            .map(|w| w.identify().clone())
            .collect()
    }

    /// Enabled workers of the given cadence, ordered by id.
    pub fn batch(&self, cadence: Cadence) -> Vec<Arc<dyn Worker>> {
        self.workers
            .values()
            .filter(|w| {
                let d = w.identify();
                d.enabled && d.cadence() == cadence
            })
            .cloned()
            .collect()
    }

    /// The anchor shared by the given cadence class, if any worker uses it.
    pub fn anchor(&self, cadence: Cadence) -> Option<Schedule> {
        self.anchors.get(&cadence).copied()
    }
}

fn validate_descriptor(d: &WorkerDescriptor) -> Result<(), ConfigError> {
    if !WORKER_ID.is_match(&d.id) {
        return Err(ConfigError::InvalidWorker {
            worker: d.id.clone(),
            reason: "id must match [a-z0-9][a-z0-9_-]*".to_string(),
        });
    }
    if let Schedule::Monthly { day, .. } = d.schedule
        && !(1..=31).contains(&day)
    {
        return Err(ConfigError::InvalidWorker {
            worker: d.id.clone(),
            reason: format!("monthly day {day} outside 1..=31"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::contract::{Context, WorkerResult};
    use crate::worker::descriptor::parse_anchor_time;
    use async_trait::async_trait;

    struct Noop(WorkerDescriptor);

    #[async_trait]
    impl Worker for Noop {
        fn identify(&self) -> &WorkerDescriptor {
            &self.0
        }
        async fn execute(&self, _prior: Context) -> WorkerResult {
            WorkerResult::success("noop")
        }
    }

    fn daily(id: &str, at: &str) -> Arc<dyn Worker> {
        let at = parse_anchor_time(at).unwrap();
        Arc::new(Noop(WorkerDescriptor::new(id, id, Schedule::Daily { at })))
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = WorkerRegistry::new(vec![daily("a", "08:00"), daily("a", "08:00")])
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::DuplicateWorker(id) if id == "a"));
    }

    #[test]
    fn rejects_conflicting_anchor_within_cadence() {
        let err = WorkerRegistry::new(vec![daily("a", "08:00"), daily("b", "09:00")])
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::ConflictingAnchor { .. }));
    }

    #[test]
    fn rejects_malformed_id() {
        let err = WorkerRegistry::new(vec![daily("Sales Dev", "08:00")])
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidWorker { .. }));
    }

    #[test]
    fn batch_excludes_disabled_and_other_cadences() {
        let at = parse_anchor_time("08:00").unwrap();
        let off: Arc<dyn Worker> = Arc::new(Noop(
            WorkerDescriptor::new("off", "Off", Schedule::Daily { at }).disabled(),
        ));
        let monthly: Arc<dyn Worker> = Arc::new(Noop(WorkerDescriptor::new(
            "m",
            "M",
            Schedule::Monthly { day: 1, at },
        )));
        let registry =
            WorkerRegistry::new(vec![daily("b", "08:00"), daily("a", "08:00"), off, monthly])
                .unwrap();

        let ids: Vec<_> = registry
            .batch(Cadence::Daily)
            .iter()
            .map(|w| w.identify().id.clone())
            .collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(registry.len(), 4);
        assert!(registry.anchor(Cadence::Weekly).is_none());
        assert!(registry.anchor(Cadence::Monthly).is_some());
    }
}
