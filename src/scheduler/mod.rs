//! Scheduler: decides which cadence batches are due at a wall-clock instant.
//!
//! It performs no execution. Its only state is the last fired occurrence per
//! cadence, kept in the store so a restart neither re-fires nor skips a batch.

pub mod calendar;

use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use tracing::{info, warn};

use crate::error::{SchedulerError, StoreError};
use crate::store::traits::{FiredMark, Store};
use crate::worker::descriptor::Cadence;
use crate::worker::registry::WorkerRegistry;

pub use calendar::Occurrence;

/// Source of the local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The process's local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(std::sync::Mutex<NaiveDateTime>);

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self(std::sync::Mutex::new(start))
    }

    pub fn set(&self, to: NaiveDateTime) {
        if let Ok(mut now) = self.0.lock() {
            *now = to;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.0.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        match self.0.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// A cadence batch that became due and has been claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueBatch {
    pub cadence: Cadence,
    pub calendar_key: String,
    pub fire_at: NaiveDateTime,
}

pub struct Scheduler {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(registry: Arc<WorkerRegistry>, store: Arc<dyn Store>) -> Self {
        Self {
            registry,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// Decide and claim the batches due at the clock's current time.
    pub async fn poll(&self) -> Result<Vec<DueBatch>, SchedulerError> {
        self.due_batches(self.clock.now()).await
    }

    /// Decide which batches are due at `now` and claim them in the store.
    ///
    /// All bookkeeping is read before anything is claimed, so an unreachable
    /// store dispatches nothing. A corrupt entry fails safe: that cadence is
    /// treated as never fired, which limits it to the current period.
    pub async fn due_batches(&self, now: NaiveDateTime) -> Result<Vec<DueBatch>, SchedulerError> {
        let mut candidates = Vec::new();

        for cadence in Cadence::ALL {
            let Some(schedule) = self.registry.anchor(cadence) else {
                continue;
            };
            if self.registry.batch(cadence).is_empty() {
                continue;
            }

            let last = match self.store.last_fired(cadence).await {
                Ok(last) => last,
                Err(StoreError::Serialization(reason)) => {
                    let err = SchedulerError::StateCorruption {
                        cadence: cadence.to_string(),
                        reason,
                    };
                    warn!(%cadence, error = %err, "Ignoring corrupt scheduler state");
                    None
                }
                Err(e) => return Err(SchedulerError::Bookkeeping(e)),
            };

            let latest = schedule.latest_occurrence(now);
            let due = match last {
                Some(mark) => {
                    mark.calendar_key != latest.calendar_key && latest.fire_at > mark.fire_at
                }
                None => latest == schedule.current_occurrence(now),
            };
            if due {
                candidates.push(DueBatch {
                    cadence,
                    calendar_key: latest.calendar_key,
                    fire_at: latest.fire_at,
                });
            }
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for batch in candidates {
            let mark = FiredMark {
                cadence: batch.cadence,
                calendar_key: batch.calendar_key.clone(),
                fire_at: batch.fire_at,
            };
            if let Err(e) = self.store.mark_fired(&mark).await {
                if claimed.is_empty() {
                    return Err(SchedulerError::Bookkeeping(e));
                }
                // Unclaimed cadences are retried on the next poll.
                tracing::error!(cadence = %batch.cadence, error = %e, "Failed to claim batch");
                break;
            }
            info!(
                cadence = %batch.cadence,
                calendar_key = %batch.calendar_key,
                fire_at = %batch.fire_at,
                "Batch due"
            );
            claimed.push(batch);
        }
        Ok(claimed)
    }

    /// Earliest upcoming anchor across all scheduled cadences.
    pub fn next_fire(&self, now: NaiveDateTime) -> Option<(Cadence, NaiveDateTime)> {
        Cadence::ALL
            .into_iter()
            .filter_map(|c| self.registry.anchor(c).map(|s| (c, s.next_fire_after(now))))
            .min_by_key(|(_, at)| *at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::libsql_backend::LibSqlStore;
    use crate::worker::contract::{Context, Worker, WorkerResult};
    use crate::worker::descriptor::{Schedule, WorkerDescriptor, parse_anchor_time};
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, Weekday};

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

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn worker(id: &str, schedule: Schedule) -> Arc<dyn Worker> {
        Arc::new(Noop(WorkerDescriptor::new(id, id, schedule)))
    }

    async fn scheduler(workers: Vec<Arc<dyn Worker>>) -> (Scheduler, Arc<LibSqlStore>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let registry = Arc::new(WorkerRegistry::new(workers).unwrap());
        (Scheduler::new(registry, store.clone()), store)
    }

    fn daily_8() -> Schedule {
        Schedule::Daily {
            at: parse_anchor_time("08:00").unwrap(),
        }
    }

    #[tokio::test]
    async fn daily_fires_once_per_day() {
        let (s, _) = scheduler(vec![worker("a", daily_8())]).await;

        assert!(s.due_batches(at(2024, 3, 4, 7, 59)).await.unwrap().is_empty());

        let due = s.due_batches(at(2024, 3, 4, 8, 0)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].cadence, Cadence::Daily);
        assert_eq!(due[0].calendar_key, "2024-03-04");

        for minute in [1, 30, 59] {
            assert!(s.due_batches(at(2024, 3, 4, 9, minute)).await.unwrap().is_empty());
        }
        assert!(s.due_batches(at(2024, 3, 4, 23, 59)).await.unwrap().is_empty());
        assert!(s.due_batches(at(2024, 3, 5, 7, 0)).await.unwrap().is_empty());

        let next = s.due_batches(at(2024, 3, 5, 8, 1)).await.unwrap();
        assert_eq!(next[0].calendar_key, "2024-03-05");
    }

    #[tokio::test]
    async fn fresh_start_before_anchor_does_not_fire_yesterday() {
        let (s, _) = scheduler(vec![worker("a", daily_8())]).await;
        assert!(s.due_batches(at(2024, 3, 4, 6, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_catches_up_exactly_once() {
        let (s, store) = scheduler(vec![worker("a", daily_8())]).await;
        // Yesterday's batch fired before the process went down.
        store
            .mark_fired(&FiredMark {
                cadence: Cadence::Daily,
                calendar_key: "2024-03-03".to_string(),
                fire_at: at(2024, 3, 3, 8, 0),
            })
            .await
            .unwrap();

        // A new scheduler over the same store models the restarted process.
        let registry = s.registry.clone();
        let restarted = Scheduler::new(registry, store.clone());

        let due = restarted.due_batches(at(2024, 3, 4, 14, 0)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].calendar_key, "2024-03-04");
        assert!(restarted.due_batches(at(2024, 3, 4, 14, 1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missed_occurrence_fires_once_on_next_poll() {
        let (s, store) = scheduler(vec![worker("a", daily_8())]).await;
        store
            .mark_fired(&FiredMark {
                cadence: Cadence::Daily,
                calendar_key: "2024-03-02".to_string(),
                fire_at: at(2024, 3, 2, 8, 0),
            })
            .await
            .unwrap();

        // Down all of the 3rd, back up early on the 4th before the anchor.
        let due = s.due_batches(at(2024, 3, 4, 6, 0)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].calendar_key, "2024-03-03");
        assert!(s.due_batches(at(2024, 3, 4, 7, 0)).await.unwrap().is_empty());
        assert_eq!(s.due_batches(at(2024, 3, 4, 8, 0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn monthly_day_31_in_30_day_month() {
        let monthly = Schedule::Monthly {
            day: 31,
            at: parse_anchor_time("10:00").unwrap(),
        };
        let (s, _) = scheduler(vec![worker("c", monthly)]).await;

        let mut fired = Vec::new();
        let mut now = at(2024, 4, 1, 0, 0);
        while now < at(2024, 5, 2, 0, 0) {
            for batch in s.due_batches(now).await.unwrap() {
                fired.push((now, batch));
            }
            now += Duration::hours(1);
        }

        let april: Vec<_> = fired
            .iter()
            .filter(|(_, b)| b.calendar_key == "2024-04")
            .collect();
        assert_eq!(april.len(), 1);
        assert_eq!(april[0].0, at(2024, 4, 30, 10, 0));
    }

    #[tokio::test]
    async fn weekly_fires_once_per_iso_week() {
        let weekly = Schedule::Weekly {
            weekday: Weekday::Mon,
            at: parse_anchor_time("09:00").unwrap(),
        };
        let (s, _) = scheduler(vec![worker("w", weekly)]).await;

        let mut keys = Vec::new();
        let mut now = at(2024, 3, 4, 0, 0);
        while now < at(2024, 3, 25, 0, 0) {
            for batch in s.due_batches(now).await.unwrap() {
                keys.push(batch.calendar_key);
            }
            now += Duration::minutes(30);
        }
        assert_eq!(keys, ["2024-W10", "2024-W11", "2024-W12"]);
    }

    #[tokio::test]
    async fn corrupt_state_fails_safe_to_current_period() {
        let (s, store) = scheduler(vec![worker("a", daily_8())]).await;
        store
            .execute_raw(
                "INSERT INTO scheduler_state (cadence, calendar_key, fire_at, recorded_at)
                 VALUES ('daily', '', 'not-a-time', 'x')",
            )
            .await
            .unwrap();

        let due = s.due_batches(at(2024, 3, 4, 9, 0)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].calendar_key, "2024-03-04");
        // The claim repaired the bookkeeping.
        assert!(s.due_batches(at(2024, 3, 4, 10, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_only_cadence_never_fires() {
        let at8 = parse_anchor_time("08:00").unwrap();
        let off: Arc<dyn Worker> = Arc::new(Noop(
            WorkerDescriptor::new("off", "Off", Schedule::Daily { at: at8 }).disabled(),
        ));
        let (s, _) = scheduler(vec![off]).await;
        assert!(s.due_batches(at(2024, 3, 4, 9, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_clock_drives_poll() {
        let clock = Arc::new(ManualClock::new(at(2024, 3, 4, 7, 0)));
        let (s, _) = scheduler(vec![worker("a", daily_8())]).await;
        let s = s.with_clock(clock.clone());

        assert!(s.poll().await.unwrap().is_empty());
        clock.advance(Duration::hours(2));
        assert_eq!(s.poll().await.unwrap().len(), 1);
        assert_eq!(
            s.next_fire(s.now()),
            Some((Cadence::Daily, at(2024, 3, 5, 8, 0)))
        );
    }
}
