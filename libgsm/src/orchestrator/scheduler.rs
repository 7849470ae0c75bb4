use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::schedule::ScheduleEntry;

/// Longest single sleep. Waking at least this often keeps the scheduler honest across wall-clock
/// jumps (NTP steps, suspend/resume).
const MAX_SLEEP: Duration = Duration::from_secs(60);

struct Slot {
    entry: ScheduleEntry,
    next: Option<DateTime<Local>>,
}

/// Tracks the next fire time of every [`ScheduleEntry`].
pub struct Scheduler {
    slots: Vec<Slot>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(entries: Vec<ScheduleEntry>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now().with_timezone(&Local);
        let slots = entries
            .into_iter()
            .map(|entry| {
                let next = entry.schedule.next_after(now);
                match next {
                    Some(at) => info!(task = %entry.kind, cron = %entry.schedule, next = %at, "scheduled"),
                    None => warn!(task = %entry.kind, cron = %entry.schedule, "schedule never fires"),
                }
                Slot { entry, next }
            })
            .collect();
        Self { slots, clock }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn next_fire(&self) -> Option<DateTime<Local>> {
        self.slots.iter().filter_map(|s| s.next).min()
    }

    /// Entries whose fire time is at or before `now`, each advanced to its following slot.
    ///
    /// An entry fires at most once per call no matter how many slots were missed.
    pub fn take_due(&mut self, now: DateTime<Local>) -> Vec<ScheduleEntry> {
        let mut due = Vec::new();
        for slot in &mut self.slots {
            if slot.next.is_some_and(|at| at <= now) {
                due.push(slot.entry.clone());
                slot.next = slot.entry.schedule.next_after(now);
                debug!(task = %slot.entry.kind, next = ?slot.next, "advanced schedule");
            }
        }
        due
    }

    /// Sleep until at least one entry is due and return the due entries.
    ///
    /// Never returns when no entry can fire; callers race it against other events.
    pub async fn next_due(&mut self) -> Vec<ScheduleEntry> {
        loop {
            let now = self.clock.now().with_timezone(&Local);
            let due = self.take_due(now);
            if !due.is_empty() {
                return due;
            }
            let Some(next) = self.next_fire() else {
                std::future::pending::<()>().await;
                continue;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait.clamp(Duration::from_millis(100), MAX_SLEEP)).await;
        }
    }
}
