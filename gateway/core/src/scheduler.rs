//! Cooperative scheduler: fixed-interval periodic tasks driven from one
//! main loop. Tasks run to completion within their slice; between ticks
//! the loop sleeps until the earliest due time, so nothing ever busy-spins
//! or blocks indefinitely.

use std::time::{Duration, Instant};

/// Per-task cap on how long one activation may occupy the loop. Tasks take
/// this as the deadline for their blocking transport calls.
pub const TASK_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TaskId {
    SensorPoll,
    TelemetryFlush,
    Heartbeat,
    OtaPoll,
    Housekeeping,
}

#[derive(Debug)]
struct Slot {
    id: TaskId,
    period: Duration,
    next_due: Instant,
}

pub struct Scheduler {
    slots: Vec<Slot>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler { slots: Vec::new() }
    }

    /// Registers a periodic task; the first activation is one period out.
    pub fn register(&mut self, id: TaskId, period: Duration, now: Instant) {
        self.slots.retain(|slot| slot.id != id);
        self.slots.push(Slot {
            id,
            period,
            next_due: now + period,
        });
    }

    pub fn set_period(&mut self, id: TaskId, period: Duration, now: Instant) {
        for slot in &mut self.slots {
            if slot.id == id {
                slot.period = period;
                slot.next_due = now + period;
            }
        }
    }

    /// The most overdue task, if any is due. Its next activation moves one
    /// period past `now`, so a stalled loop does not burst to catch up.
    pub fn due(&mut self, now: Instant) -> Option<TaskId> {
        let slot = self
            .slots
            .iter_mut()
            .filter(|slot| slot.next_due <= now)
            .min_by_key(|slot| slot.next_due)?;

        slot.next_due = now + slot.period;
        Some(slot.id)
    }

    /// How long the loop may sleep before the next task comes due.
    pub fn idle_time(&self, now: Instant) -> Duration {
        self.slots
            .iter()
            .map(|slot| slot.next_due.saturating_duration_since(now))
            .min()
            .unwrap_or(TASK_SLICE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_come_due_in_order() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();

        scheduler.register(TaskId::SensorPoll, Duration::from_millis(100), start);
        scheduler.register(TaskId::Heartbeat, Duration::from_millis(250), start);

        assert_eq!(scheduler.due(start), None);

        let t1 = start + Duration::from_millis(100);
        assert_eq!(scheduler.due(t1), Some(TaskId::SensorPoll));
        assert_eq!(scheduler.due(t1), None);

        let t2 = start + Duration::from_millis(260);
        // Both due; the more overdue one (sensor poll at 200ms) runs first
        assert_eq!(scheduler.due(t2), Some(TaskId::SensorPoll));
        assert_eq!(scheduler.due(t2), Some(TaskId::Heartbeat));
        assert_eq!(scheduler.due(t2), None);
    }

    #[test]
    fn test_stalled_loop_does_not_burst() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();

        scheduler.register(TaskId::SensorPoll, Duration::from_millis(10), start);

        // The loop went away for a second; exactly one catch-up activation
        let late = start + Duration::from_secs(1);
        assert_eq!(scheduler.due(late), Some(TaskId::SensorPoll));
        assert_eq!(scheduler.due(late), None);

        assert_eq!(
            scheduler.idle_time(late),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_idle_time_tracks_earliest_task() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();

        scheduler.register(TaskId::Heartbeat, Duration::from_millis(500), start);
        scheduler.register(TaskId::SensorPoll, Duration::from_millis(200), start);

        assert_eq!(scheduler.idle_time(start), Duration::from_millis(200));

        let mid = start + Duration::from_millis(150);
        assert_eq!(scheduler.idle_time(mid), Duration::from_millis(50));
    }

    #[test]
    fn test_set_period_reschedules() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();

        scheduler.register(TaskId::OtaPoll, Duration::from_secs(3600), start);
        scheduler.set_period(TaskId::OtaPoll, Duration::from_millis(10), start);

        assert_eq!(
            scheduler.due(start + Duration::from_millis(10)),
            Some(TaskId::OtaPoll)
        );
    }
}
