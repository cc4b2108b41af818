use std::cmp::Reverse;
use std::collections::BinaryHeap;

use indexmap::IndexMap;
use ulid::Ulid;

use crate::arena::SlotId;

pub type TaskId = Ulid;

/// A task that has come due: handed to the engine, which re-fixes and
/// notifies the node.
#[derive(Debug, Clone, Copy)]
pub struct DueTask {
    pub id: TaskId,
    pub node: SlotId,
    pub due_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    due_ms: u64,
    seq: u64,
    id: TaskId,
}

#[derive(Debug, Clone, Copy)]
struct Task {
    node: SlotId,
    interval_ms: u64,
    cancelled: bool,
}

/// Virtual-time scheduler for periodic re-evaluation. Nothing fires until
/// the engine advances the clock; ties break on scheduling order.
pub struct Scheduler {
    now_ms: u64,
    seq: u64,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    tasks: IndexMap<TaskId, Task>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            now_ms: 0,
            seq: 0,
            queue: BinaryHeap::new(),
            tasks: IndexMap::new(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub(crate) fn set_now(&mut self, ms: u64) {
        self.now_ms = self.now_ms.max(ms);
    }

    pub fn schedule(&mut self, node: SlotId, interval_ms: u64) -> TaskId {
        let interval_ms = interval_ms.max(1);
        let id = Ulid::new();
        self.tasks.insert(
            id,
            Task {
                node,
                interval_ms,
                cancelled: false,
            },
        );
        self.seq += 1;
        self.queue.push(Reverse(QueueEntry {
            due_ms: self.now_ms + interval_ms,
            seq: self.seq,
            id,
        }));
        id
    }

    /// Suppress every future fire. Returns whether the task was live.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if !task.cancelled => {
                task.cancelled = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_live(&self, id: TaskId) -> bool {
        self.tasks.get(&id).is_some_and(|task| !task.cancelled)
    }

    /// Pop the next task due at or before `until`, rescheduling its next
    /// fire. Cancelled tasks are dropped as they surface.
    pub(crate) fn pop_due(&mut self, until: u64) -> Option<DueTask> {
        while let Some(Reverse(entry)) = self.queue.peek().copied() {
            if entry.due_ms > until {
                return None;
            }
            self.queue.pop();
            match self.tasks.get(&entry.id).copied() {
                Some(task) if !task.cancelled => {
                    self.seq += 1;
                    self.queue.push(Reverse(QueueEntry {
                        due_ms: entry.due_ms + task.interval_ms,
                        seq: self.seq,
                        id: entry.id,
                    }));
                    self.set_now(entry.due_ms);
                    return Some(DueTask {
                        id: entry.id,
                        node: task.node,
                        due_ms: entry.due_ms,
                    });
                }
                _ => {
                    self.tasks.shift_remove(&entry.id);
                }
            }
        }
        None
    }

    /// Nodes of every live task; sweep roots.
    pub fn nodes(&self) -> Vec<SlotId> {
        self.tasks
            .values()
            .filter(|task| !task.cancelled)
            .map(|task| task.node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(n: u32) -> SlotId {
        SlotId {
            index: n,
            generation: 0,
        }
    }

    fn drain(scheduler: &mut Scheduler, until: u64) -> Vec<(SlotId, u64)> {
        let mut fired = Vec::new();
        while let Some(task) = scheduler.pop_due(until) {
            fired.push((task.node, task.due_ms));
        }
        fired
    }

    #[test]
    fn fires_in_time_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(slot(1), 100);
        scheduler.schedule(slot(2), 30);
        let fired = drain(&mut scheduler, 100);
        assert_eq!(
            fired,
            vec![(slot(2), 30), (slot(2), 60), (slot(2), 90), (slot(1), 100)]
        );
        assert_eq!(scheduler.now_ms(), 100);
    }

    #[test]
    fn nothing_fires_before_time_advances() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(slot(1), 50);
        assert!(scheduler.pop_due(0).is_none());
        assert!(scheduler.pop_due(49).is_none());
        assert!(scheduler.pop_due(50).is_some());
    }

    #[test]
    fn cancel_stops_subsequent_fires() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.schedule(slot(1), 10);
        assert_eq!(drain(&mut scheduler, 20).len(), 2);
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert!(drain(&mut scheduler, 100).is_empty());
        assert!(!scheduler.is_live(id));
    }
}
