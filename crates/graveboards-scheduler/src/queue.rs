// SPDX-License-Identifier: GPL-3.0-or-later

//! Time-ordered queue of recurring task ids.
//!
//! A min-heap of `(next_execution, id)` plus the set of ids the service
//! currently owns. An id stays owned from the moment it is pushed until the
//! service forgets it, including while its handler runs, so a bus
//! notification for a task that is queued or executing never creates a
//! second heap entry.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use graveboards_domain::{RecurringTask, TaskId};
use graveboards_infrastructure::clock::Clock;
use tokio::sync::Notify;
use tracing::{trace, warn};

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, TaskId)>>,
    owned: HashSet<TaskId>,
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    wake: Notify,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(target: "scheduler", "task queue mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Queue an enabled task at its next execution time.
    ///
    /// Returns false when the task is disabled or already owned.
    pub fn load(&self, task: &RecurringTask, interval: Duration) -> bool {
        if !task.enabled {
            trace!(target: "scheduler", task_id = %task.id, "skipping disabled task");
            return false;
        }
        let at = task.next_execution(interval, self.clock.now());
        self.push(task.id, at)
    }

    /// Add `id` at `at` unless it is already owned.
    pub fn push(&self, id: TaskId, at: DateTime<Utc>) -> bool {
        {
            let mut state = self.state();
            if !state.owned.insert(id) {
                trace!(target: "scheduler", task_id = %id, "task already queued or running");
                return false;
            }
            state.heap.push(Reverse((at, id)));
        }
        self.wake.notify_one();
        true
    }

    /// Put an owned id back on the heap after its handler finished.
    pub fn reschedule(&self, id: TaskId, at: DateTime<Utc>) {
        {
            let mut state = self.state();
            state.owned.insert(id);
            state.heap.push(Reverse((at, id)));
        }
        self.wake.notify_one();
    }

    /// Release ownership of an id that will not run again.
    pub fn forget(&self, id: TaskId) {
        self.state().owned.remove(&id);
    }

    /// Wait for the earliest entry to come due and take it off the heap.
    ///
    /// The returned id stays owned. Cancel-safe: nothing is removed unless
    /// the id is returned.
    pub async fn pop_when_due(&self) -> TaskId {
        loop {
            let head = self.state().heap.peek().map(|Reverse(entry)| *entry);

            match head {
                None => self.wake.notified().await,
                Some((at, id)) => {
                    let now = self.clock.now();
                    if at <= now {
                        let mut state = self.state();
                        // Another push may have changed the head since we peeked.
                        if let Some(Reverse((head_at, _))) = state.heap.peek() {
                            if *head_at <= now {
                                if let Some(Reverse((_, popped))) = state.heap.pop() {
                                    return popped;
                                }
                            }
                        }
                        continue;
                    }

                    let wait = (at - now).to_std().unwrap_or_default();
                    trace!(target: "scheduler", task_id = %id, wait_ms = wait.as_millis() as u64, "sleeping until next task");
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_owned(&self, id: TaskId) -> bool {
        self.state().owned.contains(&id)
    }

    /// Heap entries in execution order.
    pub fn entries(&self) -> Vec<(DateTime<Utc>, TaskId)> {
        let mut entries: Vec<_> = self.state().heap.iter().map(|Reverse(e)| *e).collect();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use graveboards_domain::UserId;
    use graveboards_infrastructure::clock::ManualClock;
    use std::time::Duration as StdDuration;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn queue() -> (Arc<ManualClock>, TaskQueue) {
        let clock = Arc::new(ManualClock::new(base()));
        (clock.clone(), TaskQueue::new(clock))
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_loads_keep_one_entry() {
        let (_clock, queue) = queue();
        let task = RecurringTask::new(TaskId(7), UserId(1));

        assert!(queue.load(&task, Duration::hours(24)));
        assert!(!queue.load(&task, Duration::hours(24)));
        assert_eq!(queue.entries(), vec![(base(), TaskId(7))]);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_tasks_are_never_pushed() {
        let (_clock, queue) = queue();
        let mut task = RecurringTask::new(TaskId(3), UserId(1));
        task.enabled = false;

        assert!(!queue.load(&task, Duration::hours(24)));
        assert!(queue.is_empty());
        assert!(!queue.is_owned(TaskId(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn load_uses_last_fetch_plus_interval() {
        let (_clock, queue) = queue();
        let mut task = RecurringTask::new(TaskId(1), UserId(1));
        task.last_fetch = Some(base() - Duration::hours(1));

        queue.load(&task, Duration::hours(24));
        assert_eq!(queue.entries(), vec![(base() + Duration::hours(23), TaskId(1))]);
    }

    #[tokio::test(start_paused = true)]
    async fn pops_in_time_order_with_id_tiebreak() {
        let (_clock, queue) = queue();
        queue.push(TaskId(9), base());
        queue.push(TaskId(2), base());
        queue.push(TaskId(1), base() + Duration::seconds(5));

        assert_eq!(queue.pop_when_due().await, TaskId(2));
        assert_eq!(queue.pop_when_due().await, TaskId(9));

        let start = tokio::time::Instant::now();
        assert_eq!(queue.pop_when_due().await, TaskId(1));
        assert_eq!(start.elapsed(), StdDuration::from_secs(5));

        // Popped ids remain owned until forgotten.
        assert!(queue.is_owned(TaskId(1)));
        queue.forget(TaskId(1));
        assert!(!queue.is_owned(TaskId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_wakes_on_push() {
        let (_clock, queue) = queue();
        let queue = Arc::new(queue);

        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_when_due().await })
        };
        tokio::time::sleep(StdDuration::from_secs(30)).await;
        assert!(!popper.is_finished());

        queue.push(TaskId(4), base());
        assert_eq!(popper.await.unwrap(), TaskId(4));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_push_preempts_sleeping_head() {
        let (_clock, queue) = queue();
        let queue = Arc::new(queue);
        queue.push(TaskId(1), base() + Duration::hours(1));

        let start = tokio::time::Instant::now();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_when_due().await })
        };
        tokio::time::sleep(StdDuration::from_secs(10)).await;
        queue.push(TaskId(2), base() + Duration::seconds(20));

        assert_eq!(popper.await.unwrap(), TaskId(2));
        assert_eq!(start.elapsed(), StdDuration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_keeps_ownership() {
        let (_clock, queue) = queue();
        queue.push(TaskId(5), base());
        let id = queue.pop_when_due().await;

        let task = RecurringTask::new(id, UserId(1));
        assert!(!queue.load(&task, Duration::hours(24)), "running task must not be re-queued");

        queue.reschedule(id, base() + Duration::hours(24));
        assert_eq!(queue.entries(), vec![(base() + Duration::hours(24), TaskId(5))]);
    }
}
