//! Deadline-ordered timer queue
//!
//! Backing store for timed and cyclic callbacks, shared by the tokio event
//! loop and the simulation loop in `uaserve-harness`. Dispatch is two-phase
//! so the owner can invoke callbacks without holding its own lock:
//! [`TimerQueue::take_due`] removes the due callbacks (rescheduling cyclic
//! entries in the same step), the owner invokes them, and
//! [`TimerQueue::restore`] reinstates each cyclic callback unless it was
//! removed while executing.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::time::Duration;

use uaserve_core::errors::{UaError, UaResult};
use uaserve_core::eventloop::{CallbackId, CycleMissPolicy, TimedCallback};
use uaserve_core::types::Timestamp;

// ----------------------------------------------------------------------------
// Entries
// ----------------------------------------------------------------------------

struct TimerEntry {
    /// Taken while the callback executes
    callback: Option<TimedCallback>,
    next_time: Timestamp,
    /// `None` marks a one-shot entry
    interval: Option<Duration>,
    policy: CycleMissPolicy,
}

/// A callback taken out of the queue for execution
pub struct DueTimer {
    pub id: CallbackId,
    pub callback: TimedCallback,
    one_shot: bool,
}

// ----------------------------------------------------------------------------
// Timer Queue
// ----------------------------------------------------------------------------

/// Deadline-ordered one-shot and cyclic callbacks
///
/// Identifiers are issued from a counter starting at 1 and are never reused
/// for the queue's lifetime, so 0 can serve as a "nothing registered"
/// sentinel. The heap holds stale (deadline, id) pairs after reschedules and
/// removals; they are skipped by checking against the entry's current
/// deadline.
pub struct TimerQueue {
    entries: HashMap<CallbackId, TimerEntry>,
    heap: BinaryHeap<Reverse<(u64, CallbackId)>>,
    next_id: CallbackId,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            next_id: 1,
        }
    }

    fn push(&mut self, id: CallbackId, deadline: Timestamp) {
        self.heap.push(Reverse((deadline.as_millis(), id)));
    }

    /// Register a one-shot callback at an absolute deadline
    pub fn add_timed(&mut self, callback: TimedCallback, deadline: Timestamp) -> CallbackId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            TimerEntry { callback: Some(callback), next_time: deadline, interval: None, policy: CycleMissPolicy::FireWithCurrentTime },
        );
        self.push(id, deadline);
        id
    }

    /// Register a cyclic callback
    pub fn add_cyclic(
        &mut self,
        callback: TimedCallback,
        interval: Duration,
        initial_deadline: Option<Timestamp>,
        policy: CycleMissPolicy,
        now: Timestamp,
    ) -> CallbackId {
        let id = self.next_id;
        self.next_id += 1;
        let first = initial_deadline.unwrap_or_else(|| now.saturating_add(interval));
        self.entries.insert(
            id,
            TimerEntry { callback: Some(callback), next_time: first, interval: Some(interval), policy },
        );
        self.push(id, first);
        id
    }

    /// Change interval, deadline and miss policy of a cyclic callback
    pub fn modify_cyclic(
        &mut self,
        id: CallbackId,
        interval: Duration,
        initial_deadline: Option<Timestamp>,
        policy: CycleMissPolicy,
        now: Timestamp,
    ) -> UaResult<()> {
        let entry = self.entries.get_mut(&id).ok_or(UaError::NotFound)?;
        if entry.interval.is_none() {
            return Err(UaError::invalid_argument("not a cyclic callback"));
        }
        entry.interval = Some(interval);
        entry.policy = policy;
        entry.next_time = initial_deadline.unwrap_or_else(|| now.saturating_add(interval));
        let deadline = entry.next_time;
        self.push(id, deadline);
        Ok(())
    }

    /// Deregister a callback; a no-op for unknown ids
    pub fn remove(&mut self, id: CallbackId) {
        self.entries.remove(&id);
    }

    /// Earliest deadline over all registered callbacks
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.entries.values().map(|e| e.next_time).min()
    }

    /// Number of registered callbacks, including those currently executing
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every callback due at `now`, rescheduling cyclic entries
    ///
    /// A cyclic entry that missed one or more cycles is rebased according to
    /// its miss policy: fire-with-current-time reschedules from `now`
    /// (skipping the backlog), fire-with-base-time keeps the original grid.
    pub fn take_due(&mut self, now: Timestamp) -> Vec<DueTimer> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline_ms, id))) = self.heap.peek() {
            if deadline_ms > now.as_millis() {
                break;
            }
            self.heap.pop();

            let (callback, one_shot, reschedule) = {
                let Some(entry) = self.entries.get_mut(&id) else {
                    continue; // removed; stale heap pair
                };
                if entry.next_time.as_millis() != deadline_ms || entry.callback.is_none() {
                    continue; // rescheduled or executing; stale heap pair
                }
                match entry.interval {
                    Some(interval) => {
                        let scheduled = entry.next_time;
                        let base = match entry.policy {
                            CycleMissPolicy::FireWithCurrentTime => {
                                if now > scheduled.saturating_add(interval) {
                                    now
                                } else {
                                    scheduled
                                }
                            }
                            CycleMissPolicy::FireWithBaseTime => scheduled,
                        };
                        let next = base.saturating_add(interval);
                        entry.next_time = next;
                        (entry.callback.take(), false, Some(next))
                    }
                    None => (entry.callback.take(), true, None),
                }
            };

            if one_shot {
                self.entries.remove(&id);
            }
            if let Some(next) = reschedule {
                self.push(id, next);
            }
            if let Some(callback) = callback {
                due.push(DueTimer { id, callback, one_shot });
            }
        }
        due
    }

    /// Reinstate an executed callback
    ///
    /// One-shot callbacks are dropped; a cyclic callback returns to its slot
    /// unless the entry was removed while it ran.
    pub fn restore(&mut self, timer: DueTimer) {
        if timer.one_shot {
            return;
        }
        if let Some(entry) = self.entries.get_mut(&timer.id) {
            entry.callback = Some(timer.callback);
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter_callback(counter: &Arc<AtomicU32>) -> TimedCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn drive(queue: &mut TimerQueue, now: Timestamp) {
        for mut timer in queue.take_due(now) {
            (timer.callback)();
            queue.restore(timer);
        }
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicU32::new(0));
        let id = queue.add_timed(counter_callback(&fired), Timestamp::from_millis(100));
        assert!(id > 0);

        drive(&mut queue, Timestamp::from_millis(99));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drive(&mut queue, Timestamp::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());

        drive(&mut queue, Timestamp::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cyclic_reschedules() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add_cyclic(
            counter_callback(&fired),
            Duration::from_millis(100),
            None,
            CycleMissPolicy::FireWithCurrentTime,
            Timestamp::from_millis(0),
        );

        drive(&mut queue, Timestamp::from_millis(100));
        drive(&mut queue, Timestamp::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(queue.next_deadline(), Some(Timestamp::from_millis(300)));
    }

    #[test]
    fn test_cycle_miss_skips_backlog() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add_cyclic(
            counter_callback(&fired),
            Duration::from_millis(100),
            None,
            CycleMissPolicy::FireWithCurrentTime,
            Timestamp::from_millis(0),
        );

        // Five cycles late: one firing, rebased from the current time
        drive(&mut queue, Timestamp::from_millis(550));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.next_deadline(), Some(Timestamp::from_millis(650)));
    }

    #[test]
    fn test_remove_while_executing_drops_callback() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicU32::new(0));
        let id = queue.add_cyclic(
            counter_callback(&fired),
            Duration::from_millis(10),
            None,
            CycleMissPolicy::FireWithCurrentTime,
            Timestamp::from_millis(0),
        );

        let due = queue.take_due(Timestamp::from_millis(10));
        assert_eq!(due.len(), 1);
        queue.remove(id);
        for timer in due {
            queue.restore(timer);
        }
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_modify_cyclic_rebases_deadline() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicU32::new(0));
        let id = queue.add_cyclic(
            counter_callback(&fired),
            Duration::from_millis(100),
            None,
            CycleMissPolicy::FireWithCurrentTime,
            Timestamp::from_millis(0),
        );

        queue
            .modify_cyclic(
                id,
                Duration::from_millis(500),
                None,
                CycleMissPolicy::FireWithCurrentTime,
                Timestamp::from_millis(0),
            )
            .unwrap();
        assert_eq!(queue.next_deadline(), Some(Timestamp::from_millis(500)));

        // The stale heap pair at 100 must not fire the callback early
        drive(&mut queue, Timestamp::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drive(&mut queue, Timestamp::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(queue.modify_cyclic(
            999,
            Duration::from_millis(1),
            None,
            CycleMissPolicy::FireWithCurrentTime,
            Timestamp::from_millis(0)
        ).is_err());
    }
}
