use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

const TELEMETRY_PERIOD: Duration = Duration::from_secs(1);

/// Snapshot of a queue's lifetime counters.
///
/// Invariant at every observation point: `depth = pushes - pops - drops`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub pushes: u64,
    pub pops: u64,
    pub drops: u64,
    pub pop_fails: u64,
    pub depth: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
    /// Set on the first successful pop; disarms the pre-consumption guard
    /// permanently.
    consumed: bool,
    pushes: u64,
    pops: u64,
    drops: u64,
    pop_fails: u64,
    period_start: Instant,
    period_pushes: u64,
    period_pops: u64,
    period_drops: u64,
}

/// FIFO connecting two pipeline stages.
///
/// `push` blocks when a capacity is set and reached, `pop` blocks until an
/// item arrives, `stop` wakes every waiter. After `stop` the queue drains:
/// `pop` keeps returning the remaining items, then `None`; `push` becomes a
/// no-op.
///
/// The pre-consumption guard drops the *oldest* item instead of growing past
/// `guard_depth` while no consumer has ever popped, so a stage that is slow
/// to start cannot pile up an unbounded backlog behind it.
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: Option<usize>,
    guard_depth: Option<usize>,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: Option<usize>, guard_depth: Option<usize>) -> Self {
        Self {
            name,
            capacity,
            guard_depth,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                stopped: false,
                consumed: false,
                pushes: 0,
                pops: 0,
                drops: 0,
                pop_fails: 0,
                period_start: Instant::now(),
                period_pushes: 0,
                period_pops: 0,
                period_drops: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn unbounded(name: &'static str, guard_depth: Option<usize>) -> Self {
        Self::new(name, None, guard_depth)
    }

    pub fn bounded(name: &'static str, capacity: usize) -> Self {
        Self::new(name, Some(capacity), None)
    }

    /// Hand an item to the queue. Returns `false` (and releases the item)
    /// when the queue has been stopped.
    pub fn push(&self, item: T) -> bool {
        let mut s = self.state.lock().expect("queue lock poisoned");
        if s.stopped {
            return false;
        }
        if let Some(guard) = self.guard_depth {
            while !s.consumed && s.items.len() >= guard {
                s.items.pop_front();
                s.drops += 1;
                s.period_drops += 1;
                warn!("queue {}: guard dropped oldest (depth {})", self.name, guard);
            }
        }
        if let Some(cap) = self.capacity {
            while s.items.len() >= cap && !s.stopped {
                s = self.not_full.wait(s).expect("queue lock poisoned");
            }
            if s.stopped {
                return false;
            }
        }
        s.items.push_back(item);
        s.pushes += 1;
        s.period_pushes += 1;
        self.maybe_report(&mut s);
        self.not_empty.notify_one();
        true
    }

    /// Take the next item, blocking while the queue is running and empty.
    /// Returns `None` once the queue is stopped and drained.
    pub fn pop(&self) -> Option<T> {
        let mut s = self.state.lock().expect("queue lock poisoned");
        loop {
            if let Some(item) = s.items.pop_front() {
                s.pops += 1;
                s.period_pops += 1;
                s.consumed = true;
                self.maybe_report(&mut s);
                self.not_full.notify_one();
                return Some(item);
            }
            if s.stopped {
                s.pop_fails += 1;
                return None;
            }
            s = self.not_empty.wait(s).expect("queue lock poisoned");
        }
    }

    /// Stop the queue. Idempotent; wakes all waiters on both sides.
    pub fn stop(&self) {
        let mut s = self.state.lock().expect("queue lock poisoned");
        s.stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().expect("queue lock poisoned").stopped
    }

    pub fn depth(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").items.len()
    }

    pub fn counters(&self) -> QueueCounters {
        let s = self.state.lock().expect("queue lock poisoned");
        QueueCounters {
            pushes: s.pushes,
            pops: s.pops,
            drops: s.drops,
            pop_fails: s.pop_fails,
            depth: s.items.len(),
        }
    }

    /// Per-second telemetry, emitted by whichever operation rolls the period
    /// over. The timer is per-queue.
    fn maybe_report(&self, s: &mut QueueState<T>) {
        if s.period_start.elapsed() < TELEMETRY_PERIOD {
            return;
        }
        debug!(
            "queue {}: {} push/s, {} pop/s, {} drop/s, depth={}",
            self.name,
            s.period_pushes,
            s.period_pops,
            s.period_drops,
            s.items.len()
        );
        s.period_pushes = 0;
        s.period_pops = 0;
        s.period_drops = 0;
        s.period_start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::unbounded("t", None);
        for i in 0..5 {
            assert!(q.push(i));
        }
        for i in 0..5 {
            assert_eq!(q.pop(), Some(i));
        }
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(BoundedQueue::<u32>::unbounded("t", None));
        let q2 = q.clone();
        let h = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        assert!(q.push(7));
        assert_eq!(h.join().unwrap(), Some(7));
    }

    #[test]
    fn stop_drains_then_none() {
        let q = BoundedQueue::unbounded("t", None);
        q.push(1);
        q.push(2);
        q.stop();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
        assert_eq!(q.counters().pop_fails, 1);
    }

    #[test]
    fn push_after_stop_is_noop() {
        let q = BoundedQueue::unbounded("t", None);
        q.stop();
        assert!(!q.push(1));
        assert_eq!(q.depth(), 0);
        assert_eq!(q.counters().pushes, 0);
    }

    #[test]
    fn stop_wakes_blocked_pop() {
        let q = Arc::new(BoundedQueue::<u32>::unbounded("t", None));
        let q2 = q.clone();
        let h = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.stop();
        assert_eq!(h.join().unwrap(), None);
    }

    #[test]
    fn bounded_push_blocks_until_pop() {
        let q = Arc::new(BoundedQueue::bounded("t", 1));
        assert!(q.push(1));
        let q2 = q.clone();
        let h = thread::spawn(move || q2.push(2));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.depth(), 1);
        assert_eq!(q.pop(), Some(1));
        assert!(h.join().unwrap());
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn stop_wakes_blocked_push() {
        let q = Arc::new(BoundedQueue::bounded("t", 1));
        assert!(q.push(1));
        let q2 = q.clone();
        let h = thread::spawn(move || q2.push(2));
        thread::sleep(Duration::from_millis(50));
        q.stop();
        assert!(!h.join().unwrap());
    }

    #[test]
    fn guard_drops_oldest_until_first_pop() {
        let q = BoundedQueue::unbounded("t", Some(3));
        for i in 0..5 {
            assert!(q.push(i));
        }
        // 0 and 1 were dropped to keep depth at the guard threshold
        let c = q.counters();
        assert_eq!(c.drops, 2);
        assert_eq!(q.depth(), 3);
        assert_eq!(q.pop(), Some(2));

        // guard is disarmed permanently after the first pop
        for i in 5..20 {
            assert!(q.push(i));
        }
        assert_eq!(q.counters().drops, 2);
        assert_eq!(q.depth(), 2 + 15);
    }

    #[test]
    fn counters_reconcile() {
        let q = BoundedQueue::unbounded("t", Some(2));
        for i in 0..4 {
            q.push(i);
        }
        q.pop();
        let c = q.counters();
        assert_eq!(c.depth as u64, c.pushes - c.pops - c.drops);
    }
}
