//! Timeout facility
//!
//! One thread per group runs delayed tasks (operation timeouts) off a
//! deadline-ordered `BinaryHeap`.
//!
//! # Cancellation Strategy
//!
//! Lazy: the task body lives in a map keyed by timer id and the heap
//! only holds `(deadline, id)`. Cancelling removes the body; the stale
//! heap entry is skipped when it surfaces. Cancel is O(1) and never
//! touches the heap.

use crate::Task;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Wrapper for heap ordering (min-heap by deadline)
#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    id: u64,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earliest deadline first, ties by id
        match other.deadline.cmp(&self.deadline) {
            std::cmp::Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
    shutdown: bool,
    total_scheduled: u64,
    total_fired: u64,
    total_cancelled: u64,
}

struct TimerShared {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// Statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct TimerStats {
    pub active: usize,
    pub total_scheduled: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

/// Handle to a scheduled timeout
///
/// Dropping the handle does not cancel the task.
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    id: u64,
    shared: Weak<TimerShared>,
}

impl TimeoutHandle {
    /// Cancel the task. Returns false if it already ran, is running,
    /// or was cancelled before.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared.state.lock();
        let removed = state.tasks.remove(&self.id).is_some();
        if removed {
            state.total_cancelled += 1;
        }
        removed
    }
}

/// Deadline-ordered scheduler with its own thread
pub struct TimeoutScheduler {
    shared: Arc<TimerShared>,
}

impl TimeoutScheduler {
    /// Start the scheduler thread.
    pub fn start(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            condvar: Condvar::new(),
        });
        let worker = shared.clone();
        thread::Builder::new()
            .name(format!("{}-timeout", name))
            .spawn(move || timer_loop(worker))?;
        Ok(Self { shared })
    }

    /// Run `task` after `delay`. Returns `None` once shut down.
    pub fn schedule(&self, task: Task, delay: Duration) -> Option<TimeoutHandle> {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.total_scheduled += 1;

        let earliest = state.heap.peek().map_or(true, |e| deadline < e.deadline);
        state.heap.push(HeapEntry { deadline, id });
        state.tasks.insert(id, task);
        drop(state);

        if earliest {
            self.shared.condvar.notify_one();
        }
        Some(TimeoutHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Drop all pending tasks and stop the thread. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        state.heap.clear();
        state.tasks.clear();
        drop(state);
        self.shared.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    pub fn stats(&self) -> TimerStats {
        let state = self.shared.state.lock();
        TimerStats {
            active: state.tasks.len(),
            total_scheduled: state.total_scheduled,
            total_fired: state.total_fired,
            total_cancelled: state.total_cancelled,
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    debug!("timeout thread started");
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(next) = state.heap.peek().map(|e| e.deadline) else {
            shared.condvar.wait(&mut state);
            continue;
        };
        if next > Instant::now() {
            shared.condvar.wait_until(&mut state, next);
            continue;
        }

        let Some(entry) = state.heap.pop() else {
            continue;
        };
        // Stale entry of a cancelled task
        let Some(task) = state.tasks.remove(&entry.id) else {
            continue;
        };
        state.total_fired += 1;

        drop(state);
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("timeout task panicked");
        }
        state = shared.state.lock();
    }
    debug!("timeout thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_fires_in_deadline_order() {
        let sched = TimeoutScheduler::start("t").unwrap();
        let (tx, rx) = mpsc::channel();
        for (n, ms) in [(3, 60u64), (1, 10), (2, 30)] {
            let tx = tx.clone();
            sched
                .schedule(Box::new(move || tx.send(n).unwrap()), Duration::from_millis(ms))
                .unwrap();
        }
        let got: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel_before_fire() {
        let sched = TimeoutScheduler::start("t").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let h = sched
            .schedule(
                Box::new(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(50),
            )
            .unwrap();
        assert!(h.cancel());
        assert!(!h.cancel());
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(sched.stats().total_cancelled, 1);
    }

    #[test]
    fn test_cancel_after_fire_returns_false() {
        let sched = TimeoutScheduler::start("t").unwrap();
        let (tx, rx) = mpsc::channel();
        let h = sched
            .schedule(Box::new(move || tx.send(()).unwrap()), Duration::ZERO)
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!h.cancel());
    }

    #[test]
    fn test_schedule_after_shutdown_is_none() {
        let sched = TimeoutScheduler::start("t").unwrap();
        sched.shutdown();
        assert!(sched.is_shutdown());
        assert!(sched
            .schedule(Box::new(|| {}), Duration::from_millis(1))
            .is_none());
    }

    #[test]
    fn test_panicking_task_does_not_kill_thread() {
        let sched = TimeoutScheduler::start("t").unwrap();
        sched
            .schedule(Box::new(|| panic!("boom")), Duration::ZERO)
            .unwrap();
        let (tx, rx) = mpsc::channel();
        sched
            .schedule(Box::new(move || tx.send(()).unwrap()), Duration::from_millis(20))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
