//! User thread pool of split groups
//!
//! Unbounded lock-free queue drained by the group's user threads.
//! Idle threads park on a [`Parker`] and are woken one per submitted
//! task.

use crate::invoker;
use crate::parking::Parker;
use crate::Task;

use crossbeam_queue::SegQueue;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Upper bound on one idle park, so a closed pool is noticed even
/// without a wakeup.
const IDLE_PARK: Duration = Duration::from_millis(100);

pub(crate) struct TaskPool {
    queue: SegQueue<Task>,
    parker: Parker,
    closed: AtomicBool,
    executed: AtomicU64,
}

impl TaskPool {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            parker: Parker::new(),
            closed: AtomicBool::new(false),
            executed: AtomicU64::new(0),
        }
    }

    /// Queue a task. Hands it back once the pool is closed.
    pub fn submit(&self, task: Task) -> Result<(), Task> {
        if self.closed.load(Ordering::Acquire) {
            return Err(task);
        }
        self.queue.push(task);
        self.parker.wake_one();
        Ok(())
    }

    /// Stop accepting tasks; workers exit once the queue is empty.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.parker.wake_all();
    }

    #[cfg(test)]
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Worker loop. Returns when the pool is closed and drained.
    pub fn run_worker(&self) {
        loop {
            invoker::reset_depth();
            if let Some(task) = self.queue.pop() {
                task();
                self.executed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            self.parker.park(Some(IDLE_PARK), || {
                !self.queue.is_empty() || self.closed.load(Ordering::Acquire)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_drains_then_exits_after_close() {
        let pool = Arc::new(TaskPool::new());
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = count.clone();
            pool.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .ok()
            .unwrap();
        }
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let p = pool.clone();
                thread::spawn(move || p.run_worker())
            })
            .collect();
        while count.load(Ordering::SeqCst) < 100 {
            thread::yield_now();
        }
        pool.close();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(pool.executed(), 100);
        assert!(pool.submit(Box::new(|| {})).is_err());
    }
}
