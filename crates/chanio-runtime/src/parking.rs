//! Condvar parking for idle user threads
//!
//! Wake permits are counted under the mutex, so a `wake_one` that races
//! with a thread about to park is never lost: either the thread sees the
//! permit before waiting, or it is already waiting when notified.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) struct Parker {
    /// Outstanding wake permits
    permits: Mutex<usize>,
    condvar: Condvar,
    /// Count of parked threads
    parked: AtomicUsize,
}

impl Parker {
    pub fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    /// Park until woken or `timeout` elapses.
    ///
    /// `ready` is evaluated under the parking lock; if it reports work
    /// the thread returns without waiting. Returns true if woken.
    pub fn park(&self, timeout: Option<Duration>, ready: impl Fn() -> bool) -> bool {
        let mut permits = self.permits.lock();
        if *permits > 0 {
            *permits -= 1;
            return true;
        }
        if ready() {
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);
        let woken = match timeout {
            Some(t) => !self.condvar.wait_for(&mut permits, t).timed_out(),
            None => {
                self.condvar.wait(&mut permits);
                true
            }
        };
        self.parked.fetch_sub(1, Ordering::SeqCst);

        if *permits > 0 {
            *permits -= 1;
        }
        woken
    }

    pub fn wake_one(&self) {
        {
            let mut permits = self.permits.lock();
            *permits += 1;
        }
        self.condvar.notify_one();
    }

    pub fn wake_all(&self) {
        {
            let mut permits = self.permits.lock();
            *permits += self.parked.load(Ordering::SeqCst).max(1);
        }
        self.condvar.notify_all();
    }

    #[cfg(test)]
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_permit_before_park() {
        let p = Parker::new();
        p.wake_one();
        assert!(p.park(Some(Duration::from_secs(5)), || false));
    }

    #[test]
    fn test_ready_skips_wait() {
        let p = Parker::new();
        assert!(p.park(None, || true));
    }

    #[test]
    fn test_timeout() {
        let p = Parker::new();
        assert!(!p.park(Some(Duration::from_millis(10)), || false));
    }

    #[test]
    fn test_wake_parked_thread() {
        let p = Arc::new(Parker::new());
        let p2 = p.clone();
        let h = thread::spawn(move || p2.park(Some(Duration::from_secs(10)), || false));
        while p.parked_count() == 0 {
            thread::yield_now();
        }
        p.wake_one();
        assert!(h.join().unwrap());
    }
}
