//! Threads currently inside a native call on one descriptor
//!
//! File channels allow any number of concurrent positional operations,
//! so unlike socket channels they cannot record one reader and one
//! writer. Each operation takes a slot for the duration of its native
//! call. Close marks the set closing, signals every occupant, and the
//! occupant that empties the set afterwards performs the release.

use chanio_core::{ChannelError, NativeOps, NativeThread, RawHandle, Result};

use log::warn;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Slots {
    threads: Vec<Option<NativeThread>>,
    occupied: usize,
    closing: bool,
}

#[derive(Debug, Default)]
pub(crate) struct NativeThreadSet {
    slots: Mutex<Slots>,
}

/// What the caller of `close` must do next
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// Already closing
    None,
    /// Set was empty: release now
    ReleaseNow,
    /// Last occupant to leave releases
    Deferred,
}

impl NativeThreadSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupy a slot for the calling thread; `Closed` once closing.
    pub fn add(&self, thread: NativeThread) -> Result<usize> {
        let mut s = self.slots.lock();
        if s.closing {
            return Err(ChannelError::Closed);
        }
        s.occupied += 1;
        if let Some(i) = s.threads.iter().position(Option::is_none) {
            s.threads[i] = Some(thread);
            return Ok(i);
        }
        s.threads.push(Some(thread));
        Ok(s.threads.len() - 1)
    }

    /// Vacate `slot`. Returns true if the caller must release the
    /// descriptor: the set is closing and this was its last occupant.
    pub fn remove(&self, slot: usize) -> bool {
        let mut s = self.slots.lock();
        if let Some(entry) = s.threads.get_mut(slot) {
            if entry.take().is_some() {
                s.occupied -= 1;
            }
        }
        s.closing && s.occupied == 0
    }

    /// Start closing. With occupants, pre-close `fd` and signal each one.
    pub fn close(&self, ops: &dyn NativeOps, fd: RawHandle) -> CloseAction {
        let mut s = self.slots.lock();
        if s.closing {
            return CloseAction::None;
        }
        s.closing = true;
        if s.occupied == 0 {
            return CloseAction::ReleaseNow;
        }
        if let Err(e) = ops.pre_close(fd) {
            warn!("fd {}: pre-close failed: {}", fd, e);
        }
        for thread in s.threads.iter().flatten() {
            if let Err(e) = ops.signal(*thread) {
                warn!("signalling {:?} failed: {}", thread, e);
            }
        }
        CloseAction::Deferred
    }

    #[cfg(test)]
    fn occupied(&self) -> usize {
        self.slots.lock().occupied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::LibcOps;

    #[test]
    fn test_slots_are_reused() {
        let set = NativeThreadSet::new();
        let a = set.add(NativeThread(1)).unwrap();
        let b = set.add(NativeThread(2)).unwrap();
        assert_ne!(a, b);
        assert!(!set.remove(a));
        let c = set.add(NativeThread(3)).unwrap();
        assert_eq!(a, c);
        assert_eq!(set.occupied(), 2);
    }

    #[test]
    fn test_close_on_empty_set_releases_now() {
        let ops = LibcOps::new();
        let set = NativeThreadSet::new();
        assert_eq!(set.close(&ops, -1), CloseAction::ReleaseNow);
        assert_eq!(set.close(&ops, -1), CloseAction::None);
        assert_eq!(set.add(NativeThread(1)), Err(ChannelError::Closed));
    }

    #[test]
    fn test_last_occupant_releases_after_close() {
        let ops = LibcOps::new();
        let set = NativeThreadSet::new();
        // Our own thread, so the signal lands on a thread that ignores it.
        let me = ops.current_thread();
        let (fd, peer) = ops.socketpair().unwrap();
        let a = set.add(me).unwrap();
        let b = set.add(me).unwrap();
        assert_eq!(set.close(&ops, fd), CloseAction::Deferred);
        assert!(!set.remove(a));
        assert!(set.remove(b));
        ops.close(fd).unwrap();
        ops.close(peer).unwrap();
    }
}
