//! Shared state machine of blocking socket channels
//!
//! A [`NativeChannel`] owns one descriptor and three locks:
//!
//! - the **read side** and **write side** locks serialize operations of
//!   one direction and guard that direction's private data (address
//!   buffers). They are only ever `try_lock`ed: a second concurrent
//!   operation in the same direction fails fast.
//! - the **state** lock guards the phase, the threads currently inside
//!   a native call, and endpoint addresses. It is held only for short
//!   field updates, never across a native call that can park.
//!
//! # Close
//!
//! `close` moves the phase to `Closing`. With no operation in flight the
//! descriptor is released at once. Otherwise it is pre-closed and every
//! recorded thread is signalled; the last operation to leave releases
//! it. The descriptor number therefore cannot be reused while any
//! thread may still pass it to the OS.

use chanio_core::{
    ChannelError, ChannelPhase, Events, Family, NativeOps, NativeSocketAddress, NativeThread,
    Outcome, RawHandle, Result,
};

use log::{trace, warn};
use parking_lot::{Mutex, MutexGuard};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Whether an operation may park on `WouldBlock`
#[derive(Debug, Clone, Copy)]
pub(crate) enum Park {
    /// Single attempt
    Never,
    /// Park until ready, giving up with `TimedOut` at the deadline
    Until(Option<Instant>),
}

impl Park {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Park::Until(timeout.map(|t| Instant::now() + t))
    }
}

#[derive(Debug)]
pub(crate) struct HandleState {
    pub phase: ChannelPhase,
    pub reader: Option<NativeThread>,
    pub writer: Option<NativeThread>,
    pub input_shutdown: bool,
    pub output_shutdown: bool,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

pub(crate) struct NativeChannel<R, W> {
    pub ops: Arc<dyn NativeOps>,
    pub fd: RawHandle,
    pub family: Family,
    read_side: Mutex<R>,
    write_side: Mutex<W>,
    state: Mutex<HandleState>,
}

/// Poll timeout for the time left until `deadline`, rounded up
fn poll_millis(left: Duration) -> i32 {
    let ms = (left.as_nanos() + 999_999) / 1_000_000;
    ms.min(i32::MAX as u128) as i32
}

/// Encode `addr` for a socket of `family`.
pub(crate) fn native_address(family: Family, addr: &SocketAddr) -> Result<NativeSocketAddress> {
    let mut native = NativeSocketAddress::new();
    native.encode(family, addr)?;
    Ok(native)
}

pub(crate) fn query_local(ops: &dyn NativeOps, fd: RawHandle) -> Result<SocketAddr> {
    let mut native = NativeSocketAddress::new();
    ops.local_address(fd, &mut native)?;
    native.decode()
}

pub(crate) fn query_peer(ops: &dyn NativeOps, fd: RawHandle) -> Result<SocketAddr> {
    let mut native = NativeSocketAddress::new();
    ops.peer_address(fd, &mut native)?;
    native.decode()
}

impl<R, W> NativeChannel<R, W> {
    pub fn new(
        ops: Arc<dyn NativeOps>,
        fd: RawHandle,
        family: Family,
        phase: ChannelPhase,
        read_side: R,
        write_side: W,
    ) -> Self {
        Self {
            ops,
            fd,
            family,
            read_side: Mutex::new(read_side),
            write_side: Mutex::new(write_side),
            state: Mutex::new(HandleState {
                phase,
                reader: None,
                writer: None,
                input_shutdown: false,
                output_shutdown: false,
                local: None,
                remote: None,
            }),
        }
    }

    /// Short critical section over the shared state
    #[inline]
    pub fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state.lock().phase.is_open()
    }

    /// Take the read direction or fail with `pending`.
    pub fn lock_read(&self, pending: ChannelError) -> Result<MutexGuard<'_, R>> {
        self.read_side.try_lock().ok_or(pending)
    }

    /// Take the write direction or fail with `WritePending`.
    pub fn lock_write(&self) -> Result<MutexGuard<'_, W>> {
        self.write_side
            .try_lock()
            .ok_or(ChannelError::WritePending)
    }

    /// Validate state and record the calling thread so close can signal it.
    pub fn begin(
        &self,
        dir: Direction,
        validate: impl FnOnce(&mut HandleState) -> Result<()>,
    ) -> Result<()> {
        let thread = self.ops.current_thread();
        let mut st = self.state.lock();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        validate(&mut st)?;
        match dir {
            Direction::Read => st.reader = Some(thread),
            Direction::Write => st.writer = Some(thread),
        }
        Ok(())
    }

    /// Clear the recorded thread; release the descriptor if a close is
    /// waiting on it. An operation that did not complete on a channel
    /// that is no longer open reports `AsynchronousClose`.
    pub fn end(&self, dir: Direction, completed: bool) -> Result<()> {
        let mut st = self.state.lock();
        match dir {
            Direction::Read => st.reader = None,
            Direction::Write => st.writer = None,
        }
        if let Err(e) = self.try_release(&mut st) {
            warn!("fd {}: deferred release failed: {}", self.fd, e);
        }
        if !completed && !st.phase.is_open() {
            return Err(ChannelError::AsynchronousClose);
        }
        Ok(())
    }

    /// Retry `attempt` until it is ready, parking in `poll` for `events`
    /// between attempts. Must be bracketed by `begin`/`end` (it calls `end`).
    ///
    /// `Ok(None)` means a single non-parking attempt would have blocked.
    /// `progressed` tells whether a ready value counts as completion when
    /// the channel was closed underneath (e.g. a zero-byte read does not).
    pub fn run<T>(
        &self,
        dir: Direction,
        events: Events,
        park: Park,
        mut attempt: impl FnMut() -> Result<Outcome<T>>,
        progressed: impl Fn(&T) -> bool,
    ) -> Result<Option<T>> {
        let mut completed = false;
        let out = loop {
            match attempt() {
                Ok(Outcome::Ready(v)) => {
                    completed = progressed(&v);
                    break Ok(Some(v));
                }
                Ok(Outcome::Interrupted) => {
                    if !self.is_open() {
                        break Ok(None);
                    }
                }
                Ok(Outcome::WouldBlock) => {
                    let Park::Until(deadline) = park else {
                        completed = true;
                        break Ok(None);
                    };
                    if !self.is_open() {
                        break Ok(None);
                    }
                    let timeout_ms = match deadline {
                        None => -1,
                        Some(deadline) => {
                            let left = deadline.saturating_duration_since(Instant::now());
                            if left.is_zero() {
                                break Err(ChannelError::TimedOut);
                            }
                            poll_millis(left)
                        }
                    };
                    trace!("fd {}: parking for {:?}", self.fd, events);
                    if let Err(e) = self.ops.poll(self.fd, events, timeout_ms) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        self.end(dir, completed)?;
        out
    }

    /// Two-phase close; see the module docs.
    pub fn close(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !st.phase.is_open() {
            return Ok(());
        }
        st.phase = ChannelPhase::Closing;
        let threads = [st.reader, st.writer];
        if threads.iter().all(Option::is_none) {
            return self.release(&mut st);
        }
        trace!("fd {}: close with operations in flight", self.fd);
        if let Err(e) = self.ops.pre_close(self.fd) {
            warn!("fd {}: pre-close failed: {}", self.fd, e);
        }
        for thread in threads.into_iter().flatten() {
            if let Err(e) = self.ops.signal(thread) {
                warn!("fd {}: signalling {:?} failed: {}", self.fd, thread, e);
            }
        }
        Ok(())
    }

    fn try_release(&self, st: &mut HandleState) -> Result<()> {
        if st.phase == ChannelPhase::Closing && st.reader.is_none() && st.writer.is_none() {
            return self.release(st);
        }
        Ok(())
    }

    fn release(&self, st: &mut HandleState) -> Result<()> {
        st.phase = ChannelPhase::Closed;
        trace!("fd {}: released", self.fd);
        self.ops.close(self.fd)
    }
}

impl<R, W> Drop for NativeChannel<R, W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("fd {}: close on drop failed: {}", self.fd, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_millis_rounds_up() {
        assert_eq!(poll_millis(Duration::from_micros(1)), 1);
        assert_eq!(poll_millis(Duration::from_millis(5)), 5);
        assert_eq!(poll_millis(Duration::from_secs(u64::MAX / 2)), i32::MAX);
    }
}
