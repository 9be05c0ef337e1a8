//! Scriptable native layer for tests
//!
//! [`GatedOps`] forwards every call to another [`NativeOps`] (libc by
//! default) but records release calls and can hold a thread inside
//! `poll` or `read`, which makes the ordering of close (or a timer)
//! against an in-flight operation deterministic.

use crate::native::LibcOps;

use chanio_core::{
    ChannelError, Events, Family, FileKey, FileOptions, NativeOps, NativeSocketAddress,
    NativeThread, Outcome, RawHandle, Result, ShutdownHow, SocketKind,
};

use parking_lot::{Condvar, Mutex};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A release call observed by [`GatedOps`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCall {
    PreClose(RawHandle),
    Close(RawHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    Poll,
    Read,
}

#[derive(Debug, Default)]
struct Gate {
    /// Descriptor and call to hold next
    armed: Option<(RawHandle, Held)>,
    parked: bool,
    released: bool,
}

pub struct GatedOps {
    inner: Arc<dyn NativeOps>,
    calls: Mutex<Vec<ReleaseCall>>,
    gate: Mutex<Gate>,
    cv: Condvar,
    fail_size: AtomicBool,
}

impl GatedOps {
    /// Gate over the libc layer
    pub fn new() -> Arc<Self> {
        Self::wrap(LibcOps::shared())
    }

    pub fn wrap(inner: Arc<dyn NativeOps>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(Gate::default()),
            cv: Condvar::new(),
            fail_size: AtomicBool::new(false),
        })
    }

    /// Hold the next thread that polls `fd` until [`release`](Self::release).
    /// The held poll then returns `Interrupted`.
    pub fn hold_poll(&self, fd: RawHandle) {
        self.arm(fd, Held::Poll);
    }

    /// Hold the next thread that reads `fd`. The held read then returns
    /// `WouldBlock` without touching the descriptor.
    pub fn hold_read(&self, fd: RawHandle) {
        self.arm(fd, Held::Read);
    }

    fn arm(&self, fd: RawHandle, held: Held) {
        let mut gate = self.gate.lock();
        gate.armed = Some((fd, held));
        gate.parked = false;
        gate.released = false;
    }

    /// Block in the call if it is the armed one. Returns whether it was.
    fn park_if_armed(&self, fd: RawHandle, held: Held) -> bool {
        let mut gate = self.gate.lock();
        if gate.armed != Some((fd, held)) {
            return false;
        }
        gate.parked = true;
        self.cv.notify_all();
        while !gate.released {
            self.cv.wait(&mut gate);
        }
        true
    }

    /// Make every `size` query fail with an I/O error.
    pub fn fail_size(&self, on: bool) {
        self.fail_size.store(on, Ordering::SeqCst);
    }

    /// Wait until a thread is held.
    pub fn wait_parked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        while !gate.parked {
            if self.cv.wait_until(&mut gate, deadline).timed_out() {
                return gate.parked;
            }
        }
        true
    }

    /// Let the held thread go.
    pub fn release(&self) {
        let mut gate = self.gate.lock();
        gate.released = true;
        gate.armed = None;
        self.cv.notify_all();
    }

    pub fn release_calls(&self) -> Vec<ReleaseCall> {
        self.calls.lock().clone()
    }

    pub fn was_pre_closed(&self, fd: RawHandle) -> bool {
        self.calls.lock().contains(&ReleaseCall::PreClose(fd))
    }

    pub fn was_closed(&self, fd: RawHandle) -> bool {
        self.calls.lock().contains(&ReleaseCall::Close(fd))
    }
}

impl NativeOps for GatedOps {
    fn socket(&self, family: Family, kind: SocketKind) -> Result<RawHandle> {
        self.inner.socket(family, kind)
    }

    fn socketpair(&self) -> Result<(RawHandle, RawHandle)> {
        self.inner.socketpair()
    }

    fn bind(&self, fd: RawHandle, addr: &NativeSocketAddress) -> Result<()> {
        self.inner.bind(fd, addr)
    }

    fn listen(&self, fd: RawHandle, backlog: i32) -> Result<()> {
        self.inner.listen(fd, backlog)
    }

    fn set_reuse_address(&self, fd: RawHandle, on: bool) -> Result<()> {
        self.inner.set_reuse_address(fd, on)
    }

    fn connect(&self, fd: RawHandle, addr: &NativeSocketAddress) -> Result<Outcome<()>> {
        self.inner.connect(fd, addr)
    }

    fn finish_connect(&self, fd: RawHandle) -> Result<Outcome<()>> {
        self.inner.finish_connect(fd)
    }

    fn accept(&self, fd: RawHandle, peer: &mut NativeSocketAddress) -> Result<Outcome<RawHandle>> {
        self.inner.accept(fd, peer)
    }

    fn recv_from(
        &self,
        fd: RawHandle,
        buf: &mut [u8],
        from: &mut NativeSocketAddress,
    ) -> Result<Outcome<usize>> {
        self.inner.recv_from(fd, buf, from)
    }

    fn send_to(&self, fd: RawHandle, buf: &[u8], to: &NativeSocketAddress) -> Result<Outcome<usize>> {
        self.inner.send_to(fd, buf, to)
    }

    fn disconnect(&self, fd: RawHandle) -> Result<()> {
        self.inner.disconnect(fd)
    }

    fn shutdown(&self, fd: RawHandle, how: ShutdownHow) -> Result<()> {
        self.inner.shutdown(fd, how)
    }

    fn local_address(&self, fd: RawHandle, out: &mut NativeSocketAddress) -> Result<()> {
        self.inner.local_address(fd, out)
    }

    fn peer_address(&self, fd: RawHandle, out: &mut NativeSocketAddress) -> Result<()> {
        self.inner.peer_address(fd, out)
    }

    fn read(&self, fd: RawHandle, buf: &mut [u8]) -> Result<Outcome<usize>> {
        if self.park_if_armed(fd, Held::Read) {
            return Ok(Outcome::WouldBlock);
        }
        self.inner.read(fd, buf)
    }

    fn write(&self, fd: RawHandle, buf: &[u8]) -> Result<Outcome<usize>> {
        self.inner.write(fd, buf)
    }

    fn poll(&self, fd: RawHandle, events: Events, timeout_ms: i32) -> Result<Outcome<Events>> {
        if self.park_if_armed(fd, Held::Poll) {
            return Ok(Outcome::Interrupted);
        }
        self.inner.poll(fd, events, timeout_ms)
    }

    fn open(&self, path: &Path, options: &FileOptions) -> Result<RawHandle> {
        self.inner.open(path, options)
    }

    fn read_at(&self, fd: RawHandle, buf: &mut [u8], position: u64) -> Result<Outcome<usize>> {
        self.inner.read_at(fd, buf, position)
    }

    fn write_at(&self, fd: RawHandle, buf: &[u8], position: u64) -> Result<Outcome<usize>> {
        self.inner.write_at(fd, buf, position)
    }

    fn size(&self, fd: RawHandle) -> Result<u64> {
        if self.fail_size.load(Ordering::SeqCst) {
            return Err(ChannelError::from_errno(libc::EIO));
        }
        self.inner.size(fd)
    }

    fn truncate(&self, fd: RawHandle, size: u64) -> Result<()> {
        self.inner.truncate(fd, size)
    }

    fn force(&self, fd: RawHandle, metadata: bool) -> Result<()> {
        self.inner.force(fd, metadata)
    }

    fn file_key(&self, fd: RawHandle) -> Result<FileKey> {
        self.inner.file_key(fd)
    }

    fn lock(
        &self,
        fd: RawHandle,
        position: u64,
        size: u64,
        shared: bool,
        wait: bool,
    ) -> Result<Outcome<()>> {
        self.inner.lock(fd, position, size, shared, wait)
    }

    fn unlock(&self, fd: RawHandle, position: u64, size: u64) -> Result<()> {
        self.inner.unlock(fd, position, size)
    }

    fn pre_close(&self, fd: RawHandle) -> Result<()> {
        self.calls.lock().push(ReleaseCall::PreClose(fd));
        self.inner.pre_close(fd)
    }

    fn close(&self, fd: RawHandle) -> Result<()> {
        self.calls.lock().push(ReleaseCall::Close(fd));
        self.inner.close(fd)
    }

    fn current_thread(&self) -> NativeThread {
        self.inner.current_thread()
    }

    fn signal(&self, thread: NativeThread) -> Result<()> {
        self.inner.signal(thread)
    }
}
