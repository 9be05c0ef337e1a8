//! Native-call boundary
//!
//! `NativeOps` is the capability interface every channel is composed
//! with. It models the narrow set of primitives the channel state
//! machines need: non-blocking transfer calls that report
//! [`Outcome::WouldBlock`] / [`Outcome::Interrupted`], a per-descriptor
//! readiness wait, thread signalling, and two-phase release.
//!
//! # Implementors
//!
//! - `LibcOps` (chanio-channels): libc/nix syscalls, the default.
//! - `GatedOps` (chanio-channels, testing): wraps another impl, records
//!   release calls and can hold a thread inside `poll`.
//!
//! **Contract:**
//! - Socket transfer calls (`read`, `write`, `accept`, `connect`, ...)
//!   must never block; socket descriptors are non-blocking. File calls
//!   may take as long as the device does, but only `lock(.., wait = true)`
//!   waits on another party.
//! - `poll` is the only call that parks the caller.
//! - `signal` must make a thread parked in `poll` (or any other native
//!   call of this trait) return `Interrupted` promptly.
//! - `pre_close` keeps the descriptor number reserved; `close` frees it.

use crate::error::Result;
use crate::events::{Events, Outcome};
use crate::sockaddr::{Family, NativeSocketAddress};
use crate::state::ShutdownHow;

use std::path::Path;

/// Raw descriptor handle
pub type RawHandle = i32;

/// Identity of a native thread that can be signalled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeThread(pub u64);

/// Identity of an underlying file (device + inode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    pub dev: u64,
    pub ino: u64,
}

/// Socket type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// How a file channel is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
}

impl FileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, yes: bool) -> Self {
        self.read = yes;
        self
    }

    pub fn write(mut self, yes: bool) -> Self {
        self.write = yes;
        self
    }

    pub fn append(mut self, yes: bool) -> Self {
        self.append = yes;
        self
    }

    pub fn create(mut self, yes: bool) -> Self {
        self.create = yes;
        self
    }

    pub fn create_new(mut self, yes: bool) -> Self {
        self.create_new = yes;
        self
    }

    pub fn truncate(mut self, yes: bool) -> Self {
        self.truncate = yes;
        self
    }

    /// Writable in any form
    #[inline]
    pub fn writable(&self) -> bool {
        self.write || self.append
    }
}

/// Native primitives consumed by the channel layer
pub trait NativeOps: Send + Sync + 'static {
    // ── sockets ──

    /// Create a non-blocking, close-on-exec socket.
    fn socket(&self, family: Family, kind: SocketKind) -> Result<RawHandle>;

    /// Create a connected pair of non-blocking stream sockets.
    fn socketpair(&self) -> Result<(RawHandle, RawHandle)>;

    fn bind(&self, fd: RawHandle, addr: &NativeSocketAddress) -> Result<()>;

    fn listen(&self, fd: RawHandle, backlog: i32) -> Result<()>;

    /// `SO_REUSEADDR`
    fn set_reuse_address(&self, fd: RawHandle, on: bool) -> Result<()>;

    /// Start a connect. `Ready(())` = connected now, `WouldBlock` = in progress.
    fn connect(&self, fd: RawHandle, addr: &NativeSocketAddress) -> Result<Outcome<()>>;

    /// Check a pending connect (`SO_ERROR`) after the socket became writable.
    fn finish_connect(&self, fd: RawHandle) -> Result<Outcome<()>>;

    /// Accept one connection; the peer address is written into `peer`.
    fn accept(&self, fd: RawHandle, peer: &mut NativeSocketAddress) -> Result<Outcome<RawHandle>>;

    fn recv_from(
        &self,
        fd: RawHandle,
        buf: &mut [u8],
        from: &mut NativeSocketAddress,
    ) -> Result<Outcome<usize>>;

    fn send_to(&self, fd: RawHandle, buf: &[u8], to: &NativeSocketAddress) -> Result<Outcome<usize>>;

    /// Dissolve a datagram association (`connect(AF_UNSPEC)`).
    fn disconnect(&self, fd: RawHandle) -> Result<()>;

    fn shutdown(&self, fd: RawHandle, how: ShutdownHow) -> Result<()>;

    fn local_address(&self, fd: RawHandle, out: &mut NativeSocketAddress) -> Result<()>;

    fn peer_address(&self, fd: RawHandle, out: &mut NativeSocketAddress) -> Result<()>;

    // ── generic transfer ──

    /// `Ready(0)` with a non-empty buffer means end of stream.
    fn read(&self, fd: RawHandle, buf: &mut [u8]) -> Result<Outcome<usize>>;

    fn write(&self, fd: RawHandle, buf: &[u8]) -> Result<Outcome<usize>>;

    /// Park until `fd` is ready for one of `events` or `timeout_ms` elapses.
    ///
    /// `timeout_ms` = 0 polls without waiting, -1 waits indefinitely.
    /// Returns the ready set (empty on timeout).
    fn poll(&self, fd: RawHandle, events: Events, timeout_ms: i32) -> Result<Outcome<Events>>;

    // ── files ──

    fn open(&self, path: &Path, options: &FileOptions) -> Result<RawHandle>;

    fn read_at(&self, fd: RawHandle, buf: &mut [u8], position: u64) -> Result<Outcome<usize>>;

    fn write_at(&self, fd: RawHandle, buf: &[u8], position: u64) -> Result<Outcome<usize>>;

    fn size(&self, fd: RawHandle) -> Result<u64>;

    fn truncate(&self, fd: RawHandle, size: u64) -> Result<()>;

    fn force(&self, fd: RawHandle, metadata: bool) -> Result<()>;

    fn file_key(&self, fd: RawHandle) -> Result<FileKey>;

    /// Acquire a byte-range lock. With `wait = false`, contention is `WouldBlock`.
    fn lock(&self, fd: RawHandle, position: u64, size: u64, shared: bool, wait: bool)
        -> Result<Outcome<()>>;

    fn unlock(&self, fd: RawHandle, position: u64, size: u64) -> Result<()>;

    // ── release and signalling ──

    /// Phase one of close: keep the number reserved, make in-flight calls fail.
    fn pre_close(&self, fd: RawHandle) -> Result<()>;

    /// Phase two of close: release the descriptor.
    fn close(&self, fd: RawHandle) -> Result<()>;

    /// Identity of the calling thread.
    fn current_thread(&self) -> NativeThread;

    /// Abort `thread`'s current blocking native call.
    fn signal(&self, thread: NativeThread) -> Result<()>;
}
