//! Asynchronous stream socket channel
//!
//! Operations never park the caller. An operation that cannot complete
//! on its first attempt is stored in the channel and the descriptor is
//! armed on the group's port; the group thread that receives the
//! readiness event retries it and resolves its future.
//!
//! Locks:
//! - `close_lock` is held shared around every native call on the
//!   descriptor and exclusively by `close`, so the descriptor is never
//!   released under a running call.
//! - `state` guards phase, stored operations and flags. Futures are
//!   always resolved after both locks are dropped, because a handler
//!   may close the channel or start the next operation.

use crate::handle::{native_address, query_local};
use crate::native::LibcOps;

use chanio_core::{
    ChannelError, ChannelPhase, Events, Family, NativeOps, OpKind, Outcome, RawHandle, Result,
    ShutdownHow, SocketKind,
};
use chanio_runtime::{
    invoker, AsyncChannel, ChannelGroup, Completion, MemberKey, PendingFuture, PollableChannel,
};

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Outcome of a read or write: bytes transferred and the buffer back
pub type Transfer = (usize, Vec<u8>);

struct IoOp {
    id: u64,
    buf: Vec<u8>,
    done: Arc<dyn Completion<Transfer>>,
}

struct ConnectOp {
    target: SocketAddr,
    done: Arc<dyn Completion<()>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Read,
    Write,
}

struct AsyncState {
    phase: ChannelPhase,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    input_shutdown: bool,
    output_shutdown: bool,
    reading: bool,
    writing: bool,
    read_killed: bool,
    write_killed: bool,
    connect_killed: bool,
    /// Id of a stored op whose timer fired while it was out for a retry
    read_expired: Option<u64>,
    write_expired: Option<u64>,
    read_op: Option<IoOp>,
    write_op: Option<IoOp>,
    connect_op: Option<ConnectOp>,
    next_op: u64,
}

impl AsyncState {
    fn interest(&self) -> Events {
        let mut events = Events::NONE;
        if self.read_op.is_some() {
            events |= Events::READABLE;
        }
        if self.write_op.is_some() || self.connect_op.is_some() {
            events |= Events::WRITABLE;
        }
        events
    }
}

pub(crate) struct Inner {
    group: ChannelGroup,
    ops: Arc<dyn NativeOps>,
    fd: RawHandle,
    family: Family,
    key: Mutex<Option<MemberKey>>,
    close_lock: RwLock<()>,
    state: Mutex<AsyncState>,
    me: Weak<Inner>,
}

/// Resolve `done`, logging a handler that could not be dispatched.
/// Used where no caller is waiting for the error.
fn deliver<V>(done: &Arc<dyn Completion<V>>, outcome: Result<V>) {
    if let Err(e) = done.complete(outcome) {
        debug!("completion not dispatched: {}", e);
    }
}

impl Inner {
    fn weak_channel(&self) -> Weak<dyn AsyncChannel> {
        let me: Weak<Inner> = self.me.clone();
        me
    }

    fn is_open(&self) -> bool {
        self.state.lock().phase.is_open()
    }

    /// Arm the port for every stored operation. Caller holds `state`.
    fn arm(&self, st: &AsyncState) -> Result<()> {
        let events = st.interest();
        if events.is_empty() {
            return Ok(());
        }
        self.group.start_poll(self.fd, events)
    }

    /// One native call under the shared close lock.
    fn attempt<T>(&self, call: impl FnOnce() -> Result<Outcome<T>>) -> Result<Outcome<T>> {
        let _guard = self.close_lock.read();
        if !self.is_open() {
            return Err(ChannelError::AsynchronousClose);
        }
        call()
    }

    // ── read / write ──

    fn start_io(
        &self,
        side: Side,
        done: Arc<dyn Completion<Transfer>>,
        buf: Vec<u8>,
        timeout: Option<Duration>,
        attempt_now: bool,
    ) -> Result<()> {
        let early = {
            let mut st = self.state.lock();
            let (busy, killed) = match side {
                Side::Read => (st.reading, st.read_killed),
                Side::Write => (st.writing, st.write_killed),
            };
            if busy {
                return Err(match side {
                    Side::Read => ChannelError::ReadPending,
                    Side::Write => ChannelError::WritePending,
                });
            }
            if !st.phase.is_open() {
                Some(Err(ChannelError::Closed))
            } else if killed {
                Some(Err(ChannelError::IllegalState(
                    "direction disabled by an earlier timeout or cancellation",
                )))
            } else if st.phase != ChannelPhase::Connected {
                Some(Err(ChannelError::NotYetConnected))
            } else if side == Side::Read && (st.input_shutdown || buf.is_empty()) {
                Some(Ok(0))
            } else if side == Side::Write && st.output_shutdown {
                Some(Err(ChannelError::Closed))
            } else if side == Side::Write && buf.is_empty() {
                Some(Ok(0))
            } else {
                match side {
                    Side::Read => st.reading = true,
                    Side::Write => st.writing = true,
                }
                None
            }
        };
        if let Some(outcome) = early {
            done.complete(outcome.map(|n| (n, buf)))?;
            return Ok(());
        }

        let mut op = IoOp { id: 0, buf, done };
        let first = if attempt_now {
            self.transfer(side, &mut op.buf)
        } else {
            Ok(Outcome::WouldBlock)
        };
        match first {
            Ok(Outcome::Ready(n)) => {
                self.finish_side(side);
                let IoOp { buf, done, .. } = op;
                done.complete(Ok((n, buf)))?;
            }
            Err(e) => {
                self.finish_side(side);
                op.done.complete(Err(e))?;
            }
            Ok(Outcome::WouldBlock) | Ok(Outcome::Interrupted) => {
                self.park_io(side, op, timeout)?;
            }
        }
        Ok(())
    }

    fn transfer(&self, side: Side, buf: &mut [u8]) -> Result<Outcome<usize>> {
        self.attempt(|| match side {
            Side::Read => self.ops.read(self.fd, buf),
            Side::Write => self.ops.write(self.fd, buf),
        })
    }

    fn finish_side(&self, side: Side) {
        let mut st = self.state.lock();
        match side {
            Side::Read => st.reading = false,
            Side::Write => st.writing = false,
        }
    }

    /// Store `op` and wait for readiness, scheduling its timeout.
    fn park_io(&self, side: Side, mut op: IoOp, timeout: Option<Duration>) -> Result<()> {
        let done = op.done.clone();
        let armed = {
            let mut st = self.state.lock();
            if !st.phase.is_open() {
                self.take_side(&mut st, side);
                drop(st);
                done.complete(Err(ChannelError::AsynchronousClose))?;
                return Ok(());
            }
            st.next_op += 1;
            op.id = st.next_op;
            let id = op.id;
            match side {
                Side::Read => {
                    st.read_expired = None;
                    st.read_op = Some(op);
                }
                Side::Write => {
                    st.write_expired = None;
                    st.write_op = Some(op);
                }
            }
            self.arm(&st).map(|()| id)
        };
        match armed {
            Ok(id) => {
                if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
                    let weak = self.me.clone();
                    let handle = self.group.schedule(
                        move || {
                            if let Some(inner) = weak.upgrade() {
                                inner.on_timeout(side, id);
                            }
                        },
                        timeout,
                    );
                    if let Some(handle) = handle {
                        done.set_timeout(handle);
                    }
                }
                Ok(())
            }
            Err(e) => {
                let op = {
                    let mut st = self.state.lock();
                    self.take_side(&mut st, side)
                };
                if let Some(op) = op {
                    op.done.complete(Err(e))?;
                }
                Ok(())
            }
        }
    }

    fn take_side(&self, st: &mut AsyncState, side: Side) -> Option<IoOp> {
        match side {
            Side::Read => {
                st.reading = false;
                st.read_op.take()
            }
            Side::Write => {
                st.writing = false;
                st.write_op.take()
            }
        }
    }

    fn on_timeout(&self, side: Side, id: u64) {
        let op = {
            let mut st = self.state.lock();
            let (current, busy) = match side {
                Side::Read => (st.read_op.as_ref().map(|op| op.id), st.reading),
                Side::Write => (st.write_op.as_ref().map(|op| op.id), st.writing),
            };
            match current {
                Some(current) if current == id => {}
                Some(_) => return,
                None => {
                    // Out for a retry in `on_event`, which settles it.
                    if busy {
                        match side {
                            Side::Read => st.read_expired = Some(id),
                            Side::Write => st.write_expired = Some(id),
                        }
                    }
                    return;
                }
            }
            match side {
                Side::Read => st.read_killed = true,
                Side::Write => st.write_killed = true,
            }
            self.take_side(&mut st, side)
        };
        if let Some(op) = op {
            trace!("fd {}: operation {} timed out", self.fd, id);
            deliver(&op.done, Err(ChannelError::TimedOut));
        }
    }

    /// Retry a stored operation after readiness. Returns the op if it
    /// still would block.
    fn retry_io(&self, side: Side, mut op: IoOp) -> Option<IoOp> {
        match self.transfer(side, &mut op.buf) {
            Ok(Outcome::Ready(n)) => {
                self.finish_side(side);
                let IoOp { buf, done, .. } = op;
                deliver(&done, Ok((n, buf)));
                None
            }
            Err(e) => {
                self.finish_side(side);
                deliver(&op.done, Err(e));
                None
            }
            Ok(Outcome::WouldBlock) | Ok(Outcome::Interrupted) => Some(op),
        }
    }

    /// Whether `op`, back from a retry that would still block, timed out
    /// meanwhile. If so the direction is disabled. Caller holds `state`.
    fn expired_during_retry(&self, st: &mut AsyncState, side: Side, op: &IoOp) -> bool {
        let expired = match side {
            Side::Read => st.read_expired.take(),
            Side::Write => st.write_expired.take(),
        };
        if expired != Some(op.id) {
            return false;
        }
        match side {
            Side::Read => {
                st.read_killed = true;
                st.reading = false;
            }
            Side::Write => {
                st.write_killed = true;
                st.writing = false;
            }
        }
        true
    }

    // ── connect ──

    fn start_connect(&self, done: Arc<dyn Completion<()>>, target: SocketAddr) -> Result<()> {
        let native = native_address(self.family, &target)?;
        let early = {
            let mut st = self.state.lock();
            match st.phase {
                ChannelPhase::Connected => return Err(ChannelError::AlreadyConnected),
                ChannelPhase::ConnectionPending => return Err(ChannelError::ConnectionPending),
                _ if !st.phase.is_open() => Some(ChannelError::Closed),
                _ if st.connect_killed => Some(ChannelError::IllegalState(
                    "connect disabled by an earlier cancellation",
                )),
                _ => {
                    st.phase = ChannelPhase::ConnectionPending;
                    None
                }
            }
        };
        if let Some(e) = early {
            done.complete(Err(e))?;
            return Ok(());
        }

        match self.attempt(|| self.ops.connect(self.fd, &native)) {
            Ok(Outcome::Ready(())) => {
                self.set_connected(target);
                done.complete(Ok(()))?;
            }
            Err(e) => {
                self.close_quietly();
                done.complete(Err(e))?;
            }
            Ok(Outcome::WouldBlock) | Ok(Outcome::Interrupted) => {
                let armed = {
                    let mut st = self.state.lock();
                    if !st.phase.is_open() {
                        Err(ChannelError::AsynchronousClose)
                    } else {
                        st.connect_op = Some(ConnectOp {
                            target,
                            done: done.clone(),
                        });
                        self.arm(&st)
                    }
                };
                if let Err(e) = armed {
                    self.state.lock().connect_op = None;
                    self.close_quietly();
                    done.complete(Err(e))?;
                }
            }
        }
        Ok(())
    }

    fn set_connected(&self, target: SocketAddr) {
        let local = query_local(self.ops.as_ref(), self.fd).ok();
        let mut st = self.state.lock();
        if st.phase == ChannelPhase::ConnectionPending {
            st.phase = ChannelPhase::Connected;
        }
        st.local = local;
        st.remote = Some(target);
    }

    fn retry_connect(&self, op: ConnectOp) -> Option<ConnectOp> {
        match self.attempt(|| self.ops.finish_connect(self.fd)) {
            Ok(Outcome::Ready(())) => {
                self.set_connected(op.target);
                deliver(&op.done, Ok(()));
                None
            }
            Err(e) => {
                self.close_quietly();
                deliver(&op.done, Err(e));
                None
            }
            Ok(Outcome::WouldBlock) | Ok(Outcome::Interrupted) => Some(op),
        }
    }

    // ── close ──

    fn close(&self) -> Result<()> {
        let (read_op, write_op, connect_op, closed) = {
            let _guard = self.close_lock.write();
            let ops = {
                let mut st = self.state.lock();
                if !st.phase.is_open() {
                    return Ok(());
                }
                st.phase = ChannelPhase::Closed;
                st.reading = false;
                st.writing = false;
                (st.read_op.take(), st.write_op.take(), st.connect_op.take())
            };
            self.group.unregister_pollable(self.fd);
            let closed = self.ops.close(self.fd);
            debug!("fd {}: async socket closed", self.fd);
            (ops.0, ops.1, ops.2, closed)
        };
        for op in [read_op, write_op].into_iter().flatten() {
            deliver(&op.done, Err(ChannelError::AsynchronousClose));
        }
        if let Some(op) = connect_op {
            deliver(&op.done, Err(ChannelError::AsynchronousClose));
        }
        if let Some(key) = self.key.lock().take() {
            self.group.deregister(key);
        }
        closed
    }

    fn close_quietly(&self) {
        if let Err(e) = self.close() {
            warn!("fd {}: close failed: {}", self.fd, e);
        }
    }
}

impl PollableChannel for Inner {
    fn on_event(&self, events: Events) {
        let (read_op, write_op, connect_op) = {
            let mut st = self.state.lock();
            let read_op = if events.is_readable() { st.read_op.take() } else { None };
            let (write_op, connect_op) = if events.is_writable() {
                (st.write_op.take(), st.connect_op.take())
            } else {
                (None, None)
            };
            (read_op, write_op, connect_op)
        };
        trace!("fd {}: ready {:?}", self.fd, events);

        let read_op = read_op.and_then(|op| self.retry_io(Side::Read, op));
        let connect_op = connect_op.and_then(|op| self.retry_connect(op));
        let write_op = write_op.and_then(|op| self.retry_io(Side::Write, op));

        // Put back whatever is still blocked and re-arm for it. A close
        // that ran meanwhile could not see these, so they fail below.
        let mut st = self.state.lock();
        let mut expired = Vec::new();
        for (side, op) in [(Side::Read, read_op), (Side::Write, write_op)] {
            let Some(op) = op else {
                continue;
            };
            if self.expired_during_retry(&mut st, side, &op) {
                expired.push(op);
                continue;
            }
            let slot = match side {
                Side::Read => &mut st.read_op,
                Side::Write => &mut st.write_op,
            };
            *slot = slot.take().or(Some(op));
        }
        st.connect_op = st.connect_op.take().or(connect_op);
        let failure = if !st.phase.is_open() {
            Some(ChannelError::AsynchronousClose)
        } else {
            match self.arm(&st) {
                Ok(()) => None,
                Err(e) => {
                    debug!("fd {}: re-arm failed: {}", self.fd, e);
                    Some(e)
                }
            }
        };
        let failed = failure.map(|e| {
            st.reading = false;
            st.writing = false;
            (e, st.read_op.take(), st.write_op.take(), st.connect_op.take())
        });
        drop(st);
        for op in expired {
            trace!("fd {}: operation {} timed out during retry", self.fd, op.id);
            deliver(&op.done, Err(ChannelError::TimedOut));
        }
        let Some((e, r, w, c)) = failed else {
            return;
        };
        for op in [r, w].into_iter().flatten() {
            deliver(&op.done, Err(e.clone()));
        }
        if let Some(op) = c {
            deliver(&op.done, Err(e));
        }
    }
}

impl AsyncChannel for Inner {
    fn on_cancel(&self, kind: OpKind) {
        let mut st = self.state.lock();
        match kind {
            OpKind::Read => {
                st.read_killed = true;
                self.take_side(&mut st, Side::Read);
            }
            OpKind::Write => {
                st.write_killed = true;
                self.take_side(&mut st, Side::Write);
            }
            OpKind::Connect => {
                st.connect_killed = true;
                st.connect_op = None;
                if st.phase == ChannelPhase::ConnectionPending {
                    st.phase = ChannelPhase::Unconnected;
                }
            }
            _ => {}
        }
    }

    fn close(&self) -> Result<()> {
        Inner::close(self)
    }
}

/// Stream socket whose operations complete on a [`ChannelGroup`]
///
/// Each operation comes in two forms: one returning a
/// [`PendingFuture`], and a `_with` form taking an attachment and a
/// completion handler. Starting a second read (or write) while one is
/// outstanding fails at once with `ReadPending` (`WritePending`);
/// every other failure is delivered through the future or handler.
///
/// Dropping the channel closes it.
pub struct AsyncSocketChannel {
    inner: Arc<Inner>,
}

impl AsyncSocketChannel {
    pub fn open(group: &ChannelGroup, family: Family) -> Result<Self> {
        Self::open_with(LibcOps::shared(), group, family)
    }

    pub fn open_with(ops: Arc<dyn NativeOps>, group: &ChannelGroup, family: Family) -> Result<Self> {
        let fd = ops.socket(family, SocketKind::Stream)?;
        Self::from_parts(ops, group, fd, family, ChannelPhase::Unconnected, None, None)
    }

    /// Adopt a connection accepted by an asynchronous listener.
    pub(crate) fn from_accepted(
        ops: Arc<dyn NativeOps>,
        group: &ChannelGroup,
        fd: RawHandle,
        family: Family,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<Self> {
        Self::from_parts(ops, group, fd, family, ChannelPhase::Connected, local, Some(remote))
    }

    fn from_parts(
        ops: Arc<dyn NativeOps>,
        group: &ChannelGroup,
        fd: RawHandle,
        family: Family,
        phase: ChannelPhase,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<Self> {
        let inner = Arc::new_cyclic(|me| Inner {
            group: group.clone(),
            ops,
            fd,
            family,
            key: Mutex::new(None),
            close_lock: RwLock::new(()),
            state: Mutex::new(AsyncState {
                phase,
                local,
                remote,
                input_shutdown: false,
                output_shutdown: false,
                reading: false,
                writing: false,
                read_killed: false,
                write_killed: false,
                connect_killed: false,
                read_expired: None,
                write_expired: None,
                read_op: None,
                write_op: None,
                connect_op: None,
                next_op: 0,
            }),
            me: me.clone(),
        });
        match group.register(inner.weak_channel()) {
            Ok(key) => *inner.key.lock() = Some(key),
            Err(e) => {
                inner.close_quietly();
                return Err(e);
            }
        }
        let pollable: Weak<Inner> = Arc::downgrade(&inner);
        group.register_pollable(fd, pollable);
        Ok(Self { inner })
    }

    /// First attempt on the calling thread, or leave it to the port?
    /// A handler started from a group thread that has used up its
    /// nesting budget goes straight to the port.
    fn attempt_now(&self, has_handler: bool) -> bool {
        let group = &self.inner.group;
        !has_handler || invoker::may_invoke_direct(group) || !group.is_fixed_thread_pool()
    }

    pub fn group(&self) -> &ChannelGroup {
        &self.inner.group
    }

    pub fn bind(&self, addr: &SocketAddr) -> Result<()> {
        let native = native_address(self.inner.family, addr)?;
        let _guard = self.inner.close_lock.read();
        {
            let st = self.inner.state.lock();
            if !st.phase.is_open() {
                return Err(ChannelError::Closed);
            }
            if st.phase != ChannelPhase::Unconnected {
                return Err(ChannelError::AlreadyConnected);
            }
            if st.local.is_some() {
                return Err(ChannelError::AlreadyBound);
            }
        }
        self.inner.ops.bind(self.inner.fd, &native)?;
        let local = query_local(self.inner.ops.as_ref(), self.inner.fd)?;
        self.inner.state.lock().local = Some(local);
        Ok(())
    }

    pub fn connect(&self, addr: &SocketAddr) -> Result<PendingFuture<()>> {
        let future = PendingFuture::new(&self.inner.group, Some(self.inner.weak_channel()), OpKind::Connect);
        self.inner.start_connect(future.completion(), *addr)?;
        Ok(future)
    }

    pub fn connect_with<A, F>(&self, addr: &SocketAddr, attachment: A, handler: F) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<()>, A) + Send + 'static,
    {
        let future = PendingFuture::with_handler(
            &self.inner.group,
            Some(self.inner.weak_channel()),
            OpKind::Connect,
            attachment,
            handler,
        );
        self.inner.start_connect(future.completion(), *addr)
    }

    /// Read into `buf` (its whole length). Resolves to the byte count,
    /// 0 at end of stream, and the buffer.
    ///
    /// With a `timeout`, an operation still pending when it expires
    /// fails with `TimedOut` and the read direction is disabled.
    pub fn read(&self, buf: Vec<u8>, timeout: Option<Duration>) -> Result<PendingFuture<Transfer>> {
        let future = PendingFuture::new(&self.inner.group, Some(self.inner.weak_channel()), OpKind::Read);
        self.inner
            .start_io(Side::Read, future.completion(), buf, timeout, true)?;
        Ok(future)
    }

    pub fn read_with<A, F>(
        &self,
        buf: Vec<u8>,
        timeout: Option<Duration>,
        attachment: A,
        handler: F,
    ) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<Transfer>, A) + Send + 'static,
    {
        let future = PendingFuture::with_handler(
            &self.inner.group,
            Some(self.inner.weak_channel()),
            OpKind::Read,
            attachment,
            handler,
        );
        let now = self.attempt_now(true);
        self.inner
            .start_io(Side::Read, future.completion(), buf, timeout, now)
    }

    /// Write from `buf` (its whole length). Resolves to the byte count
    /// written, possibly short, and the buffer.
    pub fn write(&self, buf: Vec<u8>, timeout: Option<Duration>) -> Result<PendingFuture<Transfer>> {
        let future = PendingFuture::new(&self.inner.group, Some(self.inner.weak_channel()), OpKind::Write);
        self.inner
            .start_io(Side::Write, future.completion(), buf, timeout, true)?;
        Ok(future)
    }

    pub fn write_with<A, F>(
        &self,
        buf: Vec<u8>,
        timeout: Option<Duration>,
        attachment: A,
        handler: F,
    ) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<Transfer>, A) + Send + 'static,
    {
        let future = PendingFuture::with_handler(
            &self.inner.group,
            Some(self.inner.weak_channel()),
            OpKind::Write,
            attachment,
            handler,
        );
        let now = self.attempt_now(true);
        self.inner
            .start_io(Side::Write, future.completion(), buf, timeout, now)
    }

    fn shutdown(&self, how: ShutdownHow) -> Result<()> {
        let _guard = self.inner.close_lock.read();
        let mut st = self.inner.state.lock();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        if st.phase != ChannelPhase::Connected {
            return Err(ChannelError::NotYetConnected);
        }
        let done = match how {
            ShutdownHow::Read => st.input_shutdown,
            ShutdownHow::Write => st.output_shutdown,
            ShutdownHow::Both => st.input_shutdown && st.output_shutdown,
        };
        if !done {
            self.inner.ops.shutdown(self.inner.fd, how)?;
            match how {
                ShutdownHow::Read => st.input_shutdown = true,
                ShutdownHow::Write => st.output_shutdown = true,
                ShutdownHow::Both => {
                    st.input_shutdown = true;
                    st.output_shutdown = true;
                }
            }
        }
        Ok(())
    }

    /// Stop reading; an outstanding read completes with end of stream.
    pub fn shutdown_input(&self) -> Result<()> {
        self.shutdown(ShutdownHow::Read)
    }

    pub fn shutdown_output(&self) -> Result<()> {
        self.shutdown(ShutdownHow::Write)
    }

    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        let st = self.inner.state.lock();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(st.local)
    }

    pub fn peer_addr(&self) -> Result<Option<SocketAddr>> {
        let st = self.inner.state.lock();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(st.remote)
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Close the channel; outstanding operations fail with
    /// `AsynchronousClose`.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn as_raw_handle(&self) -> RawHandle {
        self.inner.fd
    }
}

impl Drop for AsyncSocketChannel {
    fn drop(&mut self) {
        self.inner.close_quietly();
    }
}

impl fmt::Debug for AsyncSocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("AsyncSocketChannel")
            .field("fd", &self.inner.fd)
            .field("phase", &st.phase)
            .field("local", &st.local)
            .field("remote", &st.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanio_runtime::GroupConfig;

    fn group() -> ChannelGroup {
        ChannelGroup::new(GroupConfig::fixed(2).name("sock-test")).unwrap()
    }

    #[test]
    fn test_read_before_connect_fails_through_future() {
        let g = group();
        let ch = AsyncSocketChannel::open(&g, Family::Inet).unwrap();
        let f = ch.read(vec![0; 8], None).unwrap();
        assert_eq!(f.wait(), Err(ChannelError::NotYetConnected));
        assert_eq!(g.member_count(), 1);
        ch.close().unwrap();
        assert_eq!(g.member_count(), 0);
        g.shutdown_now().unwrap();
    }

    #[test]
    fn test_closed_channel_fails_operations() {
        let g = group();
        let ch = AsyncSocketChannel::open(&g, Family::Inet).unwrap();
        ch.close().unwrap();
        let f = ch.write(vec![1, 2, 3], None).unwrap();
        assert_eq!(f.wait(), Err(ChannelError::Closed));
        assert_eq!(ch.local_addr(), Err(ChannelError::Closed));
        g.shutdown_now().unwrap();
    }

    #[test]
    fn test_open_after_shutdown_is_refused() {
        let g = group();
        g.shutdown();
        assert_eq!(
            AsyncSocketChannel::open(&g, Family::Inet).err(),
            Some(ChannelError::GroupShutdown)
        );
    }
}
