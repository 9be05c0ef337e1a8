//! Blocking stream socket channel

use crate::handle::{native_address, query_local, query_peer, Direction, NativeChannel, Park};
use crate::native::LibcOps;

use chanio_core::{
    ChannelError, ChannelPhase, Events, Family, NativeOps, RawHandle, Result, ShutdownHow,
    SocketKind,
};

use parking_lot::Mutex;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Stream socket with independent read and write directions
///
/// A read blocked on one thread never holds up a write on another.
/// Two concurrent reads (or two writes) are refused with
/// `ReadPending` / `WritePending`.
pub struct SocketChannel {
    ch: NativeChannel<(), ()>,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
}

impl SocketChannel {
    /// Open an unconnected socket.
    pub fn open(family: Family) -> Result<Self> {
        Self::open_with(LibcOps::shared(), family)
    }

    /// Open over a specific native layer.
    pub fn open_with(ops: Arc<dyn NativeOps>, family: Family) -> Result<Self> {
        let fd = ops.socket(family, SocketKind::Stream)?;
        Ok(Self::from_parts(ops, fd, family, ChannelPhase::Unconnected))
    }

    /// Wrap a connected descriptor handed out by `accept`.
    pub(crate) fn from_accepted(
        ops: Arc<dyn NativeOps>,
        fd: RawHandle,
        family: Family,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Self {
        let chan = Self::from_parts(ops, fd, family, ChannelPhase::Connected);
        {
            let mut st = chan.ch.state();
            st.local = local;
            st.remote = Some(remote);
        }
        chan
    }

    fn from_parts(ops: Arc<dyn NativeOps>, fd: RawHandle, family: Family, phase: ChannelPhase) -> Self {
        Self {
            ch: NativeChannel::new(ops, fd, family, phase, (), ()),
            read_timeout: Mutex::new(None),
            write_timeout: Mutex::new(None),
        }
    }

    pub fn bind(&self, addr: &SocketAddr) -> Result<()> {
        let _r = self.ch.lock_read(ChannelError::ReadPending)?;
        let _w = self.ch.lock_write()?;
        {
            let st = self.ch.state();
            if !st.phase.is_open() {
                return Err(ChannelError::Closed);
            }
            if st.phase == ChannelPhase::Connected {
                return Err(ChannelError::AlreadyConnected);
            }
            if st.phase == ChannelPhase::ConnectionPending {
                return Err(ChannelError::ConnectionPending);
            }
            if st.local.is_some() {
                return Err(ChannelError::AlreadyBound);
            }
        }
        let native = native_address(self.ch.family, addr)?;
        self.ch.ops.bind(self.ch.fd, &native)?;
        let local = query_local(self.ch.ops.as_ref(), self.ch.fd)?;
        self.ch.state().local = Some(local);
        Ok(())
    }

    /// Connect, parking until established.
    pub fn connect(&self, addr: &SocketAddr) -> Result<()> {
        self.connect_inner(addr, Park::Until(None)).map(|_| ())
    }

    /// Start a connect without parking. Returns true if already
    /// established; otherwise complete it with `finish_connect`.
    pub fn begin_connect(&self, addr: &SocketAddr) -> Result<bool> {
        self.connect_inner(addr, Park::Never)
    }

    fn connect_inner(&self, addr: &SocketAddr, park: Park) -> Result<bool> {
        // Connect is serialized with reads.
        let _r = self.ch.lock_read(ChannelError::ReadPending)?;
        let native = native_address(self.ch.family, addr)?;
        self.ch.begin(Direction::Read, |st| match st.phase {
            ChannelPhase::Connected => Err(ChannelError::AlreadyConnected),
            ChannelPhase::ConnectionPending => Err(ChannelError::ConnectionPending),
            _ => {
                st.phase = ChannelPhase::ConnectionPending;
                Ok(())
            }
        })?;

        let ops = self.ch.ops.clone();
        let fd = self.ch.fd;
        let mut started = false;
        let result = self.ch.run(
            Direction::Read,
            Events::WRITABLE,
            park,
            || {
                if started {
                    ops.finish_connect(fd)
                } else {
                    started = true;
                    ops.connect(fd, &native)
                }
            },
            |_| true,
        );
        self.after_connect(result, Some(*addr))
    }

    /// Complete a connect started with `begin_connect`. Returns true
    /// once established, false while still in progress.
    pub fn finish_connect(&self) -> Result<bool> {
        let _r = self.ch.lock_read(ChannelError::ReadPending)?;
        if self.is_connected() {
            return Ok(true);
        }
        self.ch.begin(Direction::Read, |st| match st.phase {
            ChannelPhase::ConnectionPending => Ok(()),
            _ => Err(ChannelError::NoConnectionPending),
        })?;
        let ops = self.ch.ops.clone();
        let fd = self.ch.fd;
        let result = self
            .ch
            .run(Direction::Read, Events::WRITABLE, Park::Never, || ops.finish_connect(fd), |_| true);
        self.after_connect(result, None)
    }

    fn after_connect(&self, result: Result<Option<()>>, target: Option<SocketAddr>) -> Result<bool> {
        match result {
            Ok(Some(())) => {
                let local = query_local(self.ch.ops.as_ref(), self.ch.fd).ok();
                let remote = match target {
                    Some(addr) => Some(addr),
                    None => query_peer(self.ch.ops.as_ref(), self.ch.fd).ok(),
                };
                let mut st = self.ch.state();
                if st.phase == ChannelPhase::ConnectionPending {
                    st.phase = ChannelPhase::Connected;
                }
                st.local = local;
                st.remote = remote;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                // A failed connect leaves the socket unusable.
                if !e.is_closed() {
                    let _ = self.ch.close();
                }
                Err(e)
            }
        }
    }

    fn check_connected(phase: &ChannelPhase) -> Result<()> {
        match phase {
            ChannelPhase::Connected => Ok(()),
            ChannelPhase::ConnectionPending => Err(ChannelError::ConnectionPending),
            _ => Err(ChannelError::NotYetConnected),
        }
    }

    fn read_inner(&self, buf: &mut [u8], park: Park) -> Result<Option<usize>> {
        let _r = self.ch.lock_read(ChannelError::ReadPending)?;
        let mut eof = false;
        self.ch.begin(Direction::Read, |st| {
            Self::check_connected(&st.phase)?;
            eof = st.input_shutdown;
            Ok(())
        })?;
        if eof {
            self.ch.end(Direction::Read, true)?;
            return Ok(Some(0));
        }
        let ops = self.ch.ops.clone();
        let fd = self.ch.fd;
        let empty = buf.is_empty();
        self.ch.run(
            Direction::Read,
            Events::READABLE,
            park,
            || ops.read(fd, buf),
            |n| *n > 0 || empty,
        )
    }

    /// Read into `buf`, parking until data, end of stream (`Ok(0)`), or
    /// the read timeout.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let park = Park::with_timeout(*self.read_timeout.lock());
        Ok(self.read_inner(buf, park)?.unwrap_or(0))
    }

    /// Single read attempt; `None` if no data is available yet.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.read_inner(buf, Park::Never)
    }

    fn write_inner(&self, buf: &[u8], park: Park) -> Result<Option<usize>> {
        let _w = self.ch.lock_write()?;
        self.ch.begin(Direction::Write, |st| {
            Self::check_connected(&st.phase)?;
            if st.output_shutdown {
                return Err(ChannelError::Closed);
            }
            Ok(())
        })?;
        let ops = self.ch.ops.clone();
        let fd = self.ch.fd;
        let empty = buf.is_empty();
        self.ch.run(
            Direction::Write,
            Events::WRITABLE,
            park,
            || ops.write(fd, buf),
            |n| *n > 0 || empty,
        )
    }

    /// Write some of `buf`, parking until the socket accepts at least one byte.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let park = Park::with_timeout(*self.write_timeout.lock());
        Ok(self.write_inner(buf, park)?.unwrap_or(0))
    }

    /// Single write attempt; `None` if the send buffer is full.
    pub fn try_write(&self, buf: &[u8]) -> Result<Option<usize>> {
        self.write_inner(buf, Park::Never)
    }

    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Limit how long `read` parks; `None` parks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock() = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.lock()
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.write_timeout.lock() = timeout;
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        *self.write_timeout.lock()
    }

    /// Stop reading; a parked reader wakes and sees end of stream.
    pub fn shutdown_input(&self) -> Result<()> {
        let mut st = self.ch.state();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        Self::check_connected(&st.phase)?;
        if !st.input_shutdown {
            self.ch.ops.shutdown(self.ch.fd, ShutdownHow::Read)?;
            st.input_shutdown = true;
        }
        Ok(())
    }

    /// Send end of stream to the peer.
    pub fn shutdown_output(&self) -> Result<()> {
        let mut st = self.ch.state();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        Self::check_connected(&st.phase)?;
        if !st.output_shutdown {
            self.ch.ops.shutdown(self.ch.fd, ShutdownHow::Write)?;
            st.output_shutdown = true;
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        let st = self.ch.state();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(st.local)
    }

    pub fn peer_addr(&self) -> Result<Option<SocketAddr>> {
        let st = self.ch.state();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(st.remote)
    }

    pub fn is_open(&self) -> bool {
        self.ch.is_open()
    }

    pub fn is_connected(&self) -> bool {
        self.ch.state().phase == ChannelPhase::Connected
    }

    pub fn is_connection_pending(&self) -> bool {
        self.ch.state().phase == ChannelPhase::ConnectionPending
    }

    /// Close the channel. Operations in flight on other threads are
    /// interrupted and fail with `AsynchronousClose`; the descriptor is
    /// released once the last of them has left.
    pub fn close(&self) -> Result<()> {
        self.ch.close()
    }

    pub fn as_raw_handle(&self) -> RawHandle {
        self.ch.fd
    }
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.ch.state();
        f.debug_struct("SocketChannel")
            .field("fd", &self.ch.fd)
            .field("phase", &st.phase)
            .field("local", &st.local)
            .field("remote", &st.remote)
            .finish()
    }
}
