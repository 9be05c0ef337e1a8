//! Blocking listening socket channel

use crate::handle::{native_address, query_local, Direction, NativeChannel, Park};
use crate::native::LibcOps;
use crate::socket::SocketChannel;

use chanio_core::{
    ChannelError, ChannelPhase, Events, Family, NativeOps, NativeSocketAddress, RawHandle,
    Result, SocketKind,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Backlog used when `bind` is given 0
const DEFAULT_BACKLOG: i32 = 50;

/// Listening stream socket
///
/// The read direction covers `accept`; it also guards the buffer the
/// peer address of each accepted connection is decoded from.
pub struct ServerSocketChannel {
    ch: NativeChannel<NativeSocketAddress, ()>,
}

impl ServerSocketChannel {
    pub fn open(family: Family) -> Result<Self> {
        Self::open_with(LibcOps::shared(), family)
    }

    pub fn open_with(ops: Arc<dyn NativeOps>, family: Family) -> Result<Self> {
        let fd = ops.socket(family, SocketKind::Stream)?;
        if let Err(e) = ops.set_reuse_address(fd, true) {
            let _ = ops.close(fd);
            return Err(e);
        }
        Ok(Self {
            ch: NativeChannel::new(
                ops,
                fd,
                family,
                ChannelPhase::Unconnected,
                NativeSocketAddress::new(),
                (),
            ),
        })
    }

    /// Bind and start listening.
    pub fn bind(&self, addr: &SocketAddr, backlog: i32) -> Result<()> {
        let _r = self.ch.lock_read(ChannelError::AcceptPending)?;
        {
            let st = self.ch.state();
            if !st.phase.is_open() {
                return Err(ChannelError::Closed);
            }
            if st.local.is_some() {
                return Err(ChannelError::AlreadyBound);
            }
        }
        let native = native_address(self.ch.family, addr)?;
        self.ch.ops.bind(self.ch.fd, &native)?;
        let backlog = if backlog < 1 { DEFAULT_BACKLOG } else { backlog };
        self.ch.ops.listen(self.ch.fd, backlog)?;
        let local = query_local(self.ch.ops.as_ref(), self.ch.fd)?;

        let mut st = self.ch.state();
        st.local = Some(local);
        if st.phase.is_open() {
            st.phase = ChannelPhase::Bound;
        }
        Ok(())
    }

    fn accept_inner(&self, park: Park) -> Result<Option<(SocketChannel, SocketAddr)>> {
        let mut peer = self.ch.lock_read(ChannelError::AcceptPending)?;
        let mut local = None;
        self.ch.begin(Direction::Read, |st| {
            if st.phase != ChannelPhase::Bound {
                return Err(ChannelError::NotYetBound);
            }
            local = st.local;
            Ok(())
        })?;

        let ops = self.ch.ops.clone();
        let fd = self.ch.fd;
        let accepted = self.ch.run(
            Direction::Read,
            Events::READABLE,
            park,
            || ops.accept(fd, &mut peer),
            |_| true,
        );
        let Some(conn) = accepted? else {
            return Ok(None);
        };
        let remote = match peer.decode() {
            Ok(remote) => remote,
            Err(e) => {
                let _ = self.ch.ops.close(conn);
                return Err(e);
            }
        };
        let local = query_local(self.ch.ops.as_ref(), conn).ok().or(local);
        let channel = SocketChannel::from_accepted(self.ch.ops.clone(), conn, self.ch.family, local, remote);
        Ok(Some((channel, remote)))
    }

    /// Accept a connection, parking until one arrives.
    pub fn accept(&self) -> Result<(SocketChannel, SocketAddr)> {
        self.accept_inner(Park::Until(None))?
            .ok_or(ChannelError::AsynchronousClose)
    }

    /// Accept a connection, giving up with `TimedOut` after `timeout`.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<(SocketChannel, SocketAddr)> {
        self.accept_inner(Park::with_timeout(Some(timeout)))?
            .ok_or(ChannelError::AsynchronousClose)
    }

    /// Single accept attempt; `None` if no connection is waiting.
    pub fn try_accept(&self) -> Result<Option<(SocketChannel, SocketAddr)>> {
        self.accept_inner(Park::Never)
    }

    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        let st = self.ch.state();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(st.local)
    }

    pub fn is_open(&self) -> bool {
        self.ch.is_open()
    }

    pub fn close(&self) -> Result<()> {
        self.ch.close()
    }

    pub fn as_raw_handle(&self) -> RawHandle {
        self.ch.fd
    }
}

impl std::fmt::Debug for ServerSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.ch.state();
        f.debug_struct("ServerSocketChannel")
            .field("fd", &self.ch.fd)
            .field("phase", &st.phase)
            .field("local", &st.local)
            .finish()
    }
}
