//! Asynchronous listening socket channel

use crate::async_socket::AsyncSocketChannel;
use crate::handle::{native_address, query_local};
use crate::native::LibcOps;

use chanio_core::{
    ChannelError, ChannelPhase, Events, Family, NativeOps, NativeSocketAddress, OpKind, Outcome,
    RawHandle, Result, SocketKind,
};
use chanio_runtime::{
    invoker, AsyncChannel, ChannelGroup, Completion, MemberKey, PendingFuture, PollableChannel,
};

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

/// An accepted connection and its peer
pub type Accepted = (AsyncSocketChannel, SocketAddr);

struct ServerState {
    phase: ChannelPhase,
    local: Option<SocketAddr>,
    accepting: bool,
    accept_killed: bool,
    pending: Option<Arc<dyn Completion<Accepted>>>,
}

struct Inner {
    group: ChannelGroup,
    ops: Arc<dyn NativeOps>,
    fd: RawHandle,
    family: Family,
    key: Mutex<Option<MemberKey>>,
    close_lock: RwLock<()>,
    state: Mutex<ServerState>,
    /// Peer address of the accept in progress; used by one acceptor at a time
    peer: Mutex<NativeSocketAddress>,
    me: Weak<Inner>,
}

fn deliver(done: &Arc<dyn Completion<Accepted>>, outcome: Result<Accepted>) {
    if let Err(e) = done.complete(outcome) {
        debug!("accept completion not dispatched: {}", e);
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

    /// One accept attempt; wraps the connection on success.
    fn try_accept(&self) -> Result<Option<Accepted>> {
        let (fd, remote) = {
            let _guard = self.close_lock.read();
            if !self.is_open() {
                return Err(ChannelError::AsynchronousClose);
            }
            let mut peer = self.peer.lock();
            peer.clear();
            match self.ops.accept(self.fd, &mut peer)? {
                Outcome::Ready(fd) => match peer.decode() {
                    Ok(remote) => (fd, remote),
                    Err(e) => {
                        let _ = self.ops.close(fd);
                        return Err(e);
                    }
                },
                Outcome::WouldBlock | Outcome::Interrupted => return Ok(None),
            }
        };
        let local = query_local(self.ops.as_ref(), fd).ok();
        trace!("fd {}: accepted fd {} from {}", self.fd, fd, remote);
        let channel = AsyncSocketChannel::from_accepted(
            self.ops.clone(),
            &self.group,
            fd,
            self.family,
            local,
            remote,
        )?;
        Ok(Some((channel, remote)))
    }

    fn start_accept(&self, done: Arc<dyn Completion<Accepted>>, attempt_now: bool) -> Result<()> {
        let early = {
            let mut st = self.state.lock();
            if st.accepting {
                return Err(ChannelError::AcceptPending);
            }
            if !st.phase.is_open() {
                Some(ChannelError::Closed)
            } else if st.phase != ChannelPhase::Bound {
                Some(ChannelError::NotYetBound)
            } else if st.accept_killed {
                Some(ChannelError::IllegalState(
                    "accept disabled by an earlier cancellation",
                ))
            } else {
                st.accepting = true;
                None
            }
        };
        if let Some(e) = early {
            done.complete(Err(e))?;
            return Ok(());
        }

        let first = if attempt_now { self.try_accept() } else { Ok(None) };
        match first {
            Ok(Some(accepted)) => {
                self.state.lock().accepting = false;
                done.complete(Ok(accepted))?;
            }
            Err(e) => {
                self.state.lock().accepting = false;
                done.complete(Err(e))?;
            }
            Ok(None) => {
                let armed = {
                    let mut st = self.state.lock();
                    if !st.phase.is_open() {
                        Err(ChannelError::AsynchronousClose)
                    } else {
                        st.pending = Some(done.clone());
                        self.group.start_poll(self.fd, Events::READABLE)
                    }
                };
                if let Err(e) = armed {
                    {
                        let mut st = self.state.lock();
                        st.pending = None;
                        st.accepting = false;
                    }
                    done.complete(Err(e))?;
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let (pending, closed) = {
            let _guard = self.close_lock.write();
            let pending = {
                let mut st = self.state.lock();
                if !st.phase.is_open() {
                    return Ok(());
                }
                st.phase = ChannelPhase::Closed;
                st.accepting = false;
                st.pending.take()
            };
            self.group.unregister_pollable(self.fd);
            (pending, self.ops.close(self.fd))
        };
        debug!("fd {}: async listener closed", self.fd);
        if let Some(done) = pending {
            deliver(&done, Err(ChannelError::AsynchronousClose));
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
        let Some(done) = self.state.lock().pending.take() else {
            return;
        };
        trace!("fd {}: listener ready {:?}", self.fd, events);
        let outcome = match self.try_accept() {
            Ok(None) => {
                let armed = {
                    let mut st = self.state.lock();
                    if !st.phase.is_open() {
                        Err(ChannelError::AsynchronousClose)
                    } else {
                        st.pending = Some(done.clone());
                        self.group.start_poll(self.fd, Events::READABLE)
                    }
                };
                match armed {
                    Ok(()) => return,
                    Err(e) => {
                        self.state.lock().pending = None;
                        Err(e)
                    }
                }
            }
            Ok(Some(accepted)) => Ok(accepted),
            Err(e) => Err(e),
        };
        self.state.lock().accepting = false;
        deliver(&done, outcome);
    }
}

impl AsyncChannel for Inner {
    fn on_cancel(&self, kind: OpKind) {
        if kind == OpKind::Accept {
            let mut st = self.state.lock();
            st.accept_killed = true;
            st.accepting = false;
            st.pending = None;
        }
    }

    fn close(&self) -> Result<()> {
        Inner::close(self)
    }
}

/// Listening socket whose accepts complete on a [`ChannelGroup`]
///
/// One accept may be outstanding at a time; a second one fails at once
/// with `AcceptPending`. Accepted connections join the same group.
/// Dropping the channel closes it.
pub struct AsyncServerSocketChannel {
    inner: Arc<Inner>,
}

impl AsyncServerSocketChannel {
    pub fn open(group: &ChannelGroup, family: Family) -> Result<Self> {
        Self::open_with(LibcOps::shared(), group, family)
    }

    pub fn open_with(ops: Arc<dyn NativeOps>, group: &ChannelGroup, family: Family) -> Result<Self> {
        let fd = ops.socket(family, SocketKind::Stream)?;
        if let Err(e) = ops.set_reuse_address(fd, true) {
            let _ = ops.close(fd);
            return Err(e);
        }
        let inner = Arc::new_cyclic(|me| Inner {
            group: group.clone(),
            ops,
            fd,
            family,
            key: Mutex::new(None),
            close_lock: RwLock::new(()),
            state: Mutex::new(ServerState {
                phase: ChannelPhase::Unconnected,
                local: None,
                accepting: false,
                accept_killed: false,
                pending: None,
            }),
            peer: Mutex::new(NativeSocketAddress::new()),
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

    /// Bind and listen. A `backlog` below 1 uses the default of 50.
    pub fn bind(&self, addr: &SocketAddr, backlog: i32) -> Result<()> {
        let native = native_address(self.inner.family, addr)?;
        let backlog = if backlog < 1 { 50 } else { backlog };
        let _guard = self.inner.close_lock.read();
        {
            let st = self.inner.state.lock();
            if !st.phase.is_open() {
                return Err(ChannelError::Closed);
            }
            if st.phase == ChannelPhase::Bound {
                return Err(ChannelError::AlreadyBound);
            }
        }
        self.inner.ops.bind(self.inner.fd, &native)?;
        self.inner.ops.listen(self.inner.fd, backlog)?;
        let local = query_local(self.inner.ops.as_ref(), self.inner.fd)?;
        let mut st = self.inner.state.lock();
        st.phase = ChannelPhase::Bound;
        st.local = Some(local);
        Ok(())
    }

    pub fn accept(&self) -> Result<PendingFuture<Accepted>> {
        let future = PendingFuture::new(
            &self.inner.group,
            Some(self.inner.weak_channel()),
            OpKind::Accept,
        );
        self.inner.start_accept(future.completion(), true)?;
        Ok(future)
    }

    pub fn accept_with<A, F>(&self, attachment: A, handler: F) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<Accepted>, A) + Send + 'static,
    {
        let future = PendingFuture::with_handler(
            &self.inner.group,
            Some(self.inner.weak_channel()),
            OpKind::Accept,
            attachment,
            handler,
        );
        let group = &self.inner.group;
        let now = invoker::may_invoke_direct(group) || !group.is_fixed_thread_pool();
        self.inner.start_accept(future.completion(), now)
    }

    pub fn group(&self) -> &ChannelGroup {
        &self.inner.group
    }

    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        let st = self.inner.state.lock();
        if !st.phase.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(st.local)
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Close the listener; an outstanding accept fails with
    /// `AsynchronousClose`. Accepted channels stay open.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn as_raw_handle(&self) -> RawHandle {
        self.inner.fd
    }
}

impl Drop for AsyncServerSocketChannel {
    fn drop(&mut self) {
        self.inner.close_quietly();
    }
}

impl fmt::Debug for AsyncServerSocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("AsyncServerSocketChannel")
            .field("fd", &self.inner.fd)
            .field("phase", &st.phase)
            .field("local", &st.local)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanio_runtime::GroupConfig;

    #[test]
    fn test_accept_requires_bind() {
        let g = ChannelGroup::new(GroupConfig::fixed(1).name("srv-test")).unwrap();
        let server = AsyncServerSocketChannel::open(&g, Family::Inet).unwrap();
        let f = server.accept().unwrap();
        assert_eq!(f.wait().err(), Some(ChannelError::NotYetBound));
        g.shutdown_now().unwrap();
    }

    #[test]
    fn test_second_accept_is_refused() {
        let g = ChannelGroup::new(GroupConfig::fixed(1).name("srv-test")).unwrap();
        let server = AsyncServerSocketChannel::open(&g, Family::Inet).unwrap();
        server.bind(&"127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let first = server.accept().unwrap();
        assert!(matches!(server.accept(), Err(ChannelError::AcceptPending)));
        server.close().unwrap();
        assert_eq!(first.wait().err(), Some(ChannelError::AsynchronousClose));
        g.shutdown_now().unwrap();
    }
}
