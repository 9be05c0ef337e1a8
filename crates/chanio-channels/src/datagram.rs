//! Blocking datagram channel
//!
//! Each direction owns its address buffer: receives decode the sender
//! from the read side's buffer, sends encode the target into the write
//! side's. Both sides remember the last address they converted, so a
//! conversation with one peer encodes and decodes it only once.

use crate::handle::{native_address, query_local, Direction, NativeChannel, Park};
use crate::native::LibcOps;

use chanio_core::{
    ChannelError, ChannelPhase, Events, Family, NativeOps, NativeSocketAddress, Outcome,
    RawHandle, Result, SocketKind,
};

use parking_lot::Mutex;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

struct ReceiveSide {
    sender: NativeSocketAddress,
    cached: Option<(NativeSocketAddress, SocketAddr)>,
}

impl ReceiveSide {
    /// Logical address of the last sender, decoding only on change
    fn sender_addr(&mut self) -> Result<SocketAddr> {
        if let Some((native, addr)) = &self.cached {
            if *native == self.sender {
                return Ok(*addr);
            }
        }
        let addr = self.sender.decode()?;
        self.cached = Some((self.sender, addr));
        Ok(addr)
    }
}

struct SendSide {
    target: NativeSocketAddress,
    cached: Option<SocketAddr>,
}

impl SendSide {
    fn encode(&mut self, family: Family, addr: &SocketAddr) -> Result<()> {
        if self.cached.as_ref() == Some(addr) {
            return Ok(());
        }
        self.cached = None;
        self.target.encode(family, addr)?;
        self.cached = Some(*addr);
        Ok(())
    }
}

/// Datagram socket; `connect` / `disconnect` move it between
/// unconnected and connected.
pub struct DatagramChannel {
    ch: NativeChannel<ReceiveSide, SendSide>,
    read_timeout: Mutex<Option<Duration>>,
}

impl DatagramChannel {
    pub fn open(family: Family) -> Result<Self> {
        Self::open_with(LibcOps::shared(), family)
    }

    pub fn open_with(ops: Arc<dyn NativeOps>, family: Family) -> Result<Self> {
        let fd = ops.socket(family, SocketKind::Datagram)?;
        Ok(Self {
            ch: NativeChannel::new(
                ops,
                fd,
                family,
                ChannelPhase::Unconnected,
                ReceiveSide {
                    sender: NativeSocketAddress::new(),
                    cached: None,
                },
                SendSide {
                    target: NativeSocketAddress::new(),
                    cached: None,
                },
            ),
            read_timeout: Mutex::new(None),
        })
    }

    pub fn bind(&self, addr: &SocketAddr) -> Result<()> {
        let _r = self.ch.lock_read(ChannelError::ReadPending)?;
        let _w = self.ch.lock_write()?;
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
        let local = query_local(self.ch.ops.as_ref(), self.ch.fd)?;
        self.ch.state().local = Some(local);
        Ok(())
    }

    /// Only exchange datagrams with `addr` from now on.
    pub fn connect(&self, addr: &SocketAddr) -> Result<()> {
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
        }
        let native = native_address(self.ch.family, addr)?;
        loop {
            match self.ch.ops.connect(self.ch.fd, &native)? {
                Outcome::Interrupted => continue,
                _ => break,
            }
        }
        let local = query_local(self.ch.ops.as_ref(), self.ch.fd).ok();
        let mut st = self.ch.state();
        if !st.phase.is_open() {
            return Err(ChannelError::AsynchronousClose);
        }
        st.phase = ChannelPhase::Connected;
        st.remote = Some(*addr);
        st.local = local;
        Ok(())
    }

    /// Dissolve the association; a no-op when not connected.
    pub fn disconnect(&self) -> Result<()> {
        let _r = self.ch.lock_read(ChannelError::ReadPending)?;
        let _w = self.ch.lock_write()?;
        {
            let st = self.ch.state();
            if !st.phase.is_open() {
                return Err(ChannelError::Closed);
            }
            if st.phase != ChannelPhase::Connected {
                return Ok(());
            }
        }
        self.ch.ops.disconnect(self.ch.fd)?;
        let local = query_local(self.ch.ops.as_ref(), self.ch.fd).ok();
        let mut st = self.ch.state();
        if st.phase == ChannelPhase::Connected {
            st.phase = ChannelPhase::Unconnected;
        }
        st.remote = None;
        st.local = local;
        Ok(())
    }

    fn receive_inner(&self, buf: &mut [u8], park: Park) -> Result<Option<(usize, SocketAddr)>> {
        let mut side = self.ch.lock_read(ChannelError::ReadPending)?;
        self.ch.begin(Direction::Read, |_| Ok(()))?;
        let ops = self.ch.ops.clone();
        let fd = self.ch.fd;
        let received = {
            let sender = &mut side.sender;
            self.ch.run(
                Direction::Read,
                Events::READABLE,
                park,
                || ops.recv_from(fd, buf, sender),
                |n| *n > 0 || self.ch.is_open(),
            )?
        };
        match received {
            Some(n) => Ok(Some((n, side.sender_addr()?))),
            None => Ok(None),
        }
    }

    /// Receive one datagram, parking until it arrives. Returns its
    /// length and sender; a datagram longer than `buf` is truncated.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let park = Park::with_timeout(*self.read_timeout.lock());
        self.receive_inner(buf, park)?
            .ok_or(ChannelError::AsynchronousClose)
    }

    /// Single receive attempt; `None` if nothing is queued.
    pub fn try_receive(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        self.receive_inner(buf, Park::Never)
    }

    /// Send one datagram to `target`. A connected channel only sends to
    /// its peer.
    pub fn send(&self, buf: &[u8], target: &SocketAddr) -> Result<usize> {
        let mut side = self.ch.lock_write()?;
        self.ch.begin(Direction::Write, |st| match st.remote {
            Some(remote) if remote != *target => {
                Err(ChannelError::InvalidArgument("target differs from connected peer"))
            }
            _ => Ok(()),
        })?;
        if let Err(e) = side.encode(self.ch.family, target) {
            self.ch.end(Direction::Write, true)?;
            return Err(e);
        }
        let ops = self.ch.ops.clone();
        let fd = self.ch.fd;
        let native = side.target;
        let empty = buf.is_empty();
        let sent = self.ch.run(
            Direction::Write,
            Events::WRITABLE,
            Park::Until(None),
            || ops.send_to(fd, buf, &native),
            |n| *n > 0 || empty,
        )?;
        Ok(sent.unwrap_or(0))
    }

    /// Receive from the connected peer.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _side = self.ch.lock_read(ChannelError::ReadPending)?;
        self.ch.begin(Direction::Read, |st| match st.phase {
            ChannelPhase::Connected => Ok(()),
            _ => Err(ChannelError::NotYetConnected),
        })?;
        let ops = self.ch.ops.clone();
        let fd = self.ch.fd;
        let park = Park::with_timeout(*self.read_timeout.lock());
        let n = self.ch.run(
            Direction::Read,
            Events::READABLE,
            park,
            || ops.read(fd, buf),
            |n| *n > 0 || self.ch.is_open(),
        )?;
        Ok(n.unwrap_or(0))
    }

    /// Send to the connected peer.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let _side = self.ch.lock_write()?;
        self.ch.begin(Direction::Write, |st| match st.phase {
            ChannelPhase::Connected => Ok(()),
            _ => Err(ChannelError::NotYetConnected),
        })?;
        let ops = self.ch.ops.clone();
        let fd = self.ch.fd;
        let n = self.ch.run(
            Direction::Write,
            Events::WRITABLE,
            Park::Until(None),
            || ops.write(fd, buf),
            |_| true,
        )?;
        Ok(n.unwrap_or(0))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock() = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.lock()
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

    pub fn is_connected(&self) -> bool {
        self.ch.state().phase == ChannelPhase::Connected
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_cache_reuses_decoded_address() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut side = ReceiveSide {
            sender: NativeSocketAddress::new(),
            cached: None,
        };
        side.sender.encode(Family::Inet, &addr).unwrap();
        assert_eq!(side.sender_addr().unwrap(), addr);
        assert!(side.cached.is_some());
        assert_eq!(side.sender_addr().unwrap(), addr);

        let other: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        side.sender.encode(Family::Inet, &other).unwrap();
        assert_eq!(side.sender_addr().unwrap(), other);
    }

    #[test]
    fn test_target_cache_skips_reencode() {
        let addr: SocketAddr = "[::1]:53".parse().unwrap();
        let mut side = SendSide {
            target: NativeSocketAddress::new(),
            cached: None,
        };
        side.encode(Family::Inet6, &addr).unwrap();
        assert_eq!(side.cached, Some(addr));
        side.encode(Family::Inet6, &addr).unwrap();
        assert_eq!(side.target.decode().unwrap(), addr);
    }
}
