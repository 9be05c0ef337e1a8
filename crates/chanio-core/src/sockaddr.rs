//! Native socket address buffers
//!
//! A [`NativeSocketAddress`] is a fixed-size `sockaddr_storage` plus the
//! length of its valid prefix. Channels own a small set of these (one
//! for decoding senders, one for encoding targets) and reuse them for
//! every call instead of building a fresh `sockaddr` each time.
//!
//! The contents are only meaningful between `encode` and the native
//! call that consumes them. An instance is never shared across
//! concurrent callers: each one sits behind the direction lock of the
//! channel that owns it.

use crate::error::{ChannelError, Result};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Protocol family of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    /// Family a logical address would use on its own
    #[inline]
    pub fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::Inet,
            SocketAddr::V6(_) => Family::Inet6,
        }
    }

    /// `AF_INET` / `AF_INET6`
    #[inline]
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Family::Inet => libc::AF_INET,
            Family::Inet6 => libc::AF_INET6,
        }
    }
}

/// Reusable native `sockaddr` buffer
#[derive(Clone, Copy)]
pub struct NativeSocketAddress {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl NativeSocketAddress {
    /// Zeroed buffer with an empty valid region
    pub fn new() -> Self {
        Self {
            // Safety: sockaddr_storage is plain old data; all-zero is valid.
            storage: unsafe { mem::zeroed() },
            len: 0,
        }
    }

    /// Allocate `n` buffers for a channel's private use
    pub fn allocate(n: usize) -> Vec<NativeSocketAddress> {
        (0..n).map(|_| NativeSocketAddress::new()).collect()
    }

    /// Size of the backing storage (what `accept`/`recvfrom` may fill)
    #[inline]
    pub const fn capacity() -> libc::socklen_t {
        mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t
    }

    /// Length of the valid region
    #[inline]
    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record how many bytes a native call wrote into the buffer
    #[inline]
    pub fn set_len(&mut self, len: libc::socklen_t) {
        self.len = len.min(Self::capacity());
    }

    /// Reset before handing the buffer to a call that fills it
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline]
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr
    }

    /// Family stored in the buffer, if it is one we understand
    pub fn family(&self) -> Option<Family> {
        if (self.len as usize) < mem::size_of::<libc::sa_family_t>() {
            return None;
        }
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => Some(Family::Inet),
            libc::AF_INET6 => Some(Family::Inet6),
            _ => None,
        }
    }

    /// Write `addr` in the layout a socket of `family` expects
    ///
    /// An IPv4 address bound for an `Inet6` socket is written as an
    /// IPv4-mapped IPv6 address. An IPv6 address cannot go to an
    /// `Inet` socket. Returns the logical `sockaddr` length.
    pub fn encode(&mut self, family: Family, addr: &SocketAddr) -> Result<usize> {
        self.storage = unsafe { mem::zeroed() };
        match (family, addr) {
            (Family::Inet, SocketAddr::V4(v4)) => self.put_v4(v4),
            (Family::Inet, SocketAddr::V6(_)) => {
                self.len = 0;
                return Err(ChannelError::UnsupportedAddress);
            }
            (Family::Inet6, SocketAddr::V4(v4)) => {
                let mapped = SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0);
                self.put_v6(&mapped)
            }
            (Family::Inet6, SocketAddr::V6(v6)) => self.put_v6(v6),
        }
        Ok(self.len as usize)
    }

    fn put_v4(&mut self, addr: &SocketAddrV4) {
        // Safety: sockaddr_storage is large and aligned enough for sockaddr_in.
        let sin = unsafe { &mut *(self.as_mut_ptr() as *mut libc::sockaddr_in) };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = addr.port().to_be();
        sin.sin_addr = libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        };
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        {
            sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
        }
        self.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    }

    fn put_v6(&mut self, addr: &SocketAddrV6) {
        // Safety: sockaddr_storage is large and aligned enough for sockaddr_in6.
        let sin6 = unsafe { &mut *(self.as_mut_ptr() as *mut libc::sockaddr_in6) };
        sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sin6.sin6_port = addr.port().to_be();
        sin6.sin6_flowinfo = addr.flowinfo();
        sin6.sin6_addr = libc::in6_addr {
            s6_addr: addr.ip().octets(),
        };
        sin6.sin6_scope_id = addr.scope_id();
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        {
            sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
        }
        self.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    }

    /// Parse the valid region back into a logical address
    ///
    /// IPv4-mapped IPv6 addresses decode to their IPv4 form.
    pub fn decode(&self) -> Result<SocketAddr> {
        match self.family() {
            Some(Family::Inet) => {
                if (self.len as usize) < mem::size_of::<libc::sockaddr_in>() {
                    return Err(ChannelError::UnsupportedAddress);
                }
                // Safety: family and length checked above.
                let sin = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            Some(Family::Inet6) => {
                if (self.len as usize) < mem::size_of::<libc::sockaddr_in6>() {
                    return Err(ChannelError::UnsupportedAddress);
                }
                // Safety: family and length checked above.
                let sin6 = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                let port = u16::from_be(sin6.sin6_port);
                if let Some(v4) = ip.to_ipv4_mapped() {
                    return Ok(SocketAddr::V4(SocketAddrV4::new(v4, port)));
                }
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    port,
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            None => Err(ChannelError::UnsupportedAddress),
        }
    }

    /// The valid region as bytes
    #[inline]
    fn bytes(&self) -> &[u8] {
        // Safety: len never exceeds the storage size (see set_len/encode).
        unsafe {
            std::slice::from_raw_parts(
                &self.storage as *const libc::sockaddr_storage as *const u8,
                self.len as usize,
            )
        }
    }
}

impl Default for NativeSocketAddress {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for NativeSocketAddress {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for NativeSocketAddress {}

impl Hash for NativeSocketAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes().hash(state);
    }
}

impl fmt::Debug for NativeSocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(addr) => write!(f, "NativeSocketAddress({})", addr),
            Err(_) => write!(f, "NativeSocketAddress(<{} bytes>)", self.len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_round_trip() {
        let addr: SocketAddr = "192.168.10.20:8080".parse().unwrap();
        let mut buf = NativeSocketAddress::new();
        let len = buf.encode(Family::Inet, &addr).unwrap();
        assert_eq!(len, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(buf.family(), Some(Family::Inet));
        assert_eq!(buf.decode().unwrap(), addr);
    }

    #[test]
    fn test_ipv6_round_trip_with_scope() {
        let addr = SocketAddr::V6(SocketAddrV6::new(
            "fe80::1:2:3:4".parse().unwrap(),
            443,
            0,
            7,
        ));
        let mut buf = NativeSocketAddress::new();
        buf.encode(Family::Inet6, &addr).unwrap();
        let back = buf.decode().unwrap();
        assert_eq!(back, addr);
        match back {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 7),
            _ => panic!("expected v6"),
        }
    }

    #[test]
    fn test_v4_on_inet6_socket_is_mapped() {
        let addr: SocketAddr = "10.0.0.1:53".parse().unwrap();
        let mut buf = NativeSocketAddress::new();
        let len = buf.encode(Family::Inet6, &addr).unwrap();
        assert_eq!(len, mem::size_of::<libc::sockaddr_in6>());
        assert_eq!(buf.family(), Some(Family::Inet6));
        assert_eq!(buf.decode().unwrap(), addr);
    }

    #[test]
    fn test_v6_on_inet_socket_rejected() {
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        let mut buf = NativeSocketAddress::new();
        assert_eq!(
            buf.encode(Family::Inet, &addr),
            Err(ChannelError::UnsupportedAddress)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bytewise_equality() {
        let a: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let mut x = NativeSocketAddress::new();
        let mut y = NativeSocketAddress::new();
        x.encode(Family::Inet, &a).unwrap();
        y.encode(Family::Inet, &a).unwrap();
        assert_eq!(x, y);
        y.encode(Family::Inet, &b).unwrap();
        assert_ne!(x, y);
    }

    #[test]
    fn test_empty_buffer_does_not_decode() {
        let buf = NativeSocketAddress::new();
        assert_eq!(buf.family(), None);
        assert!(buf.decode().is_err());
    }
}
