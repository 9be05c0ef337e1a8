//! Datagram exchange over loopback.

use chanio_channels::DatagramChannel;
use chanio_core::{ChannelError, Family};

use std::net::SocketAddr;
use std::time::Duration;

fn bound(family: Family, addr: &str) -> Option<(DatagramChannel, SocketAddr)> {
    let ch = DatagramChannel::open(family).ok()?;
    ch.bind(&addr.parse().unwrap()).ok()?;
    let local = ch.local_addr().unwrap().unwrap();
    ch.set_read_timeout(Some(Duration::from_secs(5)));
    Some((ch, local))
}

#[test]
fn test_send_and_receive_reports_sender() {
    let (a, a_addr) = bound(Family::Inet, "127.0.0.1:0").unwrap();
    let (b, b_addr) = bound(Family::Inet, "127.0.0.1:0").unwrap();

    assert_eq!(a.send(b"one", &b_addr).unwrap(), 3);
    let mut buf = [0u8; 16];
    let (n, from) = b.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"one");
    assert_eq!(from, a_addr);

    // Nothing else queued.
    assert_eq!(b.try_receive(&mut buf).unwrap(), None);
}

#[test]
fn test_connected_read_write() {
    let (a, a_addr) = bound(Family::Inet, "127.0.0.1:0").unwrap();
    let (b, b_addr) = bound(Family::Inet, "127.0.0.1:0").unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(a.read(&mut buf), Err(ChannelError::NotYetConnected));

    a.connect(&b_addr).unwrap();
    assert!(a.is_connected());
    assert_eq!(a.peer_addr().unwrap(), Some(b_addr));
    assert_eq!(a.connect(&b_addr), Err(ChannelError::AlreadyConnected));

    let (c, _) = bound(Family::Inet, "127.0.0.1:0").unwrap();
    let elsewhere = c.local_addr().unwrap().unwrap();
    assert!(matches!(
        a.send(b"x", &elsewhere),
        Err(ChannelError::InvalidArgument(_))
    ));

    a.write(b"two").unwrap();
    let (n, from) = b.receive(&mut buf).unwrap();
    assert_eq!((&buf[..n], from), (&b"two"[..], a_addr));

    b.send(b"back", &a_addr).unwrap();
    let n = a.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"back");

    a.disconnect().unwrap();
    assert!(!a.is_connected());
    assert_eq!(a.peer_addr().unwrap(), None);
    assert_eq!(a.write(b"x"), Err(ChannelError::NotYetConnected));
}

#[test]
fn test_receive_times_out() {
    let (a, _) = bound(Family::Inet, "127.0.0.1:0").unwrap();
    a.set_read_timeout(Some(Duration::from_millis(50)));
    let mut buf = [0u8; 4];
    assert_eq!(a.receive(&mut buf), Err(ChannelError::TimedOut));
    assert!(a.is_open());
}

#[test]
fn test_closed_channel_refuses_io() {
    let (a, a_addr) = bound(Family::Inet, "127.0.0.1:0").unwrap();
    a.close().unwrap();
    assert!(!a.is_open());
    assert_eq!(a.send(b"x", &a_addr), Err(ChannelError::Closed));
    assert_eq!(a.local_addr(), Err(ChannelError::Closed));
}

#[test]
fn test_ipv6_loopback() {
    // Hosts without IPv6 skip this.
    let Some((a, a_addr)) = bound(Family::Inet6, "[::1]:0") else {
        return;
    };
    let (b, b_addr) = bound(Family::Inet6, "[::1]:0").unwrap();
    a.send(b"six", &b_addr).unwrap();
    let mut buf = [0u8; 8];
    let (n, from) = b.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"six");
    assert_eq!(from, a_addr);
}
