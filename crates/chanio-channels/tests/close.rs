//! Closing a channel with a blocked operation defers the release of the
//! descriptor until that operation has left.

use chanio_channels::testing::{GatedOps, ReleaseCall};
use chanio_channels::{DatagramChannel, LibcOps, ServerSocketChannel, SocketChannel};
use chanio_core::{ChannelError, Family, SocketKind};

use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn connect(ops: Arc<GatedOps>) -> (Arc<SocketChannel>, SocketChannel, ServerSocketChannel) {
    let server = ServerSocketChannel::open(Family::Inet).unwrap();
    server.bind(&"127.0.0.1:0".parse().unwrap(), 0).unwrap();
    let addr = server.local_addr().unwrap().unwrap();
    let client = SocketChannel::open_with(ops, Family::Inet).unwrap();
    client.connect(&addr).unwrap();
    let (peer, _) = server.accept_timeout(Duration::from_secs(5)).unwrap();
    (Arc::new(client), peer, server)
}

#[test]
fn test_close_drains_before_release() {
    let gate = GatedOps::new();
    let (client, _peer, _server) = connect(gate.clone());
    let fd = client.as_raw_handle();
    gate.hold_poll(fd);

    let reader = {
        let client = client.clone();
        thread::spawn(move || client.read(&mut [0u8; 8]))
    };
    assert!(gate.wait_parked(Duration::from_secs(5)));

    client.close().unwrap();
    assert!(!client.is_open());
    assert!(gate.was_pre_closed(fd));
    assert!(!gate.was_closed(fd));

    // The number stays taken while the reader may still use it.
    let libc = LibcOps::shared();
    let other = libc.socket(Family::Inet, SocketKind::Stream).unwrap();
    assert_ne!(other, fd);
    libc.close(other).unwrap();

    gate.release();
    assert_eq!(reader.join().unwrap(), Err(ChannelError::AsynchronousClose));
    assert_eq!(
        gate.release_calls(),
        vec![ReleaseCall::PreClose(fd), ReleaseCall::Close(fd)]
    );
}

#[test]
fn test_idle_close_releases_at_once() {
    let gate = GatedOps::new();
    let (client, _peer, _server) = connect(gate.clone());
    let fd = client.as_raw_handle();
    client.close().unwrap();
    assert_eq!(gate.release_calls(), vec![ReleaseCall::Close(fd)]);
    // Idempotent.
    client.close().unwrap();
    assert_eq!(gate.release_calls().len(), 1);
    assert_eq!(client.read(&mut [0u8; 1]), Err(ChannelError::Closed));
}

#[test]
fn test_close_wakes_blocked_accept() {
    let server = Arc::new(ServerSocketChannel::open(Family::Inet).unwrap());
    server.bind(&"127.0.0.1:0".parse().unwrap(), 0).unwrap();
    let acceptor = {
        let server = server.clone();
        thread::spawn(move || server.accept().map(|_| ()))
    };
    // Give the acceptor time to park; close works either way.
    thread::sleep(Duration::from_millis(50));
    server.close().unwrap();
    let outcome = acceptor.join().unwrap();
    assert!(
        matches!(outcome, Err(ChannelError::AsynchronousClose) | Err(ChannelError::Closed)),
        "{:?}",
        outcome
    );
}

fn bound_datagram(ops: Arc<GatedOps>) -> (Arc<DatagramChannel>, DatagramChannel) {
    let ch = DatagramChannel::open_with(ops, Family::Inet).unwrap();
    ch.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let peer = DatagramChannel::open(Family::Inet).unwrap();
    peer.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    (Arc::new(ch), peer)
}

#[test]
fn test_close_cuts_off_parked_receive() {
    let gate = GatedOps::new();
    let (ch, _peer) = bound_datagram(gate.clone());
    let fd = ch.as_raw_handle();
    gate.hold_poll(fd);

    let receiver = {
        let ch = ch.clone();
        thread::spawn(move || ch.receive(&mut [0u8; 8]))
    };
    assert!(gate.wait_parked(Duration::from_secs(5)));
    ch.close().unwrap();
    gate.release();

    // The retry reads zero bytes from the swapped-in descriptor; that is
    // not a datagram.
    assert_eq!(receiver.join().unwrap(), Err(ChannelError::AsynchronousClose));
    assert!(gate.was_closed(fd));
}

#[test]
fn test_close_cuts_off_parked_connected_read() {
    let gate = GatedOps::new();
    let (ch, peer) = bound_datagram(gate.clone());
    ch.connect(&peer.local_addr().unwrap().unwrap()).unwrap();
    let fd = ch.as_raw_handle();
    gate.hold_poll(fd);

    let reader = {
        let ch = ch.clone();
        thread::spawn(move || ch.read(&mut [0u8; 8]))
    };
    assert!(gate.wait_parked(Duration::from_secs(5)));
    ch.close().unwrap();
    gate.release();

    assert_eq!(reader.join().unwrap(), Err(ChannelError::AsynchronousClose));
    assert!(gate.was_closed(fd));
}

#[test]
fn test_empty_datagram_on_open_channel_is_delivered() {
    let gate = GatedOps::new();
    let (ch, peer) = bound_datagram(gate);
    let addr = ch.local_addr().unwrap().unwrap();
    let peer_addr = peer.local_addr().unwrap().unwrap();
    ch.set_read_timeout(Some(Duration::from_secs(5)));

    peer.send(b"", &addr).unwrap();
    assert_eq!(ch.receive(&mut [0u8; 8]).unwrap(), (0, peer_addr));
}
