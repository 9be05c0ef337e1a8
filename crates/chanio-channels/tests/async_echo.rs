//! Echo through asynchronous channels on a fixed-thread group.

use chanio_channels::{Accepted, AsyncServerSocketChannel, AsyncSocketChannel};
use chanio_core::{ChannelError, Family};
use chanio_runtime::{ChannelGroup, GroupConfig};

use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn group(name: &str) -> ChannelGroup {
    ChannelGroup::new(GroupConfig::fixed(2).name(name)).unwrap()
}

fn listener(g: &ChannelGroup) -> (AsyncServerSocketChannel, SocketAddr) {
    let server = AsyncServerSocketChannel::open(g, Family::Inet).unwrap();
    server.bind(&"127.0.0.1:0".parse().unwrap(), 0).unwrap();
    let addr = server.local_addr().unwrap().unwrap();
    (server, addr)
}

fn connected(g: &ChannelGroup) -> (AsyncServerSocketChannel, AsyncSocketChannel, AsyncSocketChannel) {
    let (server, addr) = listener(g);
    let accept = server.accept().unwrap();
    let client = AsyncSocketChannel::open(g, Family::Inet).unwrap();
    client.connect(&addr).unwrap().wait_timeout(WAIT).unwrap();
    let (peer, _) = accept.wait_timeout(WAIT).unwrap();
    (server, client, peer)
}

#[test]
fn test_echo_with_futures() {
    let g = group("echo-future");
    let (_server, client, peer) = connected(&g);
    assert_eq!(g.member_count(), 3);

    let pending_read = peer.read(vec![0u8; 32], None).unwrap();
    let (n, _) = client
        .write(b"hello".to_vec(), None)
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert_eq!(n, 5);

    let (n, buf) = pending_read.wait_timeout(WAIT).unwrap();
    assert_eq!(&buf[..n], b"hello");
    peer.write(buf[..n].to_vec(), None)
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();

    let (n, buf) = client
        .read(vec![0u8; 32], None)
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert_eq!(&buf[..n], b"hello");

    client.close().unwrap();
    let (n, _) = peer
        .read(vec![0u8; 32], None)
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert_eq!(n, 0);
    g.shutdown_now().unwrap();
}

#[test]
fn test_echo_with_handlers() {
    let g = group("echo-handler");
    let (server, addr) = listener(&g);
    let (tx, rx) = mpsc::channel();

    server
        .accept_with(tx.clone(), |accepted: chanio_core::Result<Accepted>, tx| {
            let (peer, _) = accepted.unwrap();
            let peer = std::sync::Arc::new(peer);
            let echo = peer.clone();
            peer.read_with(vec![0u8; 32], None, tx, move |res, tx| {
                let (n, buf) = res.unwrap();
                let keep = echo.clone();
                echo.write_with(buf[..n].to_vec(), None, tx, move |res, tx| {
                    let _keep = keep;
                    tx.send(res.map(|(n, _)| n)).unwrap();
                })
                .unwrap();
            })
            .unwrap();
        })
        .unwrap();

    let client = AsyncSocketChannel::open(&g, Family::Inet).unwrap();
    let (ctx, crx) = mpsc::channel();
    client
        .connect_with(&addr, ctx, |res, ctx| ctx.send(res).unwrap())
        .unwrap();
    crx.recv_timeout(WAIT).unwrap().unwrap();

    client
        .write(b"abc".to_vec(), None)
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(3));

    let (n, buf) = client
        .read(vec![0u8; 8], None)
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert_eq!(&buf[..n], b"abc");
    drop(tx);
    g.shutdown_now().unwrap();
}

#[test]
fn test_read_timeout_disables_reads() {
    let g = group("echo-timeout");
    let (_server, client, _peer) = connected(&g);

    let read = client
        .read(vec![0u8; 8], Some(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(read.wait_timeout(WAIT).err(), Some(ChannelError::TimedOut));

    let again = client.read(vec![0u8; 8], None).unwrap();
    assert!(matches!(
        again.wait_timeout(WAIT),
        Err(ChannelError::IllegalState(_))
    ));

    // Writes are unaffected.
    let (n, _) = client
        .write(b"x".to_vec(), None)
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert_eq!(n, 1);
    g.shutdown_now().unwrap();
}

#[test]
fn test_cancel_pending_read() {
    let g = group("echo-cancel");
    let (_server, client, _peer) = connected(&g);

    let read = client.read(vec![0u8; 8], None).unwrap();
    assert!(read.cancel(false));
    assert!(read.is_cancelled());
    assert_eq!(read.wait().err(), Some(ChannelError::Cancelled));
    assert!(client.is_open());

    let write = client.write(b"y".to_vec(), None).unwrap();
    assert_eq!(write.wait_timeout(WAIT).unwrap().0, 1);
    g.shutdown_now().unwrap();
}

#[test]
fn test_second_read_is_refused_while_pending() {
    let g = group("echo-pending");
    let (_server, client, _peer) = connected(&g);

    let _first = client.read(vec![0u8; 8], None).unwrap();
    assert!(matches!(
        client.read(vec![0u8; 8], None),
        Err(ChannelError::ReadPending)
    ));
    client.close().unwrap();
    g.shutdown_now().unwrap();
}
