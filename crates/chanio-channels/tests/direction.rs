//! Read and write directions of a blocking socket are independent.

use chanio_channels::testing::GatedOps;
use chanio_channels::{ServerSocketChannel, SocketChannel};
use chanio_core::{ChannelError, Family, NativeOps};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn connected_pair() -> (Arc<SocketChannel>, SocketChannel) {
    connected_pair_with(chanio_channels::LibcOps::shared())
}

fn connected_pair_with(ops: Arc<dyn NativeOps>) -> (Arc<SocketChannel>, SocketChannel) {
    let server = ServerSocketChannel::open(Family::Inet).unwrap();
    server.bind(&"127.0.0.1:0".parse().unwrap(), 0).unwrap();
    let addr = server.local_addr().unwrap().unwrap();
    let client = SocketChannel::open_with(ops, Family::Inet).unwrap();
    client.connect(&addr).unwrap();
    let (peer, _) = server.accept_timeout(Duration::from_secs(5)).unwrap();
    (Arc::new(client), peer)
}

#[test]
fn test_write_proceeds_while_read_is_parked() {
    let gate = GatedOps::new();
    let (client, peer) = connected_pair_with(gate.clone());
    gate.hold_poll(client.as_raw_handle());

    let reader = {
        let client = client.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let n = client.read(&mut buf).unwrap();
            buf[..n].to_vec()
        })
    };
    assert!(gate.wait_parked(Duration::from_secs(5)));

    // A second read fails fast; the write direction is free.
    assert_eq!(client.try_read(&mut [0u8; 1]), Err(ChannelError::ReadPending));
    client.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        got += peer.read(&mut buf[got..]).unwrap();
    }
    assert_eq!(&buf, b"ping");

    gate.release();
    peer.write_all(b"pong").unwrap();
    assert_eq!(reader.join().unwrap(), b"pong".to_vec());
}

#[test]
fn test_read_timeout() {
    let (client, _peer) = connected_pair();
    client.set_read_timeout(Some(Duration::from_millis(50)));
    let start = Instant::now();
    assert_eq!(client.read(&mut [0u8; 8]), Err(ChannelError::TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(50));
    // The channel stays usable.
    assert!(client.is_open());
    assert_eq!(client.try_read(&mut [0u8; 8]), Ok(None));
}

#[test]
fn test_shutdown_output_gives_peer_end_of_stream() {
    let (client, peer) = connected_pair();
    client.write_all(b"bye").unwrap();
    client.shutdown_output().unwrap();
    let mut buf = [0u8; 8];
    let mut got = Vec::new();
    loop {
        let n = peer.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"bye");
    assert_eq!(client.write(b"x"), Err(ChannelError::Closed));
}

#[test]
fn test_connect_twice_is_refused() {
    let server = ServerSocketChannel::open(Family::Inet).unwrap();
    server.bind(&"127.0.0.1:0".parse().unwrap(), 0).unwrap();
    let addr = server.local_addr().unwrap().unwrap();
    let client = SocketChannel::open(Family::Inet).unwrap();
    client.connect(&addr).unwrap();
    assert_eq!(client.connect(&addr), Err(ChannelError::AlreadyConnected));
    assert_eq!(client.peer_addr().unwrap(), Some(addr));
}
