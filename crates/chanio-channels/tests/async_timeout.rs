//! A read timeout that fires while a group thread is retrying the read
//! after a readiness event.

use chanio_channels::testing::GatedOps;
use chanio_channels::{AsyncSocketChannel, ServerSocketChannel, SocketChannel};
use chanio_core::{ChannelError, Family};
use chanio_runtime::{ChannelGroup, GroupConfig};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn connected(g: &ChannelGroup, gate: Arc<GatedOps>) -> (AsyncSocketChannel, SocketChannel) {
    let server = ServerSocketChannel::open(Family::Inet).unwrap();
    server.bind(&"127.0.0.1:0".parse().unwrap(), 0).unwrap();
    let addr = server.local_addr().unwrap().unwrap();
    let client = AsyncSocketChannel::open_with(gate, g, Family::Inet).unwrap();
    client.connect(&addr).unwrap().wait_timeout(WAIT).unwrap();
    let (peer, _) = server.accept_timeout(WAIT).unwrap();
    (client, peer)
}

#[test]
fn test_timeout_during_retry_fails_the_read() {
    let g = ChannelGroup::new(GroupConfig::fixed(2).name("retry-timeout")).unwrap();
    let gate = GatedOps::new();
    let (client, peer) = connected(&g, gate.clone());

    let read = client
        .read(vec![0u8; 8], Some(Duration::from_millis(250)))
        .unwrap();
    // The readiness retry blocks in `read` while the timer runs out.
    gate.hold_read(client.as_raw_handle());
    peer.write(b"x").unwrap();
    assert!(gate.wait_parked(WAIT));
    thread::sleep(Duration::from_millis(750));
    assert!(!read.is_done());
    gate.release();

    let deadline = Instant::now() + WAIT;
    while !read.is_done() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(read.is_done());
    assert_eq!(read.wait(), Err(ChannelError::TimedOut));

    let again = client.read(vec![0u8; 8], None).unwrap();
    assert!(matches!(
        again.wait_timeout(WAIT),
        Err(ChannelError::IllegalState(_))
    ));
    client.close().unwrap();
    g.shutdown_now().unwrap();
}
