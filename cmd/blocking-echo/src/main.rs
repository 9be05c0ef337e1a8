//! Blocking echo, client and server in one process
//!
//! The client shares one `SocketChannel` between two threads: a writer
//! pushes `count` messages while the main thread reads the echoes back.
//! Both directions are in flight on the same channel at once. At the
//! end the listener is closed underneath its parked acceptor, which
//! returns with `AsynchronousClose`.
//!
//! Usage:
//!     ./target/release/blocking-echo [count] [size]
//!
//! # Environment Variables
//!
//! - `RUST_LOG=debug` - log level (default `info`)

use chanio::{ChannelError, Family, Result, ServerSocketChannel, SocketChannel};
use log::{debug, error, info, warn};

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn pattern(i: usize) -> u8 {
    (i % 251) as u8
}

fn echo_connection(conn: SocketChannel, peer: SocketAddr) {
    let mut buf = [0u8; 4096];
    let mut total = 0usize;
    loop {
        match conn.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = conn.write_all(&buf[..n]) {
                    warn!("{}: write failed: {}", peer, e);
                    break;
                }
                total += n;
            }
            Err(e) => {
                warn!("{}: read failed: {}", peer, e);
                break;
            }
        }
    }
    debug!("{}: echoed {} bytes", peer, total);
}

fn serve(listener: Arc<ServerSocketChannel>) {
    loop {
        match listener.accept() {
            Ok((conn, peer)) => {
                debug!("{}: connected", peer);
                thread::spawn(move || echo_connection(conn, peer));
            }
            Err(e) if e.is_closed() => {
                info!("acceptor: {}", e);
                return;
            }
            Err(e) => {
                error!("accept failed: {}", e);
                return;
            }
        }
    }
}

fn run_client(addr: &SocketAddr, count: usize, size: usize) -> Result<()> {
    let client = Arc::new(SocketChannel::open(Family::Inet)?);
    client.connect(addr)?;
    client.set_read_timeout(Some(Duration::from_secs(10)));
    info!("client: {} -> {}", client.local_addr()?.map_or("?".into(), |a| a.to_string()), addr);

    let expected = count * size;
    let writer = {
        let client = client.clone();
        thread::spawn(move || -> Result<()> {
            let msg: Vec<u8> = (0..size).map(pattern).collect();
            for _ in 0..count {
                client.write_all(&msg)?;
            }
            client.shutdown_output()
        })
    };

    let start = Instant::now();
    let mut buf = vec![0u8; 64 * 1024];
    let mut received = 0usize;
    loop {
        let n = client.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for (k, b) in buf[..n].iter().enumerate() {
            if *b != pattern((received + k) % size) {
                return Err(ChannelError::IllegalState("echo corrupted"));
            }
        }
        received += n;
    }
    let elapsed = start.elapsed();

    match writer.join() {
        Ok(res) => res?,
        Err(_) => return Err(ChannelError::IllegalState("writer thread panicked")),
    }
    if received != expected {
        return Err(ChannelError::IllegalState("short echo"));
    }
    info!(
        "client: {} bytes in {:.3}s ({:.1} MiB/s)",
        received,
        elapsed.as_secs_f64(),
        received as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(1e-9)
    );
    client.close()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let count: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1000);
    let size: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1024).max(1);

    let listener = Arc::new(ServerSocketChannel::open(Family::Inet)?);
    listener.bind(&SocketAddr::from(([127, 0, 0, 1], 0)), 0)?;
    let addr = listener
        .local_addr()?
        .ok_or(ChannelError::NotYetBound)?;
    info!("server: listening on {}", addr);

    let acceptor = {
        let listener = listener.clone();
        thread::spawn(move || serve(listener))
    };

    let outcome = run_client(&addr, count, size);

    // The acceptor is parked in accept; closing wakes it.
    listener.close()?;
    if acceptor.join().is_err() {
        error!("acceptor panicked");
    }
    outcome
}
