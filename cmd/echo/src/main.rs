//! Echo server on a channel group
//!
//! Every connection runs as a chain of completion handlers: a read
//! completes, its handler starts the write of the same buffer, the write
//! handler starts the next read. No thread is tied to a connection.
//!
//! Usage:
//!     ./target/release/echo [port] [seconds]
//!
//! With `seconds` the server shuts down after that long; otherwise it
//! runs until killed.
//!
//! # Environment Variables
//!
//! - `RUST_LOG=debug` - log level (default `info`)
//! - `CHANIO_THREADS=4` - group threads
//! - `CHANIO_THREAD_MODEL=split` - separate polling and handler threads

use chanio::{
    Accepted, AsyncServerSocketChannel, AsyncSocketChannel, ChannelGroup, Family, GroupConfig,
    Result, Transfer,
};
use log::{debug, error, info, warn};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BUF_SIZE: usize = 4096;
const REPORT_EVERY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active: AtomicU64,
    errors: AtomicU64,
}

struct Server {
    listener: AsyncServerSocketChannel,
    stats: Arc<Stats>,
}

struct Conn {
    channel: AsyncSocketChannel,
    peer: SocketAddr,
    stats: Arc<Stats>,
}

impl Conn {
    fn finish(&self) {
        if let Err(e) = self.channel.close() {
            warn!("{}: close failed: {}", self.peer, e);
        }
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        debug!("{}: disconnected", self.peer);
    }

    fn fail(&self, what: &str, e: chanio::ChannelError) {
        if !e.is_closed() {
            warn!("{}: {} failed: {}", self.peer, what, e);
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.finish();
    }
}

fn accept_next(server: Arc<Server>) {
    let listener = &server.listener;
    if let Err(e) = listener.accept_with(server.clone(), on_accept) {
        error!("accept not started: {}", e);
    }
}

fn on_accept(res: Result<Accepted>, server: Arc<Server>) {
    match res {
        Ok((channel, peer)) => {
            server.stats.accepts.fetch_add(1, Ordering::Relaxed);
            server.stats.active.fetch_add(1, Ordering::Relaxed);
            debug!("{}: connected", peer);
            let conn = Arc::new(Conn {
                channel,
                peer,
                stats: server.stats.clone(),
            });
            read_next(conn, vec![0u8; BUF_SIZE]);
        }
        Err(e) if e.is_closed() => {
            info!("listener closed");
            return;
        }
        Err(e) => {
            warn!("accept failed: {}", e);
            server.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
    accept_next(server);
}

fn read_next(conn: Arc<Conn>, buf: Vec<u8>) {
    let channel = &conn.channel;
    if let Err(e) = channel.read_with(buf, None, conn.clone(), on_read) {
        conn.fail("read", e);
    }
}

fn on_read(res: Result<Transfer>, conn: Arc<Conn>) {
    match res {
        Ok((0, _)) => conn.finish(),
        Ok((n, mut buf)) => {
            conn.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
            buf.truncate(n);
            write_next(conn, buf);
        }
        Err(e) => conn.fail("read", e),
    }
}

fn write_next(conn: Arc<Conn>, buf: Vec<u8>) {
    let channel = &conn.channel;
    if let Err(e) = channel.write_with(buf, None, conn.clone(), on_write) {
        conn.fail("write", e);
    }
}

fn on_write(res: Result<Transfer>, conn: Arc<Conn>) {
    match res {
        Ok((n, mut buf)) => {
            conn.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
            buf.drain(..n);
            if buf.is_empty() {
                buf.resize(BUF_SIZE, 0);
                read_next(conn, buf);
            } else {
                write_next(conn, buf);
            }
        }
        Err(e) => conn.fail("write", e),
    }
}

fn report(group: ChannelGroup, stats: Arc<Stats>, start: Instant) {
    info!(
        "[{:.1}s] active={} accepts={} bytes_in={} bytes_out={} err={}",
        start.elapsed().as_secs_f64(),
        stats.active.load(Ordering::Relaxed),
        stats.accepts.load(Ordering::Relaxed),
        stats.bytes_in.load(Ordering::Relaxed),
        stats.bytes_out.load(Ordering::Relaxed),
        stats.errors.load(Ordering::Relaxed),
    );
    let next = group.clone();
    group.schedule(move || report(next, stats, start), REPORT_EVERY);
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9998);
    let run_for: Option<Duration> = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs);

    let group = ChannelGroup::new(GroupConfig::from_env().name("echo"))?;
    let listener = AsyncServerSocketChannel::open(&group, Family::Inet)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    listener.bind(&addr, 128)?;
    info!(
        "echo: listening on {} ({:?}, {} threads)",
        addr,
        group.config().model,
        group.thread_count()
    );

    let stats = Arc::new(Stats::default());
    let server = Arc::new(Server {
        listener,
        stats: stats.clone(),
    });
    accept_next(server);

    let start = Instant::now();
    let reporter = group.clone();
    group.schedule(move || report(reporter, stats, start), REPORT_EVERY);

    match run_for {
        Some(limit) => {
            if !group.await_termination(limit) {
                info!("echo: shutting down after {:?}", limit);
                group.shutdown_now()?;
            }
        }
        None => while !group.await_termination(Duration::from_secs(3600)) {},
    }
    group.await_termination(Duration::from_secs(5));
    Ok(())
}
