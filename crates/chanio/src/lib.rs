//! # chanio - channel I/O
//!
//! Blocking and asynchronous channels over sockets and files.
//!
//! ## Features
//!
//! - **Independent directions**: a read and a write may be in flight on
//!   the same channel at once; a second read fails fast with `ReadPending`
//! - **Two-phase close**: closing while another thread is blocked keeps
//!   the descriptor number reserved until that thread has left
//! - **Channel groups**: asynchronous channels complete on a group's
//!   threads through futures or completion handlers
//! - **File locks**: byte-range locks with in-process overlap detection
//!
//! ## Quick Start
//!
//! ```ignore
//! use chanio::{AsyncServerSocketChannel, ChannelGroup, Family, GroupConfig};
//!
//! fn main() -> chanio::Result<()> {
//!     let group = ChannelGroup::new(GroupConfig::fixed(2).name("demo"))?;
//!     let server = AsyncServerSocketChannel::open(&group, Family::Inet)?;
//!     server.bind(&"127.0.0.1:7000".parse().unwrap(), 0)?;
//!
//!     let (peer, from) = server.accept()?.wait()?;
//!     let (n, buf) = peer.read(vec![0u8; 1024], None)?.wait()?;
//!     peer.write(buf[..n].to_vec(), None)?.wait()?;
//!     println!("echoed {} bytes to {}", n, from);
//!
//!     group.shutdown_now()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │         read/write/accept, futures, completion handlers     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┴───────────────────┐
//!          ▼                                       ▼
//!    ┌─────────────────────┐             ┌─────────────────────┐
//!    │  Blocking channels  │             │  Async channels     │
//!    │  park in poll       │             │  PendingFuture      │
//!    └─────────────────────┘             └─────────────────────┘
//!          │                                       │
//!          │                             ┌─────────────────────┐
//!          │                             │  ChannelGroup       │
//!          │                             │  port, pool, timer  │
//!          │                             └─────────────────────┘
//!          └───────────────────┬───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                  NativeOps (LibcOps)                    │
//!    │       non-blocking syscalls, signal, pre-close          │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use chanio_core::{
    ChannelError,
    ChannelPhase,
    Events,
    Family,
    FileKey,
    FileOptions,
    NativeOps,
    NativeSocketAddress,
    NativeThread,
    OpKind,
    Outcome,
    RawHandle,
    Result,
    ShutdownHow,
    SocketKind,
};

// Re-export env utilities
pub use chanio_core::{env_get, env_get_opt};

// Re-export runtime types
pub use chanio_runtime::{
    invoker,
    AsyncChannel,
    ChannelGroup,
    Completion,
    GroupConfig,
    PendingFuture,
    ThreadModel,
    TimeoutHandle,
};

// Re-export channels
pub use chanio_channels::{
    Accepted,
    AsyncFileChannel,
    AsyncServerSocketChannel,
    AsyncSocketChannel,
    DatagramChannel,
    FileChannel,
    FileLock,
    FileLockTable,
    LibcOps,
    ServerSocketChannel,
    SocketChannel,
    Transfer,
    WHOLE_FILE,
};

/// Test doubles for the native layer
pub use chanio_channels::testing;

/// Open a group with `n` threads that both poll and run handlers.
///
/// Shorthand for `ChannelGroup::new(GroupConfig::fixed(n).name(name))`.
pub fn fixed_group(name: &str, n: usize) -> Result<ChannelGroup> {
    ChannelGroup::new(GroupConfig::fixed(n).name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_group() {
        let g = fixed_group("facade", 2).unwrap();
        assert!(g.is_fixed_thread_pool());
        assert_eq!(g.config().name, "facade");
        g.shutdown();
        assert!(g.await_termination(std::time::Duration::from_secs(5)));
    }
}
