//! # chanio-channels
//!
//! Socket, datagram and file channels over the [`NativeOps`] boundary.
//!
//! ## Blocking channels
//!
//! - [`SocketChannel`] / [`ServerSocketChannel`]: stream sockets with
//!   independent read and write directions
//! - [`DatagramChannel`]: datagram socket, connected or not
//! - [`FileChannel`]: positional file I/O with byte-range [`FileLock`]s
//!
//! A blocking operation parks its thread in `NativeOps::poll`, never
//! inside a transfer call, so timeouts and `close` from another thread
//! both work the same way for every channel. Closing a channel that has
//! operations in flight pre-closes the descriptor, signals the parked
//! threads, and leaves the final release to the last one out.
//!
//! ## Asynchronous channels
//!
//! - [`AsyncSocketChannel`] / [`AsyncServerSocketChannel`]: operations
//!   resolve on a [`ChannelGroup`](chanio_runtime::ChannelGroup) through
//!   its readiness port
//! - [`AsyncFileChannel`]: file operations run as group tasks
//!
//! ## Native layer
//!
//! [`LibcOps`] is the libc/nix implementation used by default. The
//! [`testing`] module has a gated wrapper for close-ordering tests.
//!
//! [`NativeOps`]: chanio_core::NativeOps

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        // supported
    } else {
        compile_error!("chanio-channels requires a Unix platform");
    }
}

pub mod native;

mod handle;
mod thread_set;

pub mod async_file;
pub mod async_server;
pub mod async_socket;
pub mod datagram;
pub mod file;
pub mod file_lock;
pub mod server;
pub mod socket;
pub mod testing;

pub use async_file::AsyncFileChannel;
pub use async_server::{Accepted, AsyncServerSocketChannel};
pub use async_socket::{AsyncSocketChannel, Transfer};
pub use datagram::DatagramChannel;
pub use file::{FileChannel, FileLock, WHOLE_FILE};
pub use file_lock::{FileLockTable, LockRecord};
pub use native::LibcOps;
pub use server::ServerSocketChannel;
pub use socket::SocketChannel;
