//! # chanio-runtime
//!
//! Channel groups: the threads, readiness port and timeout facility
//! that asynchronous channels run on, plus the machinery that resolves
//! their operations.
//!
//! ## Components
//!
//! - [`ChannelGroup`]: thread pool, member registry, shutdown/termination
//! - [`PendingFuture`]: exactly-once result slot with optional handler
//! - [`invoker`]: direct vs. pooled handler invocation, bounded nesting
//! - [`TimeoutScheduler`]: delayed tasks for operation timeouts
//! - [`PollableChannel`]: callback interface of the epoll port
//!
//! ## Platform
//!
//! Linux only (epoll, eventfd).

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        // supported
    } else {
        compile_error!("chanio-runtime requires epoll and eventfd (Linux)");
    }
}

pub mod config;
pub mod future;
pub mod group;
pub mod invoker;
pub mod port;
pub mod timer;

mod notifier;
mod parking;
mod pool;

/// Unit of work run on a group thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub use config::{GroupConfig, ThreadModel};
pub use future::{Completion, PendingFuture};
pub use group::{AsyncChannel, ChannelGroup, MemberKey};
pub use invoker::Handler;
pub use port::PollableChannel;
pub use timer::{TimeoutHandle, TimeoutScheduler, TimerStats};
