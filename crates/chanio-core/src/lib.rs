//! # chanio-core
//!
//! Platform-neutral vocabulary shared by the chanio runtime and channels.
//!
//! ## Modules
//!
//! - `error` - `ChannelError` taxonomy and `Result`
//! - `events` - readiness `Events` mask and native `Outcome`
//! - `native` - `NativeOps`, the capability interface to the OS
//! - `sockaddr` - reusable `NativeSocketAddress` buffers
//! - `state` - channel phases and operation kinds
//! - `env` - environment variable helpers for configuration

pub mod error;
pub mod events;
pub mod native;
pub mod sockaddr;
pub mod state;
pub mod env;

// Re-exports for convenience
pub use error::{ChannelError, Result};
pub use events::{Events, Outcome};
pub use native::{FileKey, FileOptions, NativeOps, NativeThread, RawHandle, SocketKind};
pub use sockaddr::{Family, NativeSocketAddress};
pub use state::{ChannelPhase, OpKind, ShutdownHow};
pub use env::{env_get, env_get_opt};
