//! Error types for chanio channels and groups
//!
//! Transient native outcomes (would-block, interrupted) are not errors;
//! they travel as [`crate::Outcome`] values and are absorbed by retry
//! loops. Everything here is terminal for the operation that sees it.

use core::fmt;

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors surfaced by channels, groups and futures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel (or group) was already closed when the operation began
    Closed,

    /// Another thread closed the channel while this operation was running
    AsynchronousClose,

    /// A timeout budget ran out while waiting for readiness
    TimedOut,

    /// The operation's future was cancelled before completion
    Cancelled,

    /// Byte-range lock conflicts with one already held by this process
    OverlappingLock,

    /// The owning group rejected the completion task
    GroupShutdown,

    /// A read is already outstanding on this channel
    ReadPending,

    /// A write is already outstanding on this channel
    WritePending,

    /// An accept is already outstanding on this channel
    AcceptPending,

    /// Socket is not connected
    NotYetConnected,

    /// Socket is already connected
    AlreadyConnected,

    /// A non-blocking connect is in progress
    ConnectionPending,

    /// `finish_connect` called without a connect in progress
    NoConnectionPending,

    /// Listener is not bound
    NotYetBound,

    /// Channel is already bound
    AlreadyBound,

    /// Channel was not opened for reading
    NonReadable,

    /// Channel was not opened for writing
    NonWritable,

    /// Address family not supported by this channel
    UnsupportedAddress,

    /// Operation not valid in the current state
    IllegalState(&'static str),

    /// Argument rejected before reaching the OS
    InvalidArgument(&'static str),

    /// Definitive OS failure (errno)
    Os(i32),
}

impl ChannelError {
    /// Wrap a raw errno value
    #[inline]
    pub fn from_errno(errno: i32) -> Self {
        ChannelError::Os(errno)
    }

    /// Capture errno from the calling thread
    #[inline]
    pub fn last_os_error() -> Self {
        ChannelError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// True for the two "channel is gone" kinds
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed | ChannelError::AsynchronousClose)
    }

    /// errno carried by an `Os` error
    #[inline]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ChannelError::Os(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::AsynchronousClose => write!(f, "channel closed by another thread"),
            ChannelError::TimedOut => write!(f, "operation timed out"),
            ChannelError::Cancelled => write!(f, "operation cancelled"),
            ChannelError::OverlappingLock => write!(f, "overlapping file lock"),
            ChannelError::GroupShutdown => write!(f, "channel group is shut down"),
            ChannelError::ReadPending => write!(f, "read already pending"),
            ChannelError::WritePending => write!(f, "write already pending"),
            ChannelError::AcceptPending => write!(f, "accept already pending"),
            ChannelError::NotYetConnected => write!(f, "socket not connected"),
            ChannelError::AlreadyConnected => write!(f, "socket already connected"),
            ChannelError::ConnectionPending => write!(f, "connection already pending"),
            ChannelError::NoConnectionPending => write!(f, "no connection pending"),
            ChannelError::NotYetBound => write!(f, "channel not bound"),
            ChannelError::AlreadyBound => write!(f, "channel already bound"),
            ChannelError::NonReadable => write!(f, "channel not open for reading"),
            ChannelError::NonWritable => write!(f, "channel not open for writing"),
            ChannelError::UnsupportedAddress => write!(f, "unsupported address type"),
            ChannelError::IllegalState(msg) => write!(f, "illegal state: {}", msg),
            ChannelError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ChannelError::Os(errno) => write!(
                f,
                "OS error: {} (errno {})",
                std::io::Error::from_raw_os_error(*errno),
                errno
            ),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<ChannelError> for std::io::Error {
    fn from(e: ChannelError) -> Self {
        use std::io::ErrorKind;
        let kind = match e {
            ChannelError::Os(errno) => return std::io::Error::from_raw_os_error(errno),
            ChannelError::TimedOut => ErrorKind::TimedOut,
            ChannelError::Closed | ChannelError::AsynchronousClose => ErrorKind::NotConnected,
            ChannelError::NotYetConnected => ErrorKind::NotConnected,
            ChannelError::AlreadyConnected | ChannelError::AlreadyBound => ErrorKind::AlreadyExists,
            ChannelError::InvalidArgument(_) | ChannelError::UnsupportedAddress => {
                ErrorKind::InvalidInput
            }
            ChannelError::Cancelled => ErrorKind::Interrupted,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", ChannelError::Cancelled), "operation cancelled");
        assert_eq!(
            format!("{}", ChannelError::IllegalState("reading not allowed")),
            "illegal state: reading not allowed"
        );
        assert!(format!("{}", ChannelError::Os(libc::EBADF)).contains("errno 9"));
    }

    #[test]
    fn test_closed_kinds() {
        assert!(ChannelError::Closed.is_closed());
        assert!(ChannelError::AsynchronousClose.is_closed());
        assert!(!ChannelError::TimedOut.is_closed());
    }

    #[test]
    fn test_io_error_conversion() {
        let io: std::io::Error = ChannelError::TimedOut.into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);

        let io: std::io::Error = ChannelError::Os(libc::ECONNREFUSED).into();
        assert_eq!(io.raw_os_error(), Some(libc::ECONNREFUSED));
    }
}
