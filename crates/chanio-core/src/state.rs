//! Channel lifecycle phases
//!
//! Phases only move forward (`Closing` and `Closed` are terminal);
//! the one exception is a datagram channel, which may go
//! `Connected -> Unconnected` through `disconnect`.

use core::fmt;

/// Phase of a stream, datagram or listener channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelPhase {
    /// Open, no peer (stream/datagram) or not yet bound (listener)
    Unconnected = 0,

    /// Non-blocking or asynchronous connect in flight
    ConnectionPending = 1,

    /// Connected to a peer (listeners use `Bound` instead)
    Connected = 2,

    /// Listener bound and accepting
    Bound = 3,

    /// Close requested; in-flight operations are draining
    Closing = 4,

    /// Native handle released
    Closed = 5,
}

impl ChannelPhase {
    /// Open for new operations
    #[inline]
    pub const fn is_open(&self) -> bool {
        !matches!(self, ChannelPhase::Closing | ChannelPhase::Closed)
    }

    #[inline]
    pub const fn is_closing_or_closed(&self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelPhase::Unconnected => "unconnected",
            ChannelPhase::ConnectionPending => "connection-pending",
            ChannelPhase::Connected => "connected",
            ChannelPhase::Bound => "bound",
            ChannelPhase::Closing => "closing",
            ChannelPhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Kind of operation a pending future stands for
///
/// Passed back to the channel on cancellation so it can kill the
/// matching direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Connect,
    Accept,
    Read,
    Write,
    Lock,
    Other,
}

/// Socket shutdown direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert!(ChannelPhase::Unconnected < ChannelPhase::ConnectionPending);
        assert!(ChannelPhase::Connected < ChannelPhase::Closing);
        assert!(ChannelPhase::Closing < ChannelPhase::Closed);
    }

    #[test]
    fn test_phase_open() {
        assert!(ChannelPhase::Bound.is_open());
        assert!(!ChannelPhase::Closing.is_open());
        assert!(ChannelPhase::Closed.is_closing_or_closed());
    }
}
