//! Readiness events and native-call outcomes

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Readiness event mask
///
/// Platform-neutral; the native layer translates to and from
/// `POLLIN`/`POLLOUT`/`EPOLLIN`/... bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Events(u8);

impl Events {
    pub const NONE: Events = Events(0);
    pub const READABLE: Events = Events(0b0001);
    pub const WRITABLE: Events = Events(0b0010);
    pub const ERROR: Events = Events(0b0100);
    pub const HANGUP: Events = Events(0b1000);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        Events(bits & 0b1111)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if any bit of `other` is set in `self`
    #[inline]
    pub const fn intersects(self, other: Events) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    /// Readable, or an error/hangup condition a reader must observe
    #[inline]
    pub const fn is_readable(self) -> bool {
        self.intersects(Events(Self::READABLE.0 | Self::ERROR.0 | Self::HANGUP.0))
    }

    /// Writable, or an error/hangup condition a writer must observe
    #[inline]
    pub const fn is_writable(self) -> bool {
        self.intersects(Events(Self::WRITABLE.0 | Self::ERROR.0 | Self::HANGUP.0))
    }
}

impl BitOr for Events {
    type Output = Events;

    #[inline]
    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    #[inline]
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.intersects(Events::READABLE) {
            parts.push("READABLE");
        }
        if self.intersects(Events::WRITABLE) {
            parts.push("WRITABLE");
        }
        if self.intersects(Events::ERROR) {
            parts.push("ERROR");
        }
        if self.intersects(Events::HANGUP) {
            parts.push("HANGUP");
        }
        if parts.is_empty() {
            write!(f, "Events(NONE)")
        } else {
            write!(f, "Events({})", parts.join("|"))
        }
    }
}

/// Non-terminal result of a native call
///
/// `WouldBlock` and `Interrupted` are retried by the caller's loop;
/// definitive failures come back as `Err(ChannelError::Os(..))` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Call completed with a value
    Ready(T),
    /// Descriptor not ready (EAGAIN / EWOULDBLOCK / EINPROGRESS)
    WouldBlock,
    /// Call aborted by a signal (EINTR)
    Interrupted,
}

impl<T> Outcome<T> {
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready(_))
    }

    #[inline]
    pub fn ready(self) -> Option<T> {
        match self {
            Outcome::Ready(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Ready(v) => Outcome::Ready(f(v)),
            Outcome::WouldBlock => Outcome::WouldBlock,
            Outcome::Interrupted => Outcome::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_masks() {
        let ev = Events::READABLE | Events::HANGUP;
        assert!(ev.contains(Events::READABLE));
        assert!(!ev.contains(Events::WRITABLE));
        assert!(ev.is_readable());
        assert!(ev.is_writable()); // hangup wakes writers too
        assert!(!Events::READABLE.is_writable());
        assert!(Events::NONE.is_empty());
    }

    #[test]
    fn test_event_debug() {
        assert_eq!(format!("{:?}", Events::NONE), "Events(NONE)");
        assert_eq!(
            format!("{:?}", Events::READABLE | Events::WRITABLE),
            "Events(READABLE|WRITABLE)"
        );
    }

    #[test]
    fn test_outcome_map() {
        assert_eq!(Outcome::Ready(3).map(|n| n * 2), Outcome::Ready(6));
        assert_eq!(Outcome::<u8>::WouldBlock.map(|n| n), Outcome::WouldBlock);
        assert_eq!(Outcome::Ready(1).ready(), Some(1));
        assert!(Outcome::<()>::Interrupted.ready().is_none());
    }
}
