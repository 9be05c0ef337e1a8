//! Port wakeup via eventfd.
//!
//! Writes to an eventfd to pull one thread out of `epoll_wait`.
//! Coalescing: several `notify()` calls before the consumer reads the
//! counter result in one wakeup (eventfd counter semantics).

use chanio_core::{ChannelError, Result};

use std::os::unix::io::RawFd;

pub(crate) struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    /// Create a non-blocking, close-on-exec eventfd.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ChannelError::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = ChannelError::last_os_error();
            // Counter saturated: a wakeup is already pending.
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reset the counter, returning how many notifications it held.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_coalesces() {
        let n = EventFdNotifier::create().unwrap();
        assert_eq!(n.drain(), 0);
        n.notify().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        assert_eq!(n.drain(), 3);
        assert_eq!(n.drain(), 0);
    }
}
