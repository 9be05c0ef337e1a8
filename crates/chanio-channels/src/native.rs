//! libc implementation of the native-call boundary
//!
//! All sockets are created `SOCK_NONBLOCK | SOCK_CLOEXEC`; blocking
//! channel operations park in [`NativeOps::poll`] instead of inside the
//! transfer call.
//!
//! # Close signalling
//!
//! `signal` sends `SIGURG` with `pthread_kill`. A no-op handler for it
//! is installed once, without `SA_RESTART`, so the target's `poll` (or
//! any other slow call) returns `EINTR`.
//!
//! `pre_close` `dup2`s a socket whose both directions are shut down
//! over the descriptor: the number stays taken, and calls on it see
//! end-of-stream / `EPIPE` until `close` finally frees it.

use chanio_core::{
    ChannelError, Events, Family, FileKey, FileOptions, NativeOps, NativeSocketAddress,
    NativeThread, Outcome, RawHandle, Result, ShutdownHow, SocketKind,
};

use log::warn;
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use std::ffi::CString;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::{Arc, Once, OnceLock};

const CLOSE_SIGNAL: Signal = Signal::SIGURG;

static INSTALL_SIGNAL: Once = Once::new();

extern "C" fn on_close_signal(_: libc::c_int) {}

fn install_close_signal() {
    INSTALL_SIGNAL.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(on_close_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // Safety: the handler does nothing, so it is async-signal-safe.
        if let Err(e) = unsafe { sigaction(CLOSE_SIGNAL, &action) } {
            warn!("installing close signal handler failed: {}", e);
        }
    });
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Map a failed call to an outcome: EAGAIN is would-block, EINTR interrupted.
#[inline]
fn transient<T>(err: i32) -> Result<Outcome<T>> {
    match err {
        libc::EAGAIN | libc::EINPROGRESS => Ok(Outcome::WouldBlock),
        #[allow(unreachable_patterns)]
        libc::EWOULDBLOCK => Ok(Outcome::WouldBlock),
        libc::EINTR => Ok(Outcome::Interrupted),
        e => Err(ChannelError::from_errno(e)),
    }
}

#[inline]
fn check(ret: libc::c_int) -> Result<()> {
    if ret < 0 {
        Err(ChannelError::last_os_error())
    } else {
        Ok(())
    }
}

#[inline]
fn transfer(ret: libc::ssize_t) -> Result<Outcome<usize>> {
    if ret < 0 {
        transient(errno())
    } else {
        Ok(Outcome::Ready(ret as usize))
    }
}

fn to_poll(events: Events) -> libc::c_short {
    let mut bits = 0;
    if events.intersects(Events::READABLE) {
        bits |= libc::POLLIN;
    }
    if events.intersects(Events::WRITABLE) {
        bits |= libc::POLLOUT;
    }
    bits
}

fn from_poll(bits: libc::c_short) -> Events {
    let mut events = Events::NONE;
    if bits & libc::POLLIN != 0 {
        events |= Events::READABLE;
    }
    if bits & libc::POLLOUT != 0 {
        events |= Events::WRITABLE;
    }
    if bits & (libc::POLLERR | libc::POLLNVAL) != 0 {
        events |= Events::ERROR;
    }
    if bits & libc::POLLHUP != 0 {
        events |= Events::HANGUP;
    }
    events
}

fn stat(fd: RawHandle) -> Result<libc::stat> {
    // Safety: zeroed stat is a valid out-parameter.
    let mut st: libc::stat = unsafe { mem::zeroed() };
    check(unsafe { libc::fstat(fd, &mut st) })?;
    Ok(st)
}

/// Byte-range lock commands: open-file-description locks where the
/// platform has them, so locks belong to the channel rather than the
/// process and survive other descriptors to the same file closing.
fn lock_commands() -> (libc::c_int, libc::c_int) {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            (libc::F_OFD_SETLK, libc::F_OFD_SETLKW)
        } else {
            (libc::F_SETLK, libc::F_SETLKW)
        }
    }
}

fn flock(kind: libc::c_int, position: u64, size: u64) -> libc::flock {
    // Safety: flock is plain old data; l_pid must be 0 for OFD locks.
    let mut fl: libc::flock = unsafe { mem::zeroed() };
    fl.l_type = kind as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = position.min(i64::MAX as u64) as libc::off_t;
    // Lengths past off_t mean "to end of file, however far it grows".
    fl.l_len = if size > i64::MAX as u64 { 0 } else { size as libc::off_t };
    fl
}

/// Native operations over libc / nix
#[derive(Debug)]
pub struct LibcOps {
    /// Shut-down socket that pre-closed descriptors are pointed at
    marker: OnceLock<RawHandle>,
}

impl LibcOps {
    pub fn new() -> Self {
        install_close_signal();
        Self {
            marker: OnceLock::new(),
        }
    }

    /// Process-wide default instance
    pub fn shared() -> Arc<dyn NativeOps> {
        static SHARED: OnceLock<Arc<LibcOps>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(LibcOps::new())).clone()
    }

    fn marker(&self) -> Result<RawHandle> {
        if let Some(fd) = self.marker.get() {
            return Ok(*fd);
        }
        let mut sv = [0 as libc::c_int; 2];
        check(unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                sv.as_mut_ptr(),
            )
        })?;
        unsafe {
            libc::shutdown(sv[0], libc::SHUT_RDWR);
            libc::close(sv[1]);
        }
        // Lost race: keep the winner's marker.
        match self.marker.set(sv[0]) {
            Ok(()) => Ok(sv[0]),
            Err(ours) => {
                unsafe {
                    libc::close(ours);
                }
                self.marker
                    .get()
                    .copied()
                    .ok_or(ChannelError::IllegalState("pre-close marker missing"))
            }
        }
    }
}

impl Default for LibcOps {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LibcOps {
    fn drop(&mut self) {
        if let Some(fd) = self.marker.get() {
            unsafe {
                libc::close(*fd);
            }
        }
    }
}

impl NativeOps for LibcOps {
    fn socket(&self, family: Family, kind: SocketKind) -> Result<RawHandle> {
        let ty = match kind {
            SocketKind::Stream => libc::SOCK_STREAM,
            SocketKind::Datagram => libc::SOCK_DGRAM,
        };
        let fd = unsafe {
            libc::socket(
                family.as_raw(),
                ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(ChannelError::last_os_error());
        }
        Ok(fd)
    }

    fn socketpair(&self) -> Result<(RawHandle, RawHandle)> {
        let mut sv = [0 as libc::c_int; 2];
        check(unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                sv.as_mut_ptr(),
            )
        })?;
        Ok((sv[0], sv[1]))
    }

    fn bind(&self, fd: RawHandle, addr: &NativeSocketAddress) -> Result<()> {
        check(unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) })
    }

    fn listen(&self, fd: RawHandle, backlog: i32) -> Result<()> {
        check(unsafe { libc::listen(fd, backlog) })
    }

    fn set_reuse_address(&self, fd: RawHandle, on: bool) -> Result<()> {
        let opt: libc::c_int = on as libc::c_int;
        check(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
    }

    fn connect(&self, fd: RawHandle, addr: &NativeSocketAddress) -> Result<Outcome<()>> {
        let ret = unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) };
        if ret == 0 {
            return Ok(Outcome::Ready(()));
        }
        match errno() {
            libc::EISCONN => Ok(Outcome::Ready(())),
            // An interrupted non-blocking connect carries on in the background.
            libc::EINPROGRESS | libc::EALREADY | libc::EINTR => Ok(Outcome::WouldBlock),
            e => Err(ChannelError::from_errno(e)),
        }
    }

    fn finish_connect(&self, fd: RawHandle) -> Result<Outcome<()>> {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        if n < 0 {
            return transient(errno());
        }
        if n == 0 {
            return Ok(Outcome::WouldBlock);
        }
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        check(unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        })?;
        match err {
            0 => Ok(Outcome::Ready(())),
            libc::EINPROGRESS | libc::EALREADY => Ok(Outcome::WouldBlock),
            e => Err(ChannelError::from_errno(e)),
        }
    }

    fn accept(&self, fd: RawHandle, peer: &mut NativeSocketAddress) -> Result<Outcome<RawHandle>> {
        let mut len = NativeSocketAddress::capacity();
        let ret = unsafe {
            libc::accept4(
                fd,
                peer.as_mut_ptr(),
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if ret < 0 {
            peer.clear();
            return match errno() {
                // Peer gave up before we got to it; try the next one.
                libc::ECONNABORTED => Ok(Outcome::Interrupted),
                e => transient(e),
            };
        }
        peer.set_len(len);
        Ok(Outcome::Ready(ret))
    }

    fn recv_from(
        &self,
        fd: RawHandle,
        buf: &mut [u8],
        from: &mut NativeSocketAddress,
    ) -> Result<Outcome<usize>> {
        let mut len = NativeSocketAddress::capacity();
        let ret = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                from.as_mut_ptr(),
                &mut len,
            )
        };
        if ret >= 0 {
            from.set_len(len);
        }
        transfer(ret)
    }

    fn send_to(&self, fd: RawHandle, buf: &[u8], to: &NativeSocketAddress) -> Result<Outcome<usize>> {
        let ret = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
                to.as_ptr(),
                to.len(),
            )
        };
        transfer(ret)
    }

    fn disconnect(&self, fd: RawHandle) -> Result<()> {
        // Safety: zeroed sockaddr with AF_UNSPEC dissolves the association.
        let mut sa: libc::sockaddr = unsafe { mem::zeroed() };
        sa.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
        let ret = unsafe { libc::connect(fd, &sa, mem::size_of::<libc::sockaddr>() as libc::socklen_t) };
        if ret < 0 && errno() != libc::EAFNOSUPPORT {
            return Err(ChannelError::last_os_error());
        }
        Ok(())
    }

    fn shutdown(&self, fd: RawHandle, how: ShutdownHow) -> Result<()> {
        let how = match how {
            ShutdownHow::Read => libc::SHUT_RD,
            ShutdownHow::Write => libc::SHUT_WR,
            ShutdownHow::Both => libc::SHUT_RDWR,
        };
        match check(unsafe { libc::shutdown(fd, how) }) {
            // Already disconnected: nothing left to shut.
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            other => other,
        }
    }

    fn local_address(&self, fd: RawHandle, out: &mut NativeSocketAddress) -> Result<()> {
        let mut len = NativeSocketAddress::capacity();
        check(unsafe { libc::getsockname(fd, out.as_mut_ptr(), &mut len) })?;
        out.set_len(len);
        Ok(())
    }

    fn peer_address(&self, fd: RawHandle, out: &mut NativeSocketAddress) -> Result<()> {
        let mut len = NativeSocketAddress::capacity();
        check(unsafe { libc::getpeername(fd, out.as_mut_ptr(), &mut len) })?;
        out.set_len(len);
        Ok(())
    }

    fn read(&self, fd: RawHandle, buf: &mut [u8]) -> Result<Outcome<usize>> {
        transfer(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
    }

    fn write(&self, fd: RawHandle, buf: &[u8]) -> Result<Outcome<usize>> {
        let ret = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if ret < 0 && errno() == libc::ENOTSOCK {
            return transfer(unsafe {
                libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
            });
        }
        transfer(ret)
    }

    fn poll(&self, fd: RawHandle, events: Events, timeout_ms: i32) -> Result<Outcome<Events>> {
        let mut pfd = libc::pollfd {
            fd,
            events: to_poll(events),
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n < 0 {
            return transient(errno());
        }
        Ok(Outcome::Ready(from_poll(pfd.revents)))
    }

    fn open(&self, path: &Path, options: &FileOptions) -> Result<RawHandle> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| ChannelError::InvalidArgument("path contains a NUL byte"))?;
        let mut flags = libc::O_CLOEXEC;
        flags |= match (options.read, options.writable()) {
            (true, true) => libc::O_RDWR,
            (false, true) => libc::O_WRONLY,
            _ => libc::O_RDONLY,
        };
        if options.append {
            flags |= libc::O_APPEND;
        }
        if options.create_new {
            flags |= libc::O_CREAT | libc::O_EXCL;
        } else if options.create {
            flags |= libc::O_CREAT;
        }
        if options.truncate && options.writable() {
            flags |= libc::O_TRUNC;
        }
        loop {
            let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o666 as libc::c_uint) };
            if fd >= 0 {
                return Ok(fd);
            }
            let e = errno();
            if e != libc::EINTR {
                return Err(ChannelError::from_errno(e));
            }
        }
    }

    fn read_at(&self, fd: RawHandle, buf: &mut [u8], position: u64) -> Result<Outcome<usize>> {
        transfer(unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                position as libc::off_t,
            )
        })
    }

    fn write_at(&self, fd: RawHandle, buf: &[u8], position: u64) -> Result<Outcome<usize>> {
        transfer(unsafe {
            libc::pwrite(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                position as libc::off_t,
            )
        })
    }

    fn size(&self, fd: RawHandle) -> Result<u64> {
        Ok(stat(fd)?.st_size as u64)
    }

    fn truncate(&self, fd: RawHandle, size: u64) -> Result<()> {
        check(unsafe { libc::ftruncate(fd, size as libc::off_t) })
    }

    fn force(&self, fd: RawHandle, metadata: bool) -> Result<()> {
        if metadata {
            check(unsafe { libc::fsync(fd) })
        } else {
            check(unsafe { libc::fdatasync(fd) })
        }
    }

    fn file_key(&self, fd: RawHandle) -> Result<FileKey> {
        let st = stat(fd)?;
        Ok(FileKey {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        })
    }

    fn lock(
        &self,
        fd: RawHandle,
        position: u64,
        size: u64,
        shared: bool,
        wait: bool,
    ) -> Result<Outcome<()>> {
        let (try_cmd, wait_cmd) = lock_commands();
        let kind = if shared { libc::F_RDLCK } else { libc::F_WRLCK };
        let fl = flock(kind, position, size);
        let cmd = if wait { wait_cmd } else { try_cmd };
        let ret = unsafe { libc::fcntl(fd, cmd, &fl as *const libc::flock) };
        if ret == 0 {
            return Ok(Outcome::Ready(()));
        }
        match errno() {
            libc::EACCES | libc::EAGAIN => Ok(Outcome::WouldBlock),
            libc::EINTR => Ok(Outcome::Interrupted),
            e => Err(ChannelError::from_errno(e)),
        }
    }

    fn unlock(&self, fd: RawHandle, position: u64, size: u64) -> Result<()> {
        let (try_cmd, _) = lock_commands();
        let fl = flock(libc::F_UNLCK, position, size);
        check(unsafe { libc::fcntl(fd, try_cmd, &fl as *const libc::flock) })
    }

    fn pre_close(&self, fd: RawHandle) -> Result<()> {
        let marker = self.marker()?;
        loop {
            if unsafe { libc::dup2(marker, fd) } >= 0 {
                return Ok(());
            }
            let e = errno();
            if e != libc::EINTR && e != libc::EBUSY {
                return Err(ChannelError::from_errno(e));
            }
        }
    }

    fn close(&self, fd: RawHandle) -> Result<()> {
        // EINTR on close still releases the descriptor on Linux.
        if unsafe { libc::close(fd) } < 0 {
            let e = errno();
            if e != libc::EINTR {
                return Err(ChannelError::from_errno(e));
            }
        }
        Ok(())
    }

    fn current_thread(&self) -> NativeThread {
        NativeThread(pthread_self() as u64)
    }

    fn signal(&self, thread: NativeThread) -> Result<()> {
        pthread_kill(thread.0 as Pthread, CLOSE_SIGNAL)
            .map_err(|e| ChannelError::from_errno(e as i32))
    }
}
