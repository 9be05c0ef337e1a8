//! File channel with byte-range locks
//!
//! Unlike socket channels a file channel does not serialize by
//! direction: positional reads and writes run concurrently, each
//! holding a slot in the channel's [`NativeThreadSet`]. Operations that
//! use the channel position (`read`, `write`, `truncate`) serialize on
//! the position lock.

use crate::file_lock::{FileLockTable, LockRecord};
use crate::native::LibcOps;
use crate::thread_set::{CloseAction, NativeThreadSet};

use chanio_core::{ChannelError, FileKey, FileOptions, NativeOps, Outcome, RawHandle, Result};

use log::{debug, warn};
use parking_lot::Mutex;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Size that locks everything from `position` to the end of the file,
/// however far it grows
pub const WHOLE_FILE: u64 = i64::MAX as u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct FileInner {
    ops: Arc<dyn NativeOps>,
    fd: RawHandle,
    key: FileKey,
    options: FileOptions,
    id: u64,
    position: Mutex<u64>,
    threads: NativeThreadSet,
    table: Arc<FileLockTable>,
    open: AtomicBool,
}

impl FileInner {
    #[inline]
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    fn ensure_readable(&self) -> Result<()> {
        if self.options.read {
            Ok(())
        } else {
            Err(ChannelError::NonReadable)
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.options.writable() {
            Ok(())
        } else {
            Err(ChannelError::NonWritable)
        }
    }

    /// Run one native call inside a thread-set slot, retrying
    /// interruptions while the channel is open. `None` if the call
    /// would have blocked.
    fn guarded<T>(&self, mut attempt: impl FnMut() -> Result<Outcome<T>>) -> Result<Option<T>> {
        let slot = self.threads.add(self.ops.current_thread())?;
        let out = loop {
            match attempt() {
                Ok(Outcome::Ready(v)) => break Ok(Some(v)),
                Ok(Outcome::WouldBlock) => break Ok(None),
                Ok(Outcome::Interrupted) => {
                    if !self.is_open() {
                        break Err(ChannelError::AsynchronousClose);
                    }
                }
                Err(e) => {
                    // After a pre-close the call fails on the marker socket.
                    break Err(if self.is_open() { e } else { ChannelError::AsynchronousClose });
                }
            }
        };
        if self.threads.remove(slot) {
            self.release();
        }
        out
    }

    fn release(&self) {
        debug!("fd {}: file channel released", self.fd);
        if let Err(e) = self.ops.close(self.fd) {
            warn!("fd {}: close failed: {}", self.fd, e);
        }
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_readable()?;
        self.ensure_open()?;
        let mut position = self.position.lock();
        let n = self
            .guarded(|| self.ops.read_at(self.fd, buf, *position))?
            .unwrap_or(0);
        *position += n as u64;
        Ok(n)
    }

    pub(crate) fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        self.ensure_open()?;
        let mut position = self.position.lock();
        if self.options.append {
            let n = self.guarded(|| self.ops.write(self.fd, buf))?.unwrap_or(0);
            // The data is already written; only the cached position lags.
            match self.size() {
                Ok(size) => *position = size,
                Err(e) => warn!("fd {}: position refresh after append failed: {}", self.fd, e),
            }
            return Ok(n);
        }
        let n = self
            .guarded(|| self.ops.write_at(self.fd, buf, *position))?
            .unwrap_or(0);
        *position += n as u64;
        Ok(n)
    }

    pub(crate) fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        self.ensure_readable()?;
        check_offset(position)?;
        self.ensure_open()?;
        Ok(self
            .guarded(|| self.ops.read_at(self.fd, buf, position))?
            .unwrap_or(0))
    }

    pub(crate) fn write_at(&self, buf: &[u8], position: u64) -> Result<usize> {
        self.ensure_writable()?;
        check_offset(position)?;
        self.ensure_open()?;
        Ok(self
            .guarded(|| self.ops.write_at(self.fd, buf, position))?
            .unwrap_or(0))
    }

    pub(crate) fn size(&self) -> Result<u64> {
        self.ensure_open()?;
        self.guarded(|| self.ops.size(self.fd).map(Outcome::Ready))?
            .ok_or(ChannelError::IllegalState("size would block"))
    }

    pub(crate) fn truncate(&self, size: u64) -> Result<()> {
        self.ensure_writable()?;
        check_offset(size)?;
        self.ensure_open()?;
        let mut position = self.position.lock();
        if size < self.size()? {
            self.guarded(|| self.ops.truncate(self.fd, size).map(Outcome::Ready))?;
        }
        if *position > size {
            *position = size;
        }
        Ok(())
    }

    pub(crate) fn force(&self, metadata: bool) -> Result<()> {
        self.ensure_open()?;
        self.guarded(|| self.ops.force(self.fd, metadata).map(Outcome::Ready))?;
        Ok(())
    }

    /// Register then acquire a byte-range lock. `Ok(None)` when `wait`
    /// is false and another process holds a conflicting lock.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        position: u64,
        size: u64,
        shared: bool,
        wait: bool,
    ) -> Result<Option<FileLock>> {
        match position.checked_add(size) {
            Some(end) if end <= WHOLE_FILE => {}
            _ => return Err(ChannelError::InvalidArgument("lock range overflows")),
        }
        if shared {
            self.ensure_readable()?;
        } else {
            self.ensure_writable()?;
        }
        self.ensure_open()?;
        let record = self.table.new_record(self.key, position, size, shared, self.id);
        self.table.add(&record)?;
        let acquired = self.guarded(|| self.ops.lock(self.fd, position, size, shared, wait));
        let outcome = match acquired {
            Ok(Some(())) if !self.is_open() => Err(ChannelError::AsynchronousClose),
            other => other,
        };
        match outcome {
            Ok(Some(())) => Ok(Some(FileLock {
                record,
                channel: Arc::downgrade(self),
            })),
            Ok(None) => {
                record.invalidate();
                self.table.remove(&record);
                Ok(None)
            }
            Err(e) => {
                record.invalidate();
                self.table.remove(&record);
                Err(e)
            }
        }
    }

    fn unlock(&self, record: &Arc<LockRecord>) -> Result<()> {
        let unlocked = self.ops.unlock(self.fd, record.position(), record.size());
        self.table.remove(record);
        unlocked
    }

    pub(crate) fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        for record in self.table.remove_all(self.key, self.id) {
            if record.invalidate() {
                if let Err(e) = self.ops.unlock(self.fd, record.position(), record.size()) {
                    warn!("fd {}: releasing lock on close failed: {}", self.fd, e);
                }
            }
        }
        match self.threads.close(self.ops.as_ref(), self.fd) {
            CloseAction::ReleaseNow => {
                debug!("fd {}: file channel closed", self.fd);
                self.ops.close(self.fd)
            }
            CloseAction::Deferred | CloseAction::None => Ok(()),
        }
    }
}

impl Drop for FileInner {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("fd {}: close on drop failed: {}", self.fd, e);
        }
    }
}

fn check_offset(offset: u64) -> Result<()> {
    if offset > WHOLE_FILE {
        return Err(ChannelError::InvalidArgument("offset exceeds the maximum file size"));
    }
    Ok(())
}

/// Channel over an open file
pub struct FileChannel {
    inner: Arc<FileInner>,
}

impl FileChannel {
    /// Open `path`; locks are checked against the process-wide table.
    pub fn open(path: impl AsRef<Path>, options: FileOptions) -> Result<Self> {
        Self::open_with(LibcOps::shared(), FileLockTable::shared(), path, options)
    }

    pub fn open_with(
        ops: Arc<dyn NativeOps>,
        table: Arc<FileLockTable>,
        path: impl AsRef<Path>,
        options: FileOptions,
    ) -> Result<Self> {
        if !options.read && !options.writable() {
            return Err(ChannelError::InvalidArgument("open for reading, writing or both"));
        }
        if options.append && options.read {
            return Err(ChannelError::InvalidArgument("append is write-only"));
        }
        if options.append && options.truncate {
            return Err(ChannelError::InvalidArgument("append cannot truncate"));
        }
        let fd = ops.open(path.as_ref(), &options)?;
        let key = match ops.file_key(fd) {
            Ok(key) => key,
            Err(e) => {
                let _ = ops.close(fd);
                return Err(e);
            }
        };
        let inner = Arc::new(FileInner {
            ops,
            fd,
            key,
            options,
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            position: Mutex::new(0),
            threads: NativeThreadSet::new(),
            table,
            open: AtomicBool::new(true),
        });
        debug!("fd {}: opened {:?}", fd, path.as_ref());
        Ok(Self { inner })
    }

    /// Read at the channel position and advance it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    /// Write at the channel position and advance it. In append mode the
    /// data goes to the end of the file and the position follows.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(ChannelError::IllegalState("write made no progress"));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Read at `position`; the channel position is not touched.
    pub fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        self.inner.read_at(buf, position)
    }

    /// Write at `position`; the channel position is not touched.
    pub fn write_at(&self, buf: &[u8], position: u64) -> Result<usize> {
        self.inner.write_at(buf, position)
    }

    pub fn position(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        if self.inner.options.append {
            return self.inner.size();
        }
        Ok(*self.inner.position.lock())
    }

    /// Move the channel position; past the end is allowed.
    pub fn set_position(&self, position: u64) -> Result<()> {
        check_offset(position)?;
        self.inner.ensure_open()?;
        *self.inner.position.lock() = position;
        Ok(())
    }

    pub fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    /// Shrink the file to `size` (never grows it); the position is
    /// clamped to the new size.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.inner.truncate(size)
    }

    /// Flush to the device; `metadata` includes file metadata.
    pub fn force(&self, metadata: bool) -> Result<()> {
        self.inner.force(metadata)
    }

    /// Acquire a byte-range lock, waiting for other processes.
    ///
    /// A range overlapping a lock this process already holds on the
    /// same file fails with `OverlappingLock`.
    pub fn lock(&self, position: u64, size: u64, shared: bool) -> Result<FileLock> {
        self.inner
            .acquire(position, size, shared, true)?
            .ok_or(ChannelError::IllegalState("blocking lock returned without the lock"))
    }

    /// Like `lock`, but `None` if another process holds the range.
    pub fn try_lock(&self, position: u64, size: u64, shared: bool) -> Result<Option<FileLock>> {
        self.inner.acquire(position, size, shared, false)
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Close the channel and release every lock it holds. Operations in
    /// flight fail with `AsynchronousClose`.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn as_raw_handle(&self) -> RawHandle {
        self.inner.fd
    }

    /// Identity of the underlying file
    pub fn file_key(&self) -> FileKey {
        self.inner.key
    }
}

impl fmt::Debug for FileChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChannel")
            .field("fd", &self.inner.fd)
            .field("key", &self.inner.key)
            .field("open", &self.inner.is_open())
            .finish()
    }
}

/// Byte-range lock held through a [`FileChannel`]
///
/// Released by `release`, by dropping it, or by closing the channel.
pub struct FileLock {
    record: Arc<LockRecord>,
    channel: Weak<FileInner>,
}

impl FileLock {
    #[inline]
    pub fn position(&self) -> u64 {
        self.record.position()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.record.size()
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.record.is_shared()
    }

    /// Held: not released and the channel is still open
    pub fn is_valid(&self) -> bool {
        self.record.is_valid()
            && self
                .channel
                .upgrade()
                .map_or(false, |channel| channel.is_open())
    }

    pub fn overlaps(&self, position: u64, size: u64) -> bool {
        self.record.overlaps(position, size)
    }

    /// Release the lock. A no-op if already released; `Closed` if the
    /// channel closed without releasing it.
    pub fn release(&self) -> Result<()> {
        let Some(channel) = self.channel.upgrade() else {
            self.record.invalidate();
            return Ok(());
        };
        if !self.record.is_valid() {
            return Ok(());
        }
        channel.ensure_open()?;
        if self.record.invalidate() {
            channel.unlock(&self.record)?;
        }
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        match self.release() {
            Ok(()) | Err(ChannelError::Closed) => {}
            Err(e) => warn!("releasing dropped lock failed: {}", e),
        }
    }
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("position", &self.position())
            .field("size", &self.size())
            .field("shared", &self.is_shared())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    fn rw() -> FileOptions {
        FileOptions::new().read(true).write(true)
    }

    #[test]
    fn test_read_advances_position() {
        let file = scratch(b"hello world");
        let ch = FileChannel::open(file.path(), FileOptions::new().read(true)).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(ch.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(ch.position().unwrap(), 5);
        assert_eq!(ch.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(ch.position().unwrap(), 5);
    }

    #[test]
    fn test_read_only_channel_refuses_writes() {
        let file = scratch(b"x");
        let ch = FileChannel::open(file.path(), FileOptions::new().read(true)).unwrap();
        assert_eq!(ch.write(b"y"), Err(ChannelError::NonWritable));
        assert_eq!(ch.lock(0, 1, false).err(), Some(ChannelError::NonWritable));
    }

    #[test]
    fn test_append_moves_position_to_end() {
        let file = scratch(b"abc");
        let ch = FileChannel::open(file.path(), FileOptions::new().append(true)).unwrap();
        ch.write_all(b"def").unwrap();
        assert_eq!(ch.size().unwrap(), 6);
        assert_eq!(ch.position().unwrap(), 6);
    }

    #[test]
    fn test_append_reports_bytes_when_size_query_fails() {
        let file = scratch(b"abc");
        let gate = crate::testing::GatedOps::new();
        let ch = FileChannel::open_with(
            gate.clone(),
            Arc::new(FileLockTable::new()),
            file.path(),
            FileOptions::new().append(true),
        )
        .unwrap();
        gate.fail_size(true);
        assert_eq!(ch.write(b"def"), Ok(3));
        assert!(ch.position().is_err());
        gate.fail_size(false);
        assert_eq!(ch.position().unwrap(), 6);
        assert_eq!(std::fs::read(file.path()).unwrap(), b"abcdef");
    }

    #[test]
    fn test_truncate_clamps_position() {
        let file = scratch(b"0123456789");
        let ch = FileChannel::open(file.path(), rw()).unwrap();
        ch.set_position(8).unwrap();
        ch.truncate(4).unwrap();
        assert_eq!(ch.size().unwrap(), 4);
        assert_eq!(ch.position().unwrap(), 4);
        // Never grows the file.
        ch.truncate(100).unwrap();
        assert_eq!(ch.size().unwrap(), 4);
    }

    #[test]
    fn test_locks_are_released_on_close() {
        let file = scratch(b"data");
        let table = Arc::new(FileLockTable::new());
        let ch = FileChannel::open_with(LibcOps::shared(), table.clone(), file.path(), rw()).unwrap();
        let lock = ch.lock(0, 10, false).unwrap();
        assert!(lock.is_valid());
        assert_eq!(table.lock_count(ch.file_key()), 1);
        ch.close().unwrap();
        assert!(!lock.is_valid());
        assert_eq!(table.file_count(), 0);
        assert_eq!(lock.release(), Ok(()));
        assert_eq!(ch.read(&mut [0u8; 1]), Err(ChannelError::Closed));
    }

    #[test]
    fn test_overlap_within_process() {
        let file = scratch(b"");
        let table = Arc::new(FileLockTable::new());
        let a = FileChannel::open_with(LibcOps::shared(), table.clone(), file.path(), rw()).unwrap();
        let b = FileChannel::open_with(LibcOps::shared(), table.clone(), file.path(), rw()).unwrap();
        let held = a.lock(0, 10, false).unwrap();
        assert_eq!(b.try_lock(5, 10, false).err(), Some(ChannelError::OverlappingLock));
        let next = b.try_lock(10, 10, false).unwrap().unwrap();
        held.release().unwrap();
        assert!(!held.is_valid());
        let again = b.try_lock(0, 10, false).unwrap();
        assert!(again.is_some());
        drop(next);
        drop(again);
        assert_eq!(table.file_count(), 0);
    }

    #[test]
    fn test_lock_range_validation() {
        let file = scratch(b"");
        let ch = FileChannel::open(file.path(), rw()).unwrap();
        assert!(matches!(
            ch.try_lock(WHOLE_FILE, 1, false),
            Err(ChannelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_open_rejects_conflicting_options() {
        let file = scratch(b"");
        assert!(FileChannel::open(file.path(), FileOptions::new()).is_err());
        assert!(FileChannel::open(file.path(), FileOptions::new().append(true).truncate(true)).is_err());
    }
}
