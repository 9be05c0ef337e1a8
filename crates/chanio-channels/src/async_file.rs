//! Asynchronous file channel
//!
//! Files have no readiness to wait for, so each operation runs as a
//! task on the group's threads and resolves its future from there.

use crate::async_socket::Transfer;
use crate::file::{FileChannel, FileLock};
use crate::file_lock::FileLockTable;

use chanio_core::{ChannelError, FileOptions, NativeOps, OpKind, Result};
use chanio_runtime::{AsyncChannel, ChannelGroup, Completion, PendingFuture};

use log::debug;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};

struct Shared {
    group: ChannelGroup,
    file: FileChannel,
}

impl AsyncChannel for Shared {
    // Work already handed to the pool runs to completion; its late
    // outcome is dropped by the resolved future.
    fn on_cancel(&self, _kind: OpKind) {}

    fn close(&self) -> Result<()> {
        self.file.close()
    }
}

/// File channel whose reads, writes and locks complete on a group
pub struct AsyncFileChannel {
    shared: Arc<Shared>,
}

impl AsyncFileChannel {
    pub fn open(path: impl AsRef<Path>, options: FileOptions, group: &ChannelGroup) -> Result<Self> {
        Ok(Self::from_file(FileChannel::open(path, options)?, group))
    }

    pub fn open_with(
        ops: Arc<dyn NativeOps>,
        table: Arc<FileLockTable>,
        path: impl AsRef<Path>,
        options: FileOptions,
        group: &ChannelGroup,
    ) -> Result<Self> {
        let file = FileChannel::open_with(ops, table, path, options)?;
        Ok(Self::from_file(file, group))
    }

    fn from_file(file: FileChannel, group: &ChannelGroup) -> Self {
        Self {
            shared: Arc::new(Shared {
                group: group.clone(),
                file,
            }),
        }
    }

    fn weak_channel(&self) -> Weak<dyn AsyncChannel> {
        let me: Weak<Shared> = Arc::downgrade(&self.shared);
        me
    }

    /// Run `work` on the group and resolve `done` with its outcome.
    fn submit<V, F>(&self, done: Arc<dyn Completion<V>>, work: F) -> Result<()>
    where
        V: Send + 'static,
        F: FnOnce(&FileChannel) -> Result<V> + Send + 'static,
    {
        if !self.shared.file.is_open() {
            done.complete(Err(ChannelError::Closed))?;
            return Ok(());
        }
        let shared = self.shared.clone();
        let task_done = done.clone();
        let submitted = self.shared.group.execute(move || {
            // Cancelled while queued.
            if task_done.is_done() {
                return;
            }
            let outcome = work(&shared.file);
            if let Err(e) = task_done.complete(outcome) {
                debug!("file completion not dispatched: {}", e);
            }
        });
        if let Err(e) = submitted {
            done.complete(Err(e))?;
        }
        Ok(())
    }

    fn future<V: Send + 'static>(&self, kind: OpKind) -> PendingFuture<V> {
        PendingFuture::new(&self.shared.group, Some(self.weak_channel()), kind)
    }

    fn handler_future<V, A, F>(&self, kind: OpKind, attachment: A, handler: F) -> PendingFuture<V, A>
    where
        V: Send + 'static,
        A: Send + 'static,
        F: FnOnce(Result<V>, A) + Send + 'static,
    {
        PendingFuture::with_handler(
            &self.shared.group,
            Some(self.weak_channel()),
            kind,
            attachment,
            handler,
        )
    }

    /// Read into `buf` at `position`. Resolves to the byte count (0 at
    /// end of file) and the buffer.
    pub fn read(&self, buf: Vec<u8>, position: u64) -> Result<PendingFuture<Transfer>> {
        let future = self.future(OpKind::Read);
        self.submit(future.completion(), move |file| read_task(file, buf, position))?;
        Ok(future)
    }

    pub fn read_with<A, F>(&self, buf: Vec<u8>, position: u64, attachment: A, handler: F) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<Transfer>, A) + Send + 'static,
    {
        let future = self.handler_future(OpKind::Read, attachment, handler);
        self.submit(future.completion(), move |file| read_task(file, buf, position))
    }

    /// Write `buf` at `position`. Resolves to the byte count and the buffer.
    pub fn write(&self, buf: Vec<u8>, position: u64) -> Result<PendingFuture<Transfer>> {
        let future = self.future(OpKind::Write);
        self.submit(future.completion(), move |file| write_task(file, buf, position))?;
        Ok(future)
    }

    pub fn write_with<A, F>(&self, buf: Vec<u8>, position: u64, attachment: A, handler: F) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<Transfer>, A) + Send + 'static,
    {
        let future = self.handler_future(OpKind::Write, attachment, handler);
        self.submit(future.completion(), move |file| write_task(file, buf, position))
    }

    /// Acquire a byte-range lock on a group thread.
    ///
    /// If the future was cancelled by the time the lock is granted, the
    /// lock is released again.
    pub fn lock(&self, position: u64, size: u64, shared: bool) -> Result<PendingFuture<FileLock>> {
        let future = self.future(OpKind::Lock);
        self.submit(future.completion(), move |file| file.lock(position, size, shared))?;
        Ok(future)
    }

    pub fn lock_with<A, F>(
        &self,
        position: u64,
        size: u64,
        shared: bool,
        attachment: A,
        handler: F,
    ) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<FileLock>, A) + Send + 'static,
    {
        let future = self.handler_future(OpKind::Lock, attachment, handler);
        self.submit(future.completion(), move |file| file.lock(position, size, shared))
    }

    /// Non-waiting lock attempt on the calling thread.
    pub fn try_lock(&self, position: u64, size: u64, shared: bool) -> Result<Option<FileLock>> {
        self.shared.file.try_lock(position, size, shared)
    }

    pub fn size(&self) -> Result<u64> {
        self.shared.file.size()
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.shared.file.truncate(size)
    }

    pub fn force(&self, metadata: bool) -> Result<()> {
        self.shared.file.force(metadata)
    }

    pub fn group(&self) -> &ChannelGroup {
        &self.shared.group
    }

    pub fn is_open(&self) -> bool {
        self.shared.file.is_open()
    }

    /// Close the file and release its locks. Operations running on the
    /// group fail with `AsynchronousClose`.
    pub fn close(&self) -> Result<()> {
        self.shared.file.close()
    }
}

fn read_task(file: &FileChannel, mut buf: Vec<u8>, position: u64) -> Result<Transfer> {
    let n = file.read_at(&mut buf, position)?;
    Ok((n, buf))
}

fn write_task(file: &FileChannel, buf: Vec<u8>, position: u64) -> Result<Transfer> {
    let n = file.write_at(&buf, position)?;
    Ok((n, buf))
}

impl fmt::Debug for AsyncFileChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFileChannel")
            .field("file", &self.shared.file)
            .field("group", &self.shared.group.id())
            .finish()
    }
}
