//! File operations completing on a group.

use chanio_channels::{AsyncFileChannel, FileChannel, FileLockTable, LibcOps};
use chanio_core::{ChannelError, FileOptions, Result};
use chanio_runtime::{ChannelGroup, GroupConfig};

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn read_write() -> FileOptions {
    FileOptions::new().read(true).write(true)
}

#[test]
fn test_positional_read_write() {
    let g = ChannelGroup::new(GroupConfig::fixed(2).name("afile-rw")).unwrap();
    let file = tempfile::NamedTempFile::new().unwrap();
    let ch = AsyncFileChannel::open(file.path(), read_write(), &g).unwrap();

    let (n, _) = ch
        .write(b"0123456789".to_vec(), 0)
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert_eq!(n, 10);
    assert_eq!(ch.size().unwrap(), 10);

    let (n, buf) = ch.read(vec![0u8; 4], 3).unwrap().wait_timeout(WAIT).unwrap();
    assert_eq!(&buf[..n], b"3456");

    let (n, _) = ch.read(vec![0u8; 4], 10).unwrap().wait_timeout(WAIT).unwrap();
    assert_eq!(n, 0);

    let (tx, rx) = mpsc::channel();
    ch.write_with(b"ab".to_vec(), 20, tx, |res: Result<_>, tx| {
        tx.send(res.map(|(n, _)| n)).unwrap();
    })
    .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(2));
    assert_eq!(ch.size().unwrap(), 22);

    ch.truncate(5).unwrap();
    assert_eq!(ch.size().unwrap(), 5);
    ch.force(false).unwrap();
    ch.close().unwrap();
    g.shutdown_now().unwrap();
}

#[test]
fn test_lock_on_group_thread() {
    let g = ChannelGroup::new(GroupConfig::fixed(1).name("afile-lock")).unwrap();
    let file = tempfile::NamedTempFile::new().unwrap();
    let table = Arc::new(FileLockTable::new());
    let ch = AsyncFileChannel::open_with(
        LibcOps::shared(),
        table.clone(),
        file.path(),
        read_write(),
        &g,
    )
    .unwrap();
    let other =
        FileChannel::open_with(LibcOps::shared(), table.clone(), file.path(), read_write()).unwrap();

    let lock = ch.lock(0, 100, false).unwrap().wait_timeout(WAIT).unwrap();
    assert!(lock.is_valid());
    assert_eq!((lock.position(), lock.size()), (0, 100));
    assert_eq!(other.try_lock(50, 10, false).err(), Some(ChannelError::OverlappingLock));

    ch.close().unwrap();
    assert!(!lock.is_valid());
    assert!(other.try_lock(50, 10, false).unwrap().is_some());
    g.shutdown_now().unwrap();
}

#[test]
fn test_closed_channel_fails_operations() {
    let g = ChannelGroup::new(GroupConfig::fixed(1).name("afile-closed")).unwrap();
    let file = tempfile::NamedTempFile::new().unwrap();
    let ch = AsyncFileChannel::open(file.path(), read_write(), &g).unwrap();
    ch.close().unwrap();
    assert!(!ch.is_open());
    let read = ch.read(vec![0u8; 4], 0).unwrap();
    assert_eq!(read.wait_timeout(WAIT).err(), Some(ChannelError::Closed));
    g.shutdown_now().unwrap();
}

#[test]
fn test_read_only_file_refuses_exclusive_lock() {
    let g = ChannelGroup::new(GroupConfig::fixed(1).name("afile-ro")).unwrap();
    let file = tempfile::NamedTempFile::new().unwrap();
    let ch = AsyncFileChannel::open(file.path(), FileOptions::new().read(true), &g).unwrap();
    let lock = ch.lock(0, 10, false).unwrap();
    assert_eq!(lock.wait_timeout(WAIT).err(), Some(ChannelError::NonWritable));
    g.shutdown_now().unwrap();
}
