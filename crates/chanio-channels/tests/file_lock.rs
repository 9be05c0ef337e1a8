//! Overlapping byte-range locks within one process are refused.

use chanio_channels::{FileChannel, FileLockTable, LibcOps, WHOLE_FILE};
use chanio_core::{ChannelError, FileOptions};

use std::sync::Arc;
use std::thread;

fn open(table: &Arc<FileLockTable>, path: &std::path::Path) -> FileChannel {
    let options = FileOptions::new().read(true).write(true);
    FileChannel::open_with(LibcOps::shared(), table.clone(), path, options).unwrap()
}

#[test]
fn test_overlap_rejected_in_either_order() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let table = Arc::new(FileLockTable::new());
    let a = open(&table, file.path());
    let b = open(&table, file.path());

    let first = a.lock(0, 10, false).unwrap();
    assert_eq!(b.lock(5, 10, false).err(), Some(ChannelError::OverlappingLock));
    let adjacent = b.lock(10, 10, false).unwrap();
    drop(first);
    drop(adjacent);

    let first = b.lock(5, 10, false).unwrap();
    assert_eq!(a.lock(0, 10, false).err(), Some(ChannelError::OverlappingLock));
    first.release().unwrap();
    assert!(a.lock(0, 10, false).is_ok());
}

#[test]
fn test_same_channel_cannot_overlap_itself() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let table = Arc::new(FileLockTable::new());
    let ch = open(&table, file.path());
    let _all = ch.lock(0, WHOLE_FILE, true).unwrap();
    assert_eq!(
        ch.try_lock(1 << 40, 1, true).err(),
        Some(ChannelError::OverlappingLock)
    );
}

#[test]
fn test_racing_lockers_get_one_winner() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let table = Arc::new(FileLockTable::new());
    let channels: Vec<Arc<FileChannel>> = (0..4)
        .map(|_| Arc::new(open(&table, file.path())))
        .collect();

    let handles: Vec<_> = channels
        .iter()
        .cloned()
        .map(|ch| thread::spawn(move || ch.try_lock(0, 100, false)))
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = outcomes.iter().filter(|o| matches!(o, Ok(Some(_)))).count();
    let refused = outcomes
        .iter()
        .filter(|o| matches!(o, Err(ChannelError::OverlappingLock)))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(refused, 3);
    assert_eq!(table.lock_count(channels[0].file_key()), 1);

    // Closing the channels releases whatever the winner still holds.
    for ch in &channels {
        ch.close().unwrap();
    }
    assert_eq!(table.file_count(), 0);
    for outcome in outcomes {
        if let Ok(Some(lock)) = outcome {
            assert!(!lock.is_valid());
        }
    }
}
