//! Process-wide registry of byte-range locks
//!
//! The OS does not refuse overlapping locks taken by the same process
//! (POSIX record locks merge, OFD locks on one description merge), so
//! overlap is checked here before a request reaches the OS.
//!
//! The table maps a file identity to the list of locks held on it.
//! Lookups share the map's read lock; each identity's list has its own
//! mutex, so requests on different files never contend. The list holds
//! records weakly: a record dropped without being removed queues its
//! identity for reclamation, drained at the start of every `add`.
//!
//! Lock order: an identity's list mutex may be held while taking the
//! map lock, never the other way round.

use chanio_core::{ChannelError, FileKey, Result};

use crossbeam_queue::SegQueue;
use log::trace;
use parking_lot::{Mutex, RwLock};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

type LockList = Arc<Mutex<Vec<Weak<LockRecord>>>>;

/// One lock request as the table sees it
#[derive(Debug)]
pub struct LockRecord {
    key: FileKey,
    position: u64,
    size: u64,
    shared: bool,
    channel_id: u64,
    valid: AtomicBool,
    registered: AtomicBool,
    reclaim: Arc<SegQueue<FileKey>>,
}

impl LockRecord {
    #[inline]
    pub fn key(&self) -> FileKey {
        self.key
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    #[inline]
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark invalid; true only for the call that flipped it.
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// Whether `[position, position + size)` intersects this range.
    pub fn overlaps(&self, position: u64, size: u64) -> bool {
        if position.saturating_add(size) <= self.position {
            return false;
        }
        if self.position.saturating_add(self.size) <= position {
            return false;
        }
        true
    }
}

impl Drop for LockRecord {
    fn drop(&mut self) {
        if *self.registered.get_mut() {
            self.reclaim.push(self.key);
        }
    }
}

/// Registry of the process's byte-range locks, keyed by file identity
#[derive(Debug, Default)]
pub struct FileLockTable {
    map: RwLock<HashMap<FileKey, LockList>>,
    reclaim: Arc<SegQueue<FileKey>>,
}

impl FileLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table shared by every channel that is not given its own
    pub fn shared() -> Arc<FileLockTable> {
        static SHARED: OnceLock<Arc<FileLockTable>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(FileLockTable::new())).clone()
    }

    /// Build a record owned by channel `channel_id`; not yet registered.
    pub fn new_record(
        &self,
        key: FileKey,
        position: u64,
        size: u64,
        shared: bool,
        channel_id: u64,
    ) -> Arc<LockRecord> {
        Arc::new(LockRecord {
            key,
            position,
            size,
            shared,
            channel_id,
            valid: AtomicBool::new(true),
            registered: AtomicBool::new(false),
            reclaim: self.reclaim.clone(),
        })
    }

    fn list_for(&self, key: FileKey) -> LockList {
        if let Some(list) = self.map.read().get(&key) {
            return list.clone();
        }
        self.map.write().entry(key).or_default().clone()
    }

    /// Whether `list` is still the table's list for `key`.
    fn is_current(&self, key: FileKey, list: &LockList) -> bool {
        self.map
            .read()
            .get(&key)
            .map_or(false, |current| Arc::ptr_eq(current, list))
    }

    fn drop_if_empty(&self, key: FileKey, list: &LockList, entries: &[Weak<LockRecord>]) {
        if !entries.is_empty() {
            return;
        }
        let mut map = self.map.write();
        if map.get(&key).map_or(false, |current| Arc::ptr_eq(current, list)) {
            map.remove(&key);
        }
    }

    /// Register `record`, or fail with `OverlappingLock` if a valid lock
    /// on the same file overlaps its range.
    pub fn add(&self, record: &Arc<LockRecord>) -> Result<()> {
        self.reclaim_stale();
        loop {
            let list = self.list_for(record.key);
            let mut entries = list.lock();
            // Emptied and removed between lookup and lock: fetch again.
            if !self.is_current(record.key, &list) {
                continue;
            }
            entries.retain(|w| w.strong_count() > 0);
            let overlapping = entries
                .iter()
                .filter_map(Weak::upgrade)
                .any(|other| other.is_valid() && other.overlaps(record.position, record.size));
            if overlapping {
                self.drop_if_empty(record.key, &list, &entries);
                return Err(ChannelError::OverlappingLock);
            }
            entries.push(Arc::downgrade(record));
            record.registered.store(true, Ordering::Release);
            return Ok(());
        }
    }

    /// Unregister `record`; the file's entry goes once its list is empty.
    pub fn remove(&self, record: &Arc<LockRecord>) {
        let Some(list) = self.map.read().get(&record.key).cloned() else {
            return;
        };
        let mut entries = list.lock();
        entries.retain(|w| match w.upgrade() {
            Some(other) => !Arc::ptr_eq(&other, record),
            None => false,
        });
        record.registered.store(false, Ordering::Release);
        self.drop_if_empty(record.key, &list, &entries);
    }

    /// Unregister and return every lock channel `channel_id` holds on `key`.
    pub fn remove_all(&self, key: FileKey, channel_id: u64) -> Vec<Arc<LockRecord>> {
        let Some(list) = self.map.read().get(&key).cloned() else {
            return Vec::new();
        };
        let mut entries = list.lock();
        let mut removed = Vec::new();
        entries.retain(|w| match w.upgrade() {
            Some(other) if other.channel_id == channel_id => {
                other.registered.store(false, Ordering::Release);
                removed.push(other);
                false
            }
            Some(_) => true,
            None => false,
        });
        self.drop_if_empty(key, &list, &entries);
        removed
    }

    /// Purge entries of records dropped while still registered.
    fn reclaim_stale(&self) {
        while let Some(key) = self.reclaim.pop() {
            let Some(list) = self.map.read().get(&key).cloned() else {
                continue;
            };
            let mut entries = list.lock();
            entries.retain(|w| w.strong_count() > 0);
            trace!("reclaimed stale locks on {:?}, {} left", key, entries.len());
            self.drop_if_empty(key, &list, &entries);
        }
    }

    /// Files with at least one registered lock
    pub fn file_count(&self) -> usize {
        self.map.read().len()
    }

    /// Registered, still referenced locks on `key`
    pub fn lock_count(&self, key: FileKey) -> usize {
        self.map
            .read()
            .get(&key)
            .map_or(0, |list| list.lock().iter().filter(|w| w.strong_count() > 0).count())
    }
}
