//! Bounded in-memory cache of records, keyed by file offset.
//!
//! The cache exists to cut down predecessor searches: `find_last_less_than`
//! returns an offset to start the on-disk walk from instead of walking the
//! whole list from the head. One distinguished slot always holds the record
//! with the largest known key, since appends near the tail are the common
//! case. The bounded map behind it is only an auxiliary hint: admission is
//! randomized at 1% once full, and eviction picks arbitrary victims while
//! protecting the max-key slot. Hints are advisory; callers confirm the
//! real predecessor by walking `next` links on disk.
//!
//! The cache also owns a side-car file holding the cached offsets as plain
//! little-endian i64s, so a reopened collection starts warm. The side-car
//! is best-effort: a read error truncates it and the collection proceeds
//! cold.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;

use crate::error::Result;
use crate::format::RecordHeader;

/// Admission probability for the bounded map once it is at capacity.
const ADMIT_PROBABILITY: f32 = 0.01;

/// One record materialized from the data file.
///
/// `next` and `deleted` mirror the in-place-patchable header fields and are
/// atomics so readers traversing the list never observe a torn update. The
/// per-record lock is write-held by the update engine while the record is
/// pinned, and read-held by the predecessor walk while comparing keys.
#[derive(Debug)]
pub(crate) struct Record {
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    next: AtomicI64,
    deleted: AtomicI64,
    pub lock: RwLock<()>,
}

impl Record {
    pub fn new(offset: i64, key: Vec<u8>, value: Vec<u8>, next: i64, deleted: i64) -> Self {
        Record {
            offset,
            key,
            value,
            next: AtomicI64::new(next),
            deleted: AtomicI64::new(deleted),
            lock: RwLock::new(()),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }

    pub fn set_next(&self, offset: i64) {
        self.next.store(offset, Ordering::SeqCst);
    }

    pub fn deleted(&self) -> i64 {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn set_deleted(&self, version: i64) {
        self.deleted.store(version, Ordering::SeqCst);
    }

    pub fn header(&self) -> RecordHeader {
        RecordHeader {
            next: self.next(),
            deleted: self.deleted(),
            key_len: self.key.len() as u16,
            val_len: self.value.len() as u32,
        }
    }

    pub fn header_bytes(&self) -> Vec<u8> {
        self.header().encode().to_vec()
    }
}

#[derive(Debug)]
struct Inner {
    records: HashMap<i64, Arc<Record>>,
    max_key_record: Option<Arc<Record>>,
    prevent_purge: bool,
    updates_since_save: usize,
    file: File,
}

#[derive(Debug)]
pub(crate) struct RecordCache {
    capacity: usize,
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl RecordCache {
    /// Creates a cache with a fresh (truncated) side-car file.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        Self::open_file(path, capacity, true)
    }

    /// Opens a cache, keeping any persisted offsets for warm-up.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        Self::open_file(path, capacity, false)
    }

    fn open_file<P: AsRef<Path>>(path: P, capacity: usize, truncate: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(truncate)
            .open(&path)?;
        Ok(RecordCache {
            capacity,
            path,
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                max_key_record: None,
                prevent_purge: false,
                updates_since_save: 0,
                file,
            }),
        })
    }

    pub fn get(&self, offset: i64) -> Option<Arc<Record>> {
        let inner = self.inner.read().ok()?;
        inner.records.get(&offset).cloned()
    }

    /// Offers a record for admission.
    ///
    /// The max-key slot is always updated; the bounded map admits freely
    /// below capacity and with 1% probability at capacity.
    pub fn push(&self, rec: &Arc<Record>) {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(_) => return,
        };

        if inner
            .max_key_record
            .as_ref()
            .map_or(true, |max| max.key < rec.key)
        {
            inner.max_key_record = Some(Arc::clone(rec));
            return;
        }

        if inner.records.len() == self.capacity
            && rand::thread_rng().gen::<f32>() >= ADMIT_PROBABILITY
        {
            return;
        }

        inner.records.insert(rec.offset, Arc::clone(rec));
        inner.updates_since_save += 1;
        if !inner.prevent_purge {
            self.purge_locked(&mut inner);
        }
    }

    /// Unconditionally inserts, ignoring capacity. Used for records the
    /// update engine is actively modifying.
    pub fn force_push(&self, rec: &Arc<Record>) {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        if inner
            .max_key_record
            .as_ref()
            .map_or(true, |max| max.key < rec.key)
        {
            inner.max_key_record = Some(Arc::clone(rec));
        }
        inner.records.insert(rec.offset, Arc::clone(rec));
    }

    /// Returns the offset of the cached record with the largest key
    /// strictly less than `key`, or 0 if none. Advisory only.
    pub fn find_last_less_than(&self, key: &[u8]) -> i64 {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return 0,
        };

        if let Some(max) = &inner.max_key_record {
            if max.key.as_slice() < key {
                return max.offset;
            }
        }

        let mut best: Option<&Arc<Record>> = None;
        for rec in inner.records.values() {
            if rec.key.as_slice() >= key {
                continue;
            }
            if best.map_or(true, |b| rec.key > b.key) {
                best = Some(rec);
            }
        }
        best.map_or(0, |rec| rec.offset)
    }

    /// Suppresses (or re-enables) eviction across a critical section.
    pub fn set_prevent_purge(&self, prevent: bool) {
        if let Ok(mut inner) = self.inner.write() {
            inner.prevent_purge = prevent;
        }
    }

    /// Evicts down to capacity and persists the offset set if due.
    pub fn purge(&self) {
        if let Ok(mut inner) = self.inner.write() {
            self.purge_locked(&mut inner);
        }
    }

    fn purge_locked(&self, inner: &mut Inner) {
        while inner.records.len() > self.capacity {
            let protected = inner.max_key_record.as_ref().map_or(0, |max| max.offset);
            let victim = inner
                .records
                .keys()
                .find(|&&offset| offset != protected)
                .copied();
            match victim {
                Some(offset) => inner.records.remove(&offset),
                None => break,
            };
        }
        if inner.updates_since_save > 4 * self.capacity {
            self.save_locked(inner);
        }
    }

    /// Rewrites the side-car offset file. Best-effort: failures leave the
    /// cache fully functional, so errors are only logged.
    fn save_locked(&self, inner: &mut Inner) {
        let mut buf = Vec::with_capacity(inner.records.len() * 8);
        for offset in inner.records.keys() {
            buf.write_i64::<LittleEndian>(*offset).unwrap();
        }

        let result = inner
            .file
            .set_len(0)
            .and_then(|_| inner.file.seek(SeekFrom::Start(0)))
            .and_then(|_| inner.file.write_all(&buf))
            .and_then(|_| inner.file.sync_all());
        if let Err(err) = result {
            tracing::debug!(path = %self.path.display(), %err, "failed to persist cache offsets");
            return;
        }
        inner.updates_since_save = 0;
    }

    /// Reads back the persisted offset list, discarding a trailing partial
    /// entry. A read error truncates the side-car and yields an empty list;
    /// the cache is never a reason to fail an open.
    pub fn saved_offsets(&self) -> Vec<i64> {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(_) => return Vec::new(),
        };

        let mut buf = Vec::new();
        if inner.file.seek(SeekFrom::Start(0)).is_err() || inner.file.read_to_end(&mut buf).is_err()
        {
            tracing::warn!(path = %self.path.display(), "unreadable cache file, starting cold");
            let _ = inner.file.set_len(0);
            return Vec::new();
        }

        let whole = buf.len() - buf.len() % 8;
        if whole != buf.len() {
            let _ = inner.file.set_len(whole as u64);
        }

        let mut offsets = Vec::with_capacity(whole / 8);
        let mut reader = &buf[..whole];
        while let Ok(offset) = reader.read_i64::<LittleEndian>() {
            offsets.push(offset);
        }
        offsets
    }

    /// Truncates the side-car to its first `count` offsets, dropping
    /// entries that no longer resolve to valid records.
    pub fn truncate_saved(&self, count: usize) {
        if let Ok(inner) = self.inner.write() {
            let _ = inner.file.set_len(count as u64 * 8);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.records.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn max_key_offset(&self) -> i64 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.max_key_record.as_ref().map(|max| max.offset))
            .unwrap_or(0)
    }

    /// Removes the side-car file. The handle is dropped with `self`.
    pub fn destroy(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(offset: i64, key: &str) -> Arc<Record> {
        Arc::new(Record::new(
            offset,
            key.as_bytes().to_vec(),
            b"v".to_vec(),
            0,
            0,
        ))
    }

    fn temp_cache(capacity: usize) -> (tempfile::TempDir, RecordCache) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cache =
            RecordCache::create(dir.path().join("test.cache"), capacity).expect("Failed to create");
        (dir, cache)
    }

    #[test]
    fn test_max_key_fast_path() {
        let (_dir, cache) = temp_cache(2);

        cache.push(&rec(16, "a"));
        cache.push(&rec(48, "b"));
        cache.push(&rec(80, "c"));

        // Ascending pushes keep replacing the max-key slot; the bounded
        // map never fills.
        assert_eq!(cache.max_key_offset(), 80);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.find_last_less_than(b"zzz"), 80);
    }

    #[test]
    fn test_find_last_less_than_scans_map() {
        let (_dir, cache) = temp_cache(8);

        cache.push(&rec(200, "m")); // becomes the max-key record
        cache.push(&rec(16, "a"));
        cache.push(&rec(48, "d"));
        cache.push(&rec(80, "g"));

        assert_eq!(cache.find_last_less_than(b"e"), 48);
        assert_eq!(cache.find_last_less_than(b"a"), 0);
        assert_eq!(cache.find_last_less_than(b"z"), 200);
    }

    #[test]
    fn test_admission_is_rare_at_capacity() {
        let (_dir, cache) = temp_cache(1);

        cache.push(&rec(500, "z")); // max-key slot
        cache.push(&rec(16, "a")); // fills the map
        assert_eq!(cache.len(), 1);

        // At capacity, admission happens with ~1% probability, and a purge
        // follows any admission, so the map never exceeds capacity.
        for i in 0..100 {
            cache.push(&rec(1000 + i, "b"));
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_force_push_ignores_capacity() {
        let (_dir, cache) = temp_cache(1);

        cache.force_push(&rec(16, "a"));
        cache.force_push(&rec(48, "b"));
        cache.force_push(&rec(80, "c"));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.max_key_offset(), 80);

        // The next purge brings the map back within bounds while keeping
        // the max-key record.
        cache.purge();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.max_key_offset(), 80);
    }

    #[test]
    fn test_prevent_purge_suspends_eviction() {
        let (_dir, cache) = temp_cache(1);
        cache.set_prevent_purge(true);

        cache.push(&rec(500, "z"));
        cache.force_push(&rec(16, "a"));
        cache.force_push(&rec(48, "b"));
        assert_eq!(cache.len(), 2);

        cache.set_prevent_purge(false);
        cache.purge();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_returns_cached_record() {
        let (_dir, cache) = temp_cache(4);
        let record = rec(16, "a");
        cache.force_push(&record);

        let found = cache.get(16).expect("record should be cached");
        assert_eq!(found.key, b"a");
        assert!(cache.get(999).is_none());
    }

    #[test]
    fn test_saved_offsets_roundtrip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.cache");

        {
            let cache = RecordCache::create(&path, 2).expect("Failed to create");
            cache.force_push(&rec(16, "a"));
            cache.force_push(&rec(48, "b"));
            let mut inner = cache.inner.write().unwrap();
            // Force a save regardless of the admission counter.
            cache.save_locked(&mut inner);
        }

        let cache = RecordCache::open(&path, 2).expect("Failed to open");
        let mut offsets = cache.saved_offsets();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![16, 48]);
    }

    #[test]
    fn test_partial_sidecar_is_truncated() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.cache");

        let mut bytes = Vec::new();
        bytes.write_i64::<LittleEndian>(16).unwrap();
        bytes.write_i64::<LittleEndian>(48).unwrap();
        bytes.extend_from_slice(&[1, 2, 3]); // torn trailing entry
        fs::write(&path, &bytes).expect("Failed to seed cache file");

        let cache = RecordCache::open(&path, 2).expect("Failed to open");
        let offsets = cache.saved_offsets();
        assert_eq!(offsets, vec![16, 48]);
        assert_eq!(fs::metadata(&path).unwrap().len(), 16);
    }

    #[test]
    fn test_truncate_saved() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.cache");

        let mut bytes = Vec::new();
        for offset in [16i64, 48, 80] {
            bytes.write_i64::<LittleEndian>(offset).unwrap();
        }
        fs::write(&path, &bytes).expect("Failed to seed cache file");

        let cache = RecordCache::open(&path, 2).expect("Failed to open");
        cache.truncate_saved(1);
        assert_eq!(fs::metadata(&path).unwrap().len(), 8);
    }

    #[test]
    fn test_destroy_removes_sidecar() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.cache");
        let cache = RecordCache::create(&path, 2).expect("Failed to create");
        assert!(path.exists());

        cache.destroy().expect("Failed to destroy");
        assert!(!path.exists());
    }
}
