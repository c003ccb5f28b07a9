//! The collection: an ordered map of byte keys to byte values, persisted as
//! an on-disk singly-linked list sorted by key.
//!
//! Three files back a collection:
//!
//! ```text
//! <name>        data file: 16-byte header, then records and sentinels
//! <name>.wal    write-ahead log of byte patches (crash atomicity)
//! <name>.cache  persisted record-cache offsets (warm restarts)
//! ```
//!
//! Records never move once appended. Inserts go at the file tail and splice
//! in by patching the predecessor's `next`; deletes and overwrites stamp a
//! tombstone version into the victim's `deleted` field. The list is never
//! relinked around tombstones, so an offset held across commits always
//! resolves to the same record, at the cost of monotonic file growth.
//!
//! One writer, many readers: [`Collection::update`] holds the meta lock
//! exclusively for the whole commit, while readers walk `next` links with
//! atomic loads and filter tombstones against their snapshot version.

pub(crate) mod io;
mod recovery;
mod update;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::cache::{Record, RecordCache};
use crate::error::{Error, Result};
use crate::flock;
use crate::format::{FileHeader, RecordHeader, FILE_HEADER_SIZE, RECORD_HEADER_SIZE};
use crate::options::Options;
use crate::stats::{Stats, StatsCollector};
use crate::wal::Wal;

const HEALTHY: u32 = 0;
const POISONED: u32 = 1;

#[cfg(test)]
pub(crate) const FAILPOINT_AFTER_APPEND: u32 = 1;
#[cfg(test)]
pub(crate) const FAILPOINT_AFTER_WAL_APPEND: u32 = 2;

/// An ordered key-value collection.
pub struct Collection {
    pub(crate) file: File,
    pub(crate) wal: Mutex<Wal>,
    pub(crate) cache: RecordCache,
    pub(crate) stats: StatsCollector,
    /// 0 while healthy, 1 once a commit failed midway. Poisoning is
    /// permanent for this handle; reopening replays the log.
    internal_state: AtomicU32,
    /// The collection-wide lock. Writers hold it exclusively for a whole
    /// commit; readers take it shared just long enough to snapshot the
    /// header.
    pub(crate) meta: RwLock<FileHeader>,
    path: PathBuf,

    #[cfg(test)]
    pub(crate) failpoint: AtomicU32,
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl Collection {
    /// Creates a new collection, truncating any existing files at `path`.
    pub fn create<P: AsRef<Path>>(path: P, options: Options) -> Result<Collection> {
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        flock::lock_exclusive(&file)?;
        file.set_len(0)?;

        let header = FileHeader {
            head: 0,
            last_commit: FILE_HEADER_SIZE as i64,
        };
        io::write_all_at(&file, &header.encode(), 0)?;

        let wal = Wal::create(sidecar_path(&path, ".wal"))?;
        let cache = RecordCache::create(sidecar_path(&path, ".cache"), options.cache_capacity)?;

        Ok(Collection {
            file,
            wal: Mutex::new(wal),
            cache,
            stats: StatsCollector::default(),
            internal_state: AtomicU32::new(HEALTHY),
            meta: RwLock::new(header),
            path,
            #[cfg(test)]
            failpoint: AtomicU32::new(0),
        })
    }

    /// Opens an existing collection and runs crash recovery.
    ///
    /// Returns [`Error::DoesNotExist`] if the data file is absent.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Collection> {
        let path = path.as_ref().to_path_buf();
        let file = match File::options().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::DoesNotExist)
            }
            Err(err) => return Err(err.into()),
        };
        flock::lock_exclusive(&file)?;

        let wal = Wal::open(sidecar_path(&path, ".wal"))?;
        let cache = RecordCache::open(sidecar_path(&path, ".cache"), options.cache_capacity)?;

        let collection = Collection {
            file,
            wal: Mutex::new(wal),
            cache,
            stats: StatsCollector::default(),
            internal_state: AtomicU32::new(HEALTHY),
            meta: RwLock::new(FileHeader::default()),
            path,
            #[cfg(test)]
            failpoint: AtomicU32::new(0),
        };
        recovery::recover(&collection)?;
        Ok(collection)
    }

    /// The last committed version: the file offset just past the most
    /// recent sentinel. Monotonically increasing; usable as a snapshot
    /// marker.
    pub fn version(&self) -> Result<i64> {
        Ok(self.meta.read()?.last_commit)
    }

    /// Looks up `key` at the current version.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_healthy()?;
        let (head, version) = {
            let meta = self.meta.read()?;
            (meta.head, meta.last_commit)
        };

        let offset = self.find_last_less_than_or_equal(key, 0, head)?;
        if offset == 0 {
            return Ok(None);
        }
        let rec = self.read_record(offset)?;
        if rec.key.as_slice() == key && visible(&rec, version) {
            return Ok(Some(rec.value.clone()));
        }
        Ok(None)
    }

    /// Collection statistics.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Closes the collection. Durability already holds after each commit,
    /// so this only releases the files (and the data-file lock).
    pub fn close(self) {}

    /// Closes the collection and removes its three files.
    pub fn destroy(self) -> Result<()> {
        let Collection {
            file,
            wal,
            cache,
            path,
            ..
        } = self;
        drop(file); // releases the data-file lock
        fs::remove_file(&path)?;
        wal.into_inner()?.destroy()?;
        cache.destroy()?;
        Ok(())
    }

    pub(crate) fn check_healthy(&self) -> Result<()> {
        if self.internal_state.load(Ordering::SeqCst) != HEALTHY {
            return Err(Error::Internal);
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        self.internal_state.store(POISONED, Ordering::SeqCst);
    }

    pub(crate) fn file_len(&self) -> Result<i64> {
        Ok(self.file.metadata()?.len() as i64)
    }

    /// Materializes the record at `offset`, via the cache when possible.
    pub(crate) fn read_record(&self, offset: i64) -> Result<Arc<Record>> {
        if offset == 0 {
            return Err(Error::InvalidInput("record offset 0".to_string()));
        }

        if let Some(rec) = self.cache.get(offset) {
            self.stats.inc_records_read(1);
            self.stats.inc_cache_hits(1);
            return Ok(rec);
        }

        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        io::read_exact_at(&self.file, &mut header_buf, offset as u64)?;
        let header = RecordHeader::decode(&header_buf)?;

        let mut key = vec![0u8; header.key_len as usize + header.val_len as usize];
        io::read_exact_at(&self.file, &mut key, offset as u64 + RECORD_HEADER_SIZE as u64)?;
        let value = key.split_off(header.key_len as usize);

        let rec = Arc::new(Record::new(offset, key, value, header.next, header.deleted));
        self.stats.inc_records_read(1);
        self.stats.inc_cache_misses(1);
        self.cache.push(&rec);
        Ok(rec)
    }

    /// The successor of `rec`, or `None` at the tail.
    pub(crate) fn next_record(&self, rec: &Record) -> Result<Option<Arc<Record>>> {
        let next = rec.next();
        if next == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_record(next)?))
    }

    /// Returns the offset of the highest-keyed record with key <= `key`,
    /// or 0 if every record's key is greater (or the collection is empty).
    ///
    /// With `starting_offset == 0` the walk starts from the head, after
    /// consulting the cache for a closer entry point. Callers searching
    /// several sorted keys pass each result as the next `starting_offset`,
    /// turning the batch into a single merge-style walk.
    pub(crate) fn find_last_less_than_or_equal(
        &self,
        key: &[u8],
        starting_offset: i64,
        head: i64,
    ) -> Result<i64> {
        if head == 0 {
            // Empty collection.
            return Ok(0);
        }

        let mut offset = starting_offset;
        let mut rec;
        if offset == 0 {
            rec = self.read_record(head)?;
            if rec.key.as_slice() > key {
                // The key would become the new head.
                return Ok(0);
            }
            let hint = self.cache.find_last_less_than(key);
            if hint != 0 {
                rec = self.read_record(hint)?;
            }
            offset = rec.offset;
        } else {
            rec = self.read_record(offset)?;
        }

        loop {
            self.cache.push(&rec);
            let guard = rec.lock.read()?;
            if rec.key.as_slice() > key {
                break;
            }
            offset = rec.offset;
            let next = self.next_record(&rec)?;
            drop(guard);
            match next {
                Some(next_rec) => rec = next_rec,
                None => break,
            }
        }

        Ok(offset)
    }

    #[cfg(test)]
    pub(crate) fn record_offsets(&self) -> Result<Vec<i64>> {
        let mut offsets = Vec::new();
        let mut offset = self.meta.read()?.head;
        while offset != 0 {
            let rec = self.read_record(offset)?;
            offsets.push(offset);
            offset = rec.next();
        }
        Ok(offsets)
    }
}

/// A record is visible at `version` if it was committed before that version
/// and not tombstoned at or before it.
pub(crate) fn visible(rec: &Record, version: i64) -> bool {
    (rec.deleted() == 0 || rec.deleted() > version) && rec.offset < version
}
