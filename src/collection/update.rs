//! The batched commit protocol.
//!
//! A commit runs in phases, all under the exclusive meta lock:
//!
//! 1. Sort the batch keys and find each key's predecessor with one
//!    merge-style walk; pin the distinct predecessors (exclusive record
//!    locks, eviction suppressed).
//! 2. Build one in-memory buffer of new records, splicing `next` pointers
//!    through memory only.
//! 3. Append the buffer and a sentinel, fsync. The offset just past the
//!    sentinel is the new commit version.
//! 4. Stamp tombstones (in memory) for deleted and overwritten records.
//! 5. Log every changed record header plus the new file header as one WAL
//!    entry, fsync. This is the commit point.
//! 6. Apply the logged patches to the data file in place, fsync.
//! 7. Unpin, re-enable eviction.
//!
//! A failure before phase 3 leaves the collection healthy. From phase 3 on,
//! any failure poisons the handle: the in-memory view may be stale, but the
//! files are recoverable, either by trimming the unlogged tail or by
//! replaying the logged entry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use super::{io, Collection};
use crate::batch::WriteBatch;
use crate::cache::{Record, RecordCache};
use crate::error::{Error, Result};
use crate::format::{FileHeader, Sentinel, SENTINEL_SIZE};
use crate::wal::WalEntry;

#[cfg(test)]
use std::sync::atomic::Ordering;

/// Clears `prevent_purge` and evicts down to capacity on the way out of a
/// commit, error paths included.
struct PurgeGuard<'a>(&'a RecordCache);

impl Drop for PurgeGuard<'_> {
    fn drop(&mut self) {
        self.0.set_prevent_purge(false);
        self.0.purge();
    }
}

fn encode_record(rec: &Record, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&rec.header().encode());
    buf.extend_from_slice(&rec.key);
    buf.extend_from_slice(&rec.value);
}

impl Collection {
    /// Atomically and durably applies `batch`. Returns the new version.
    ///
    /// Either every staged operation is applied or, after a crash and
    /// reopen, none of them are.
    pub fn update(&self, batch: WriteBatch) -> Result<i64> {
        self.check_healthy()?;
        let mut meta = self.meta.write()?;

        for (key, value) in &batch.sets {
            if key.len() > u16::MAX as usize {
                return Err(Error::InvalidInput(format!(
                    "key length {} exceeds {}",
                    key.len(),
                    u16::MAX
                )));
            }
            if value.len() > u32::MAX as usize {
                return Err(Error::InvalidInput(format!(
                    "value length {} exceeds {}",
                    value.len(),
                    u32::MAX
                )));
            }
        }

        // Phase 1: one merge-style walk over the sorted key union finds
        // every predecessor.
        let keys = batch.merged_keys();
        let mut last_leq: HashMap<Vec<u8>, i64> = HashMap::with_capacity(keys.len());
        let mut to_pin: BTreeSet<i64> = BTreeSet::new();
        let mut starting_offset = 0;
        for key in &keys {
            let offset = self.find_last_less_than_or_equal(key, starting_offset, meta.head)?;
            if offset > 0 {
                to_pin.insert(offset);
                starting_offset = offset;
            }
            last_leq.insert(key.clone(), offset);
        }

        self.cache.set_prevent_purge(true);
        let _purge_guard = PurgeGuard(&self.cache);

        let mut pinned = Vec::with_capacity(to_pin.len());
        for &offset in &to_pin {
            let rec = self.read_record(offset)?;
            self.cache.force_push(&rec);
            pinned.push(rec);
        }
        let _locks: Vec<_> = pinned
            .iter()
            .map(|rec| rec.lock.write())
            .collect::<std::result::Result<_, _>>()?;

        // Phases 2-6 mutate the file; any failure there invalidates the
        // in-memory view.
        match self.commit(&mut meta, &batch, &keys, &last_leq) {
            Ok(version) => Ok(version),
            Err(err) => {
                self.poison();
                Err(err)
            }
        }
    }

    fn commit(
        &self,
        meta: &mut FileHeader,
        batch: &WriteBatch,
        keys: &[Vec<u8>],
        last_leq: &HashMap<Vec<u8>, i64>,
    ) -> Result<i64> {
        let mut wal_entry = WalEntry::new();
        let mut overwritten: Vec<i64> = Vec::new();
        let mut newly_inserted: BTreeMap<Vec<u8>, i64> = BTreeMap::new();
        let mut append_buf: Vec<u8> = Vec::new();
        let tail = self.file_len()?;

        // Phase 2: emit new records into the append buffer.
        for key in keys {
            let Some(value) = batch.sets.get(key) else {
                // Delete keys are handled after the sentinel is placed.
                continue;
            };

            let mut offset = last_leq[key];
            if offset == 0 {
                // No on-disk predecessor; an earlier insert from this very
                // batch may still precede the key.
                if let Some((_, &off)) = newly_inserted
                    .range::<[u8], _>((Bound::Unbounded, Bound::Included(key.as_slice())))
                    .next_back()
                {
                    offset = off;
                }
            }

            if offset == 0 {
                // New head.
                let new_offset = tail + append_buf.len() as i64;
                let rec = Arc::new(Record::new(
                    new_offset,
                    key.clone(),
                    value.clone(),
                    meta.head,
                    0,
                ));
                encode_record(&rec, &mut append_buf);
                meta.head = new_offset;
                self.cache.force_push(&rec);
                newly_inserted.insert(key.clone(), new_offset);
                continue;
            }

            let mut prev = self.read_record(offset)?;
            // An insert from this batch may sit between the on-disk
            // predecessor and the key; the largest such key wins.
            if let Some((_, &off)) = newly_inserted
                .range::<[u8], _>((
                    Bound::Included(prev.key.as_slice()),
                    Bound::Included(key.as_slice()),
                ))
                .next_back()
            {
                if off != prev.offset {
                    prev = self.read_record(off)?;
                }
            }

            let new_offset = tail + append_buf.len() as i64;
            let rec = Arc::new(Record::new(
                new_offset,
                key.clone(),
                value.clone(),
                prev.next(),
                0,
            ));
            encode_record(&rec, &mut append_buf);
            newly_inserted.insert(key.clone(), new_offset);
            self.cache.force_push(&rec);

            prev.set_next(new_offset);
            wal_entry.push(prev.offset, prev.header_bytes());
            if prev.key == *key {
                overwritten.push(prev.offset);
            }
            self.cache.force_push(&prev);
        }

        // Phase 3: append records and the commit sentinel, then fsync.
        io::write_all_at(&self.file, &append_buf, tail as u64)?;
        let sentinel_offset = tail + append_buf.len() as i64;
        let sentinel = Sentinel {
            offset: sentinel_offset,
        };
        io::write_all_at(&self.file, &sentinel.encode(), sentinel_offset as u64)?;
        let commit_offset = sentinel_offset + SENTINEL_SIZE as i64;
        self.file.sync_all()?;

        #[cfg(test)]
        if self.failpoint.load(Ordering::SeqCst) == super::FAILPOINT_AFTER_APPEND {
            return Err(Error::Io("injected crash after append".to_string()));
        }

        // Phase 4: stamp tombstones in memory.
        for key in &batch.deletes {
            let offset = last_leq[key];
            if offset == 0 {
                continue;
            }
            let rec = self.read_record(offset)?;
            // The predecessor only matches exactly if the key exists; a
            // delete of an absent key is a no-op.
            if rec.key == *key && rec.deleted() == 0 {
                rec.set_deleted(commit_offset);
                wal_entry.push(rec.offset, rec.header_bytes());
            }
        }
        for &offset in &overwritten {
            let rec = self.read_record(offset)?;
            rec.set_deleted(commit_offset);
            wal_entry.push(rec.offset, rec.header_bytes());
        }

        // Phase 5: one WAL entry carries every changed header plus the new
        // file header. Its fsync is the commit point.
        meta.last_commit = commit_offset;
        wal_entry.push(0, meta.encode().to_vec());
        self.wal.lock()?.append(&wal_entry)?;

        #[cfg(test)]
        if self.failpoint.load(Ordering::SeqCst) == super::FAILPOINT_AFTER_WAL_APPEND {
            return Err(Error::Io("injected crash after log append".to_string()));
        }

        // Phase 6: apply the logged patches in place.
        for rec in &wal_entry.records {
            io::write_all_at(&self.file, &rec.data, rec.offset as u64)?;
        }
        self.stats.inc_records_written(newly_inserted.len() as u64);
        self.file.sync_all()?;

        tracing::debug!(
            version = commit_offset,
            appended = newly_inserted.len(),
            patches = wal_entry.records.len(),
            "commit applied"
        );
        Ok(commit_offset)
    }
}
