//! Open-time recovery.
//!
//! A crashed commit leaves the data file in one of two shapes. If the crash
//! hit before the log append, the appended records and sentinel past
//! `last_commit` are garbage and are trimmed off. If it hit after, the log
//! holds the full patch set and replaying it (again) lands the commit.
//! Replay is idempotent: the patches are plain byte writes at fixed
//! offsets, so applying a committed entry twice yields the same bytes.

use super::{io, Collection};
use crate::error::Result;
use crate::format::{FileHeader, Sentinel, FILE_HEADER_SIZE, SENTINEL_SIZE};

pub(super) fn recover(collection: &Collection) -> Result<()> {
    let mut meta = collection.meta.write()?;
    *meta = read_header(collection)?;

    let mut wal = collection.wal.lock()?;
    match wal.read_last_entry() {
        Err(err) => {
            tracing::debug!(%err, "no replayable log entry");
            wal.truncate()?;
        }
        Ok(entry) => {
            for rec in &entry.records {
                io::write_all_at(&collection.file, &rec.data, rec.offset as u64)?;
            }
            // The entry's final record patches the file header, so re-read
            // it before trusting head or last_commit.
            *meta = read_header(collection)?;
            tracing::info!(
                patches = entry.records.len(),
                version = meta.last_commit,
                "replayed last log entry"
            );
        }
    }

    // Discard any appended records whose commit never reached the log.
    collection.file.set_len(meta.last_commit as u64)?;

    // The committed region must end in a sentinel.
    if meta.last_commit > FILE_HEADER_SIZE as i64 {
        let mut buf = [0u8; SENTINEL_SIZE];
        io::read_exact_at(
            &collection.file,
            &mut buf,
            (meta.last_commit - SENTINEL_SIZE as i64) as u64,
        )?;
        Sentinel::decode(&buf)?;
    }

    collection.file.sync_all()?;
    wal.sync()?;
    drop(wal);
    drop(meta);

    warm_cache(collection);
    Ok(())
}

fn read_header(collection: &Collection) -> Result<FileHeader> {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    io::read_exact_at(&collection.file, &mut buf, 0)?;
    FileHeader::decode(&buf)
}

/// Reloads persisted cache offsets. Offsets that no longer resolve stop the
/// warm-up and are dropped from the side-car; a cold cache is never an
/// error.
fn warm_cache(collection: &Collection) {
    let offsets = collection.cache.saved_offsets();
    if offsets.is_empty() {
        return;
    }
    let mut loaded = 0;
    for &offset in &offsets {
        // read_record pushes each hit into the cache.
        if collection.read_record(offset).is_err() {
            break;
        }
        loaded += 1;
    }
    if loaded < offsets.len() {
        collection.cache.truncate_saved(loaded);
    }
    tracing::debug!(loaded, total = offsets.len(), "warmed record cache");
}
