//! Snapshot traversal of a collection.
//!
//! A cursor captures the head offset and commit version once, under the
//! shared meta lock, and then walks `next` links without further
//! coordination with the writer: link loads are atomic, records never move,
//! and tombstones are filtered against the captured version. A commit that
//! lands mid-iteration is invisible, because its records sit at offsets at
//! or past the snapshot version.

use std::sync::Arc;

use crate::cache::Record;
use crate::collection::{visible, Collection};
use crate::error::Result;

/// An iterator over the records of a [`Collection`] at a fixed version.
pub struct Cursor<'c> {
    collection: &'c Collection,
    current: Option<Arc<Record>>,
    first: bool,
    snapshot: i64,
}

impl Collection {
    /// Opens a cursor positioned at the head, pinned to the current
    /// version.
    pub fn cursor(&self) -> Result<Cursor<'_>> {
        self.check_healthy()?;
        let (head, snapshot) = {
            let meta = self.meta.read()?;
            (meta.head, meta.last_commit)
        };
        let current = if head == 0 {
            None
        } else {
            Some(self.read_record(head)?)
        };
        Ok(Cursor {
            collection: self,
            current,
            first: true,
            snapshot,
        })
    }
}

impl Cursor<'_> {
    /// The version this cursor reads at.
    pub fn version(&self) -> i64 {
        self.snapshot
    }

    /// Advances to the next visible record and returns its key and value,
    /// or `None` once the list is exhausted.
    pub fn next(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        loop {
            if self.first {
                self.first = false;
            } else {
                let next = match &self.current {
                    Some(rec) => self.collection.next_record(rec)?,
                    None => None,
                };
                self.current = next;
            }

            match &self.current {
                None => return Ok(None),
                Some(rec) => {
                    if visible(rec, self.snapshot) {
                        break;
                    }
                }
            }
        }

        match self.current.as_ref() {
            Some(rec) => Ok(Some((rec.key.as_slice(), rec.value.as_slice()))),
            None => Ok(None),
        }
    }

    /// Repositions at the last record with key <= `key`, or at the head if
    /// every key is greater. The following [`Cursor::next`] yields that
    /// record (if visible); callers scanning a range skip keys below their
    /// bound.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        let head = { self.collection.meta.read()?.head };
        let offset = self
            .collection
            .find_last_less_than_or_equal(key, 0, head)?;

        self.current = if offset != 0 {
            Some(self.collection.read_record(offset)?)
        } else if head != 0 {
            Some(self.collection.read_record(head)?)
        } else {
            None
        };
        self.first = true;
        Ok(())
    }
}
