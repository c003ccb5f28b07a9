//! EmberDB is an ordered key-value store persisted to a single append-only
//! data file, with a write-ahead log for crash-atomic batched updates and a
//! persisted record cache for warm restarts.
//!
//! Entries live in an on-disk singly-linked list sorted by key:
//!
//! ```text
//!  header      record "a"     record "c"     record "f"
//! +------+    +-----------+  +-----------+  +-----------+
//! | head-|--->| next -------->| next -------->| next: 0  |
//! | ...  |    | key/value |  | key/value |  | key/value |
//! +------+    +-----------+  +-----------+  +-----------+
//! ```
//!
//! Inserts append records at the file tail and patch the predecessor's
//! link; deletes and overwrites stamp a tombstone version into the old
//! record. Every commit is bracketed by a sentinel and journaled as a set
//! of byte patches, so a crash at any point recovers to a commit boundary.
//!
//! # Example
//!
//! ```no_run
//! use emberdb::{Collection, Options, WriteBatch};
//!
//! # fn main() -> emberdb::Result<()> {
//! let collection = Collection::create("fruit.db", Options::default())?;
//!
//! let mut wb = WriteBatch::new();
//! wb.set("apple", "red");
//! wb.set("banana", "yellow");
//! let version = collection.update(wb)?;
//!
//! assert_eq!(collection.get(b"apple")?, Some(b"red".to_vec()));
//! assert_eq!(collection.version()?, version);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cursor;
pub mod error;
pub mod options;
pub mod stats;

mod cache;
mod collection;
mod flock;
mod format;
mod wal;

pub use batch::WriteBatch;
pub use collection::Collection;
pub use cursor::Cursor;
pub use error::{Error, Result};
pub use options::Options;
pub use stats::Stats;
