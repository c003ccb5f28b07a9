//! Write-ahead log of byte-level patches to the data file.
//!
//! Each commit appends one entry. An entry is a group of patches that must
//! be applied together: every record carries a target offset in the data
//! file and the bytes to write there. Recovery only ever replays the last
//! entry, so entries are framed to be locatable from the end of the file.
//!
//! # Entry format
//!
//! ```text
//! +-----------+--------------+-------------------------+---------+-----------+
//! | magic:u32 | num_recs:u32 | records ...             | len:u64 | crc32:u32 |
//! +-----------+--------------+-------------------------+---------+-----------+
//! ```
//!
//! Each record:
//!
//! ```text
//! +------------+----------+------------+
//! | offset:i64 | size:i64 | data bytes |
//! +------------+----------+------------+
//! ```
//!
//! All integers are little-endian. `len` counts from the magic through the
//! end of the last record; the CRC32 covers those same bytes. The fixed
//! 12-byte trailer makes the last entry unambiguous: read the trailer, seek
//! back `len`, verify magic, record count, and checksum. A torn append
//! fails that validation and is discarded by [`Wal::truncate`].

use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

const ENTRY_MAGIC: u32 = 0x454D_4257; // "EMBW"
const ENTRY_HEADER_SIZE: u64 = 8; // magic + record count
const ENTRY_TRAILER_SIZE: u64 = 12; // len + crc32

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A single patch: `data` is written at `offset` in the data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WalRecord {
    pub offset: i64,
    pub data: Vec<u8>,
}

/// One commit's worth of patches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WalEntry {
    pub records: Vec<WalRecord>,
}

impl WalEntry {
    pub fn new() -> Self {
        WalEntry::default()
    }

    pub fn push(&mut self, offset: i64, data: Vec<u8>) {
        self.records.push(WalRecord { offset, data });
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(ENTRY_MAGIC).unwrap();
        buf.write_u32::<LittleEndian>(self.records.len() as u32)
            .unwrap();
        for rec in &self.records {
            buf.write_i64::<LittleEndian>(rec.offset).unwrap();
            buf.write_i64::<LittleEndian>(rec.data.len() as i64).unwrap();
            buf.extend_from_slice(&rec.data);
        }
        let len = buf.len() as u64;
        let crc = CRC32.checksum(&buf);
        buf.write_u64::<LittleEndian>(len).unwrap();
        buf.write_u32::<LittleEndian>(crc).unwrap();
        buf
    }

    /// Decodes the payload of an entry (everything before the trailer).
    fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(buf);
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != ENTRY_MAGIC {
            return Err(Error::Corrupt(format!("bad log entry magic {magic:#010x}")));
        }
        let num_records = reader.read_u32::<LittleEndian>()?;
        let mut records = Vec::with_capacity(num_records as usize);
        for _ in 0..num_records {
            let offset = reader.read_i64::<LittleEndian>()?;
            let size = reader.read_i64::<LittleEndian>()?;
            let remaining = buf.len() as u64 - reader.position();
            if size < 0 || size as u64 > remaining {
                return Err(Error::Corrupt(format!("log record size {size} out of range")));
            }
            let mut data = vec![0u8; size as usize];
            reader.read_exact(&mut data)?;
            records.push(WalRecord { offset, data });
        }
        if reader.position() != buf.len() as u64 {
            return Err(Error::Corrupt("trailing bytes in log entry".to_string()));
        }
        Ok(WalEntry { records })
    }
}

#[derive(Debug)]
pub(crate) struct Wal {
    file: File,
    path: PathBuf,
}

impl Wal {
    /// Creates an empty log, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Wal { file, path })
    }

    /// Opens an existing log. A missing file is treated as an empty log.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Wal { file, path })
    }

    /// Appends an entry and fsyncs. Returns the entry's starting offset.
    pub fn append(&mut self, entry: &WalEntry) -> Result<i64> {
        let start = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&entry.encode())?;
        self.file.sync_all()?;
        Ok(start as i64)
    }

    /// Locates and decodes the last well-formed entry.
    ///
    /// Fails on an empty log or a torn tail; the caller is expected to
    /// respond with [`Wal::truncate`].
    pub fn read_last_entry(&mut self) -> Result<WalEntry> {
        let file_len = self.file.seek(SeekFrom::End(0))?;
        if file_len < ENTRY_HEADER_SIZE + ENTRY_TRAILER_SIZE {
            return Err(Error::Corrupt("log holds no complete entry".to_string()));
        }

        self.file
            .seek(SeekFrom::Start(file_len - ENTRY_TRAILER_SIZE))?;
        let len = self.file.read_u64::<LittleEndian>()?;
        let crc = self.file.read_u32::<LittleEndian>()?;
        if len < ENTRY_HEADER_SIZE || len + ENTRY_TRAILER_SIZE > file_len {
            return Err(Error::Corrupt(format!("log trailer length {len} out of range")));
        }

        let start = file_len - ENTRY_TRAILER_SIZE - len;
        self.file.seek(SeekFrom::Start(start))?;
        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload)?;
        if CRC32.checksum(&payload) != crc {
            return Err(Error::Corrupt("log entry checksum mismatch".to_string()));
        }

        WalEntry::decode(&payload)
    }

    /// Discards a torn tail by scanning forward from the start and
    /// truncating to the end of the last well-formed entry.
    pub fn truncate(&mut self) -> Result<()> {
        let file_len = self.file.seek(SeekFrom::End(0))?;
        let mut pos: u64 = 0;
        let mut last_good: u64 = 0;

        while pos + ENTRY_HEADER_SIZE + ENTRY_TRAILER_SIZE <= file_len {
            match self.scan_entry(pos, file_len) {
                Ok(end) => {
                    last_good = end;
                    pos = end;
                }
                Err(_) => break,
            }
        }

        if last_good != file_len {
            tracing::warn!(
                path = %self.path.display(),
                discarded = file_len - last_good,
                "truncating torn log tail"
            );
            self.file.set_len(last_good)?;
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Validates one entry starting at `pos`; returns the offset just past
    /// its trailer.
    fn scan_entry(&mut self, pos: u64, file_len: u64) -> Result<u64> {
        self.file.seek(SeekFrom::Start(pos))?;
        let magic = self.file.read_u32::<LittleEndian>()?;
        if magic != ENTRY_MAGIC {
            return Err(Error::Corrupt(format!("bad log entry magic {magic:#010x}")));
        }
        let num_records = self.file.read_u32::<LittleEndian>()?;

        let mut cursor = pos + ENTRY_HEADER_SIZE;
        for _ in 0..num_records {
            if cursor + 16 > file_len {
                return Err(Error::Corrupt("log record header past end".to_string()));
            }
            self.file.seek(SeekFrom::Start(cursor + 8))?;
            let size = self.file.read_i64::<LittleEndian>()?;
            if size < 0 || cursor + 16 + size as u64 > file_len {
                return Err(Error::Corrupt(format!("log record size {size} out of range")));
            }
            cursor += 16 + size as u64;
        }

        if cursor + ENTRY_TRAILER_SIZE > file_len {
            return Err(Error::Corrupt("log entry trailer past end".to_string()));
        }
        self.file.seek(SeekFrom::Start(cursor))?;
        let len = self.file.read_u64::<LittleEndian>()?;
        let crc = self.file.read_u32::<LittleEndian>()?;
        if len != cursor - pos {
            return Err(Error::Corrupt("log trailer length mismatch".to_string()));
        }

        self.file.seek(SeekFrom::Start(pos))?;
        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload)?;
        if CRC32.checksum(&payload) != crc {
            return Err(Error::Corrupt("log entry checksum mismatch".to_string()));
        }

        Ok(cursor + ENTRY_TRAILER_SIZE)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Removes the log file. The handle is dropped first.
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

    fn temp_wal() -> (tempfile::TempDir, Wal) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let wal = Wal::create(dir.path().join("test.wal")).expect("Failed to create WAL");
        (dir, wal)
    }

    fn sample_entry(tag: u8) -> WalEntry {
        let mut entry = WalEntry::new();
        entry.push(0, vec![tag; 16]);
        entry.push(64, vec![tag ^ 0xFF; 22]);
        entry
    }

    #[test]
    fn test_append_and_read_last() {
        let (_dir, mut wal) = temp_wal();

        let first = sample_entry(1);
        let second = sample_entry(2);
        let off1 = wal.append(&first).expect("Failed to append");
        let off2 = wal.append(&second).expect("Failed to append");
        assert_eq!(off1, 0);
        assert!(off2 > off1);

        let last = wal.read_last_entry().expect("Failed to read last entry");
        assert_eq!(last, second);
    }

    #[test]
    fn test_empty_log_has_no_entry() {
        let (_dir, mut wal) = temp_wal();
        assert!(wal.read_last_entry().is_err());

        // Truncating an empty log is a no-op.
        wal.truncate().expect("Failed to truncate");
        assert!(wal.read_last_entry().is_err());
    }

    #[test]
    fn test_torn_tail_detected_and_truncated() {
        let (_dir, mut wal) = temp_wal();

        let first = sample_entry(1);
        wal.append(&first).expect("Failed to append");
        let good_len = wal.file.metadata().unwrap().len();

        // A second entry that never finished writing.
        let torn = sample_entry(2).encode();
        wal.file.seek(SeekFrom::End(0)).unwrap();
        wal.file.write_all(&torn[..torn.len() - 5]).unwrap();

        assert!(wal.read_last_entry().is_err());

        wal.truncate().expect("Failed to truncate");
        assert_eq!(wal.file.metadata().unwrap().len(), good_len);
        let last = wal.read_last_entry().expect("Failed to read after truncate");
        assert_eq!(last, first);
    }

    #[test]
    fn test_garbage_log_truncates_to_empty() {
        let (_dir, mut wal) = temp_wal();
        wal.file.write_all(b"not a log entry at all").unwrap();

        assert!(wal.read_last_entry().is_err());
        wal.truncate().expect("Failed to truncate");
        assert_eq!(wal.file.metadata().unwrap().len(), 0);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let (_dir, mut wal) = temp_wal();
        wal.append(&sample_entry(1)).expect("Failed to append");

        // Flip a byte inside the entry payload.
        wal.file.seek(SeekFrom::Start(10)).unwrap();
        wal.file.write_all(&[0xAA]).unwrap();

        assert!(matches!(wal.read_last_entry(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_empty_entry_roundtrip() {
        let (_dir, mut wal) = temp_wal();
        let entry = WalEntry::new();
        wal.append(&entry).expect("Failed to append");

        let last = wal.read_last_entry().expect("Failed to read last entry");
        assert!(last.records.is_empty());
    }

    #[test]
    fn test_reopen_preserves_entries() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.wal");

        let entry = sample_entry(7);
        {
            let mut wal = Wal::create(&path).expect("Failed to create WAL");
            wal.append(&entry).expect("Failed to append");
        }

        let mut wal = Wal::open(&path).expect("Failed to open WAL");
        let last = wal.read_last_entry().expect("Failed to read last entry");
        assert_eq!(last, entry);
    }

    #[test]
    fn test_destroy_removes_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.wal");
        let wal = Wal::create(&path).expect("Failed to create WAL");
        assert!(path.exists());

        wal.destroy().expect("Failed to destroy");
        assert!(!path.exists());
    }
}
