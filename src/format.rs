//! On-disk layout of the data file.
//!
//! The data file starts with a fixed header and is otherwise an append-only
//! sequence of records and commit sentinels:
//!
//! ```text
//! +--------------------+
//! | File header (16 B) |
//! +--------------------+
//! | Record             |
//! +--------------------+
//! | Record             |
//! +--------------------+
//! | Sentinel (12 B)    |  <- end of commit 1
//! +--------------------+
//! | Record             |
//! +--------------------+
//! | Sentinel (12 B)    |  <- end of commit 2
//! +--------------------+
//! ```
//!
//! ## Record
//!
//! ```text
//! +---------+------------+-----------+-----------+-----+-------+
//! | next:i64| deleted:i64| keylen:u16| vallen:u32| key | value |
//! +---------+------------+-----------+-----------+-----+-------+
//! | 8 bytes | 8 bytes    | 2 bytes   | 4 bytes   | var | var   |
//! +---------+------------+-----------+-----------+-----+-------+
//! ```
//!
//! All integers are little-endian. `next` and `deleted` are patched in
//! place; everything after them is immutable once written. Records never
//! move. A nonzero `deleted` holds the commit version that tombstoned the
//! record.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub const FILE_HEADER_SIZE: usize = 16;
pub const RECORD_HEADER_SIZE: usize = 22;
pub const SENTINEL_SIZE: usize = 12;

pub const SENTINEL_MAGIC: u32 = 0xDEAD_10CC;

/// The 16 bytes at offset 0 of the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileHeader {
    /// Offset of the smallest-key live record, or 0 if the collection is
    /// empty.
    pub head: i64,
    /// Offset just past the most recent sentinel. Doubles as the current
    /// commit version.
    pub last_commit: i64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        (&mut buf[0..8]).write_i64::<LittleEndian>(self.head).unwrap();
        (&mut buf[8..16])
            .write_i64::<LittleEndian>(self.last_commit)
            .unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "file header is {} bytes, want {}",
                buf.len(),
                FILE_HEADER_SIZE
            )));
        }
        let head = (&buf[0..8]).read_i64::<LittleEndian>()?;
        let last_commit = (&buf[8..16]).read_i64::<LittleEndian>()?;
        Ok(FileHeader { head, last_commit })
    }
}

/// The fixed 22-byte prefix of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    /// Offset of the successor record, or 0 at the tail.
    pub next: i64,
    /// Commit version that tombstoned this record, or 0 if live.
    pub deleted: i64,
    pub key_len: u16,
    pub val_len: u32,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        (&mut buf[0..8]).write_i64::<LittleEndian>(self.next).unwrap();
        (&mut buf[8..16])
            .write_i64::<LittleEndian>(self.deleted)
            .unwrap();
        (&mut buf[16..18])
            .write_u16::<LittleEndian>(self.key_len)
            .unwrap();
        (&mut buf[18..22])
            .write_u32::<LittleEndian>(self.val_len)
            .unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "record header is {} bytes, want {}",
                buf.len(),
                RECORD_HEADER_SIZE
            )));
        }
        let next = (&buf[0..8]).read_i64::<LittleEndian>()?;
        let deleted = (&buf[8..16]).read_i64::<LittleEndian>()?;
        let key_len = (&buf[16..18]).read_u16::<LittleEndian>()?;
        let val_len = (&buf[18..22]).read_u32::<LittleEndian>()?;
        Ok(RecordHeader {
            next,
            deleted,
            key_len,
            val_len,
        })
    }
}

/// A 12-byte delimiter written at the end of every commit.
///
/// `offset` is the sentinel's own starting position. It is kept as a
/// diagnostic marker; only the magic is validated on read. The commit
/// version is `offset + SENTINEL_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinel {
    pub offset: i64,
}

impl Sentinel {
    pub fn encode(&self) -> [u8; SENTINEL_SIZE] {
        let mut buf = [0u8; SENTINEL_SIZE];
        (&mut buf[0..4])
            .write_u32::<LittleEndian>(SENTINEL_MAGIC)
            .unwrap();
        (&mut buf[4..12]).write_i64::<LittleEndian>(self.offset).unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SENTINEL_SIZE {
            return Err(Error::Corrupt(format!(
                "sentinel is {} bytes, want {}",
                buf.len(),
                SENTINEL_SIZE
            )));
        }
        let magic = (&buf[0..4]).read_u32::<LittleEndian>()?;
        if magic != SENTINEL_MAGIC {
            return Err(Error::Corrupt(format!("bad sentinel magic {magic:#010x}")));
        }
        let offset = (&buf[4..12]).read_i64::<LittleEndian>()?;
        Ok(Sentinel { offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header_roundtrip() {
        let header = FileHeader {
            head: 16,
            last_commit: 1234,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), FILE_HEADER_SIZE);

        let decoded = FileHeader::decode(&encoded).expect("Failed to decode FileHeader");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_file_header_short_buffer() {
        let result = FileHeader::decode(&[0u8; FILE_HEADER_SIZE - 1]);
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_record_header_roundtrip() {
        let header = RecordHeader {
            next: 98765,
            deleted: 0,
            key_len: 3,
            val_len: 1024,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), RECORD_HEADER_SIZE);

        let decoded = RecordHeader::decode(&encoded).expect("Failed to decode RecordHeader");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_record_header_layout() {
        // The first eight bytes must be `next` so in-place link patches can
        // assume its position.
        let header = RecordHeader {
            next: 1,
            deleted: 2,
            key_len: 3,
            val_len: 4,
        };
        let encoded = header.encode();
        assert_eq!(&encoded[0..8], &1i64.to_le_bytes());
        assert_eq!(&encoded[8..16], &2i64.to_le_bytes());
    }

    #[test]
    fn test_sentinel_roundtrip() {
        let sentinel = Sentinel { offset: 4096 };
        let encoded = sentinel.encode();
        assert_eq!(encoded.len(), SENTINEL_SIZE);

        let decoded = Sentinel::decode(&encoded).expect("Failed to decode Sentinel");
        assert_eq!(decoded, sentinel);
    }

    #[test]
    fn test_sentinel_bad_magic() {
        let mut encoded = Sentinel { offset: 4096 }.encode();
        encoded[0] ^= 0xFF;
        let result = Sentinel::decode(&encoded);
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }
}
