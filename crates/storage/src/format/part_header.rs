//! Per-part header format
//!
//! Explicit part files of a pool without `SINGLEHDR` start with a 4 KiB
//! header tying the file to its pool, replica and position. Data is mapped
//! from the end of the header.
//!
//! ```text
//! | Magic: "PMOBJPT\0" | 8 bytes
//! | Format Version     | 4 bytes (u32 LE)
//! | Pool UUID          | 16 bytes
//! | Replica Index      | 4 bytes (u32 LE)
//! | Part Index         | 4 bytes (u32 LE)
//! | Part Size          | 8 bytes (u64 LE, whole file)
//! | CRC32              | 4 bytes
//! ```

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use pmobj_core::Error;

use super::pool_header::{HeaderError, POOL_FORMAT_VERSION};

/// Part header magic bytes
pub const PART_HEADER_MAGIC: [u8; 8] = *b"PMOBJPT\0";

/// Bytes reserved for the part header at the start of the file
pub const PART_HEADER_SIZE: u64 = 4096;

const ENCODED_LEN: usize = 8 + 4 + 16 + 4 + 4 + 8 + 4;

/// Per-part header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartHeader {
    /// UUID of the owning pool
    pub pool_uuid: [u8; 16],
    /// Replica this part belongs to
    pub replica: u32,
    /// Position of this part in its replica
    pub part: u32,
    /// Size of the whole file
    pub size: u64,
}

impl PartHeader {
    /// Serialize (CRC in the last 4 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENCODED_LEN);
        bytes.extend_from_slice(&PART_HEADER_MAGIC);
        bytes.extend_from_slice(&POOL_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.pool_uuid);
        bytes.extend_from_slice(&self.replica.to_le_bytes());
        bytes.extend_from_slice(&self.part.to_le_bytes());
        bytes.extend_from_slice(&self.size.to_le_bytes());
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserialize
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < ENCODED_LEN {
            return Err(HeaderError::TooShort);
        }
        if bytes[..8] != PART_HEADER_MAGIC {
            return Err(HeaderError::InvalidMagic);
        }
        let stored = u32_at(bytes, ENCODED_LEN - 4);
        let computed = crc32fast::hash(&bytes[..ENCODED_LEN - 4]);
        if stored != computed {
            return Err(HeaderError::ChecksumMismatch {
                expected: stored,
                computed,
            });
        }
        let version = u32_at(bytes, 8);
        if version != POOL_FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let mut pool_uuid = [0u8; 16];
        pool_uuid.copy_from_slice(&bytes[12..28]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[36..44]);
        Ok(PartHeader {
            pool_uuid,
            replica: u32_at(bytes, 28),
            part: u32_at(bytes, 32),
            size: u64::from_le_bytes(size),
        })
    }

    /// Write at the start of `file` and sync
    pub fn write_to(&self, file: &mut File) -> pmobj_core::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Read from the start of `file`
    pub fn read_from(file: &mut File) -> pmobj_core::Result<Self> {
        let mut buf = [0u8; ENCODED_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        PartHeader::from_bytes(&buf)
            .map_err(|e| Error::Corruption(format!("part header: {}", e)))
    }
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_header_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("part"))
            .unwrap();
        let header = PartHeader {
            pool_uuid: [3u8; 16],
            replica: 1,
            part: 2,
            size: 8 << 20,
        };
        header.write_to(&mut file).unwrap();
        assert_eq!(PartHeader::read_from(&mut file).unwrap(), header);
    }

    #[test]
    fn test_part_header_rejects_wrong_magic() {
        let mut bytes = PartHeader {
            pool_uuid: [0u8; 16],
            replica: 0,
            part: 0,
            size: 0,
        }
        .to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            PartHeader::from_bytes(&bytes),
            Err(HeaderError::InvalidMagic)
        ));
    }
}
