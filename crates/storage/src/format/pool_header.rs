//! Pool header format
//!
//! # Format
//!
//! ```text
//! +--------------------+
//! | Magic: "PMOBJPL\0" | 8 bytes
//! | Format Version     | 4 bytes (u32 LE)
//! | Flags              | 4 bytes (u32 LE, bit 0 = SINGLEHDR)
//! | Pool UUID          | 16 bytes
//! | Creation Time      | 8 bytes (u64 LE, seconds since epoch)
//! | Reservation        | 8 bytes (u64 LE, effective address-space ceiling)
//! | Heap Offset        | 8 bytes (u64 LE)
//! | Chunk Size         | 8 bytes (u64 LE)
//! | Lane Count         | 4 bytes (u32 LE)
//! | Chunks Per Zone    | 4 bytes (u32 LE)
//! | Layout Length      | 4 bytes (u32 LE)
//! | Layout             | variable (<= 1024 bytes)
//! | ... zero padding   |
//! | CRC32              | 4 bytes, last 4 bytes of the copy
//! +--------------------+
//! ```
//!
//! The header region holds two copies of `HEADER_COPY_SIZE` bytes. Updates
//! rewrite the primary, then the backup, so at least one copy is always
//! intact.

use std::io::{Cursor, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use pmobj_core::layout::{CHUNK_SIZE, HEAP_OFFSET, LANE_COUNT, MAX_CHUNKS_PER_ZONE, POOL_HEADER_SIZE};
use pmobj_core::limits::MAX_LAYOUT;
use pmobj_core::{Error, PersistentMemory};
use thiserror::Error as ThisError;
use tracing::warn;

/// Pool header magic bytes
pub const POOL_HEADER_MAGIC: [u8; 8] = *b"PMOBJPL\0";

/// Current pool format version
pub const POOL_FORMAT_VERSION: u32 = 1;

/// Size of one header copy
pub const HEADER_COPY_SIZE: u64 = POOL_HEADER_SIZE / 2;

const FLAG_SINGLE_HEADER: u32 = 1;

/// Pool header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHeader {
    /// Format version
    pub format_version: u32,
    /// Pool uses one shared header instead of per-part headers
    pub single_header: bool,
    /// Pool identifier (generated on creation)
    pub uuid: [u8; 16],
    /// Creation time, seconds since the Unix epoch
    pub creation_time: u64,
    /// Effective address-space ceiling recorded at the last open
    pub reservation: u64,
    /// Layout identifier chosen at create
    pub layout: String,
    /// Heap start; must match this build's geometry
    pub heap_offset: u64,
    /// Chunk size; must match this build's geometry
    pub chunk_size: u64,
    /// Lane count; must match this build's geometry
    pub lane_count: u32,
    /// Chunks per zone; must match this build's geometry
    pub chunks_per_zone: u32,
}

/// Pool header errors
#[derive(Debug, ThisError)]
pub enum HeaderError {
    /// Buffer shorter than a header copy
    #[error("header too short")]
    TooShort,

    /// Magic bytes do not match
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// CRC mismatch
    #[error("checksum mismatch: stored {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// CRC stored in the header
        expected: u32,
        /// CRC computed over the header bytes
        computed: u32,
    },

    /// Format version not understood
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    /// Layout longer than allowed or not UTF-8
    #[error("invalid layout identifier")]
    InvalidLayout,

    /// Geometry written by an incompatible build
    #[error("geometry mismatch: {0}")]
    Geometry(String),
}

impl From<HeaderError> for Error {
    fn from(e: HeaderError) -> Self {
        Error::Corruption(format!("pool header: {}", e))
    }
}

impl PoolHeader {
    /// Header for a freshly created pool
    pub fn new(uuid: [u8; 16], layout: &str, single_header: bool, reservation: u64) -> Self {
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        PoolHeader {
            format_version: POOL_FORMAT_VERSION,
            single_header,
            uuid,
            creation_time,
            reservation,
            layout: layout.to_string(),
            heap_offset: HEAP_OFFSET,
            chunk_size: CHUNK_SIZE,
            lane_count: LANE_COUNT as u32,
            chunks_per_zone: MAX_CHUNKS_PER_ZONE,
        }
    }

    /// Low 64 bits of the UUID, used in object identifiers
    pub fn uuid_lo(&self) -> u64 {
        let mut lo = [0u8; 8];
        lo.copy_from_slice(&self.uuid[..8]);
        u64::from_le_bytes(lo)
    }

    /// Serialize to one header copy, CRC in the last 4 bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, HeaderError> {
        if self.layout.len() > MAX_LAYOUT {
            return Err(HeaderError::InvalidLayout);
        }
        let mut bytes = Vec::with_capacity(HEADER_COPY_SIZE as usize);
        let flags = if self.single_header { FLAG_SINGLE_HEADER } else { 0 };

        // Writes into a Vec cannot fail.
        let _ = (|| -> std::io::Result<()> {
            bytes.write_all(&POOL_HEADER_MAGIC)?;
            bytes.write_u32::<LittleEndian>(self.format_version)?;
            bytes.write_u32::<LittleEndian>(flags)?;
            bytes.write_all(&self.uuid)?;
            bytes.write_u64::<LittleEndian>(self.creation_time)?;
            bytes.write_u64::<LittleEndian>(self.reservation)?;
            bytes.write_u64::<LittleEndian>(self.heap_offset)?;
            bytes.write_u64::<LittleEndian>(self.chunk_size)?;
            bytes.write_u32::<LittleEndian>(self.lane_count)?;
            bytes.write_u32::<LittleEndian>(self.chunks_per_zone)?;
            bytes.write_u32::<LittleEndian>(self.layout.len() as u32)?;
            bytes.write_all(self.layout.as_bytes())
        })();

        bytes.resize(HEADER_COPY_SIZE as usize - 4, 0);
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    /// Deserialize one header copy
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_COPY_SIZE as usize {
            return Err(HeaderError::TooShort);
        }
        let bytes = &bytes[..HEADER_COPY_SIZE as usize];
        if bytes[..8] != POOL_HEADER_MAGIC {
            return Err(HeaderError::InvalidMagic);
        }

        let (data, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(crc_bytes);
        let stored = u32::from_le_bytes(stored);
        let computed = crc32fast::hash(data);
        if stored != computed {
            return Err(HeaderError::ChecksumMismatch {
                expected: stored,
                computed,
            });
        }

        let mut cur = Cursor::new(&data[8..]);
        let read = |cur: &mut Cursor<&[u8]>| -> std::io::Result<PoolHeader> {
            let format_version = cur.read_u32::<LittleEndian>()?;
            let flags = cur.read_u32::<LittleEndian>()?;
            let mut uuid = [0u8; 16];
            cur.read_exact(&mut uuid)?;
            let creation_time = cur.read_u64::<LittleEndian>()?;
            let reservation = cur.read_u64::<LittleEndian>()?;
            let heap_offset = cur.read_u64::<LittleEndian>()?;
            let chunk_size = cur.read_u64::<LittleEndian>()?;
            let lane_count = cur.read_u32::<LittleEndian>()?;
            let chunks_per_zone = cur.read_u32::<LittleEndian>()?;
            let layout_len = cur.read_u32::<LittleEndian>()? as usize;
            let mut layout = vec![0u8; layout_len.min(MAX_LAYOUT + 1)];
            cur.read_exact(&mut layout)?;
            Ok(PoolHeader {
                format_version,
                single_header: flags & FLAG_SINGLE_HEADER != 0,
                uuid,
                creation_time,
                reservation,
                layout: String::from_utf8_lossy(&layout).into_owned(),
                heap_offset,
                chunk_size,
                lane_count,
                chunks_per_zone,
            })
        };
        let header = read(&mut cur).map_err(|_| HeaderError::TooShort)?;

        if header.format_version != POOL_FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(header.format_version));
        }
        if header.layout.len() > MAX_LAYOUT {
            return Err(HeaderError::InvalidLayout);
        }
        header.check_geometry()?;
        Ok(header)
    }

    fn check_geometry(&self) -> Result<(), HeaderError> {
        if self.heap_offset != HEAP_OFFSET
            || self.chunk_size != CHUNK_SIZE
            || self.lane_count != LANE_COUNT as u32
            || self.chunks_per_zone != MAX_CHUNKS_PER_ZONE
        {
            return Err(HeaderError::Geometry(format!(
                "heap at {:#x}, chunk {} bytes, {} lanes, {} chunks per zone",
                self.heap_offset, self.chunk_size, self.lane_count, self.chunks_per_zone
            )));
        }
        Ok(())
    }
}

/// Write both header copies and persist them, primary first
pub fn write_pool_header(mem: &dyn PersistentMemory, header: &PoolHeader) -> pmobj_core::Result<()> {
    let bytes = header.to_bytes()?;
    mem.write_persist(0, &bytes)?;
    mem.write_persist(HEADER_COPY_SIZE, &bytes)?;
    Ok(())
}

/// Read the pool header, falling back to the backup copy
///
/// A valid backup with a damaged primary is copied back over the primary.
///
/// # Errors
///
/// Returns `Corruption` if neither copy is valid.
pub fn read_pool_header(mem: &dyn PersistentMemory) -> pmobj_core::Result<PoolHeader> {
    let mut buf = vec![0u8; HEADER_COPY_SIZE as usize];
    mem.read(0, &mut buf)?;
    let primary_err = match PoolHeader::from_bytes(&buf) {
        Ok(header) => return Ok(header),
        Err(e) => e,
    };

    mem.read(HEADER_COPY_SIZE, &mut buf)?;
    match PoolHeader::from_bytes(&buf) {
        Ok(header) => {
            warn!(target: "pmobj::mapper", error = %primary_err, "Primary pool header invalid, restored from backup");
            mem.write_persist(0, &buf)?;
            Ok(header)
        }
        Err(_) => Err(primary_err.into()),
    }
}
