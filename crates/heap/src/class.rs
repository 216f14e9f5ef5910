//! Allocation classes
//!
//! A class fixes the unit size, alignment, object header and units per run
//! for small allocations. Id 0 is reserved for huge allocations (whole
//! chunks). Built-in classes occupy ids `1..=DEFAULT_CLASS_COUNT`; the
//! remaining ids up to `MAX_CLASS_ID` can be registered at runtime.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use pmobj_core::layout::{CHUNK_SIZE, MAX_CHUNKS_PER_ZONE};
use pmobj_core::{Error, Result};

use crate::run::RUN_HEADER_SIZE;

/// Class id of huge (chunk-granular) allocations
pub const HUGE_CLASS_ID: u8 = 0;

/// Highest usable class id
pub const MAX_CLASS_ID: u8 = 254;

/// Largest alignment a class may request
pub const MAX_ALIGNMENT: u64 = 4096;

/// Largest unit served by a built-in class
pub const DEFAULT_MAX_UNIT: u64 = 128 * 1024;

/// Object header placed in front of each allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderType {
    /// 64 bytes: usable size, type number, padding
    Legacy,
    /// 16 bytes: usable size, type number
    Compact,
    /// No header: usable size is the unit size, type number is 0
    None,
}

impl HeaderType {
    /// Bytes the header occupies
    pub const fn size(self) -> u64 {
        match self {
            HeaderType::Legacy => 64,
            HeaderType::Compact => 16,
            HeaderType::None => 0,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            HeaderType::Legacy => 0,
            HeaderType::Compact => 1,
            HeaderType::None => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(HeaderType::Legacy),
            1 => Some(HeaderType::Compact),
            2 => Some(HeaderType::None),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeaderType::Legacy => "legacy",
            HeaderType::Compact => "compact",
            HeaderType::None => "none",
        })
    }
}

impl FromStr for HeaderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(HeaderType::Legacy),
            "compact" => Ok(HeaderType::Compact),
            "none" => Ok(HeaderType::None),
            other => Err(Error::InvalidArgument(format!("unknown header type {:?}", other))),
        }
    }
}

/// User-facing description of a class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocClassDesc {
    /// Size of one unit, header included
    pub unit_size: u64,
    /// Required alignment of the user data (0 = none)
    pub alignment: u64,
    /// Minimum units per run
    pub units_per_block: u32,
    /// Object header type
    pub header: HeaderType,
}

impl AllocClassDesc {
    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidArgument(msg));
        if self.unit_size == 0 {
            return invalid("unit size must be non-zero".into());
        }
        if self.unit_size <= self.header.size() {
            return invalid(format!(
                "unit size {} leaves no room after a {} header",
                self.unit_size, self.header
            ));
        }
        if self.units_per_block == 0 {
            return invalid("units per block must be non-zero".into());
        }
        if self.alignment != 0 {
            if !self.alignment.is_power_of_two() || self.alignment > MAX_ALIGNMENT {
                return invalid(format!(
                    "alignment {} must be a power of two up to {}",
                    self.alignment, MAX_ALIGNMENT
                ));
            }
            if self.unit_size % self.alignment != 0 {
                return invalid(format!(
                    "unit size {} is not a multiple of alignment {}",
                    self.unit_size, self.alignment
                ));
            }
        }
        let bytes = self.unit_size.checked_mul(self.units_per_block as u64);
        if bytes.map_or(true, |b| b > CHUNK_SIZE * (MAX_CHUNKS_PER_ZONE as u64 - 1)) {
            return invalid("run would not fit in one zone".into());
        }
        Ok(())
    }
}

/// Text form: `unit_size,alignment,units_per_block,header`
impl fmt::Display for AllocClassDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.unit_size, self.alignment, self.units_per_block, self.header
        )
    }
}

impl FromStr for AllocClassDesc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(Error::InvalidArgument(format!(
                "class descriptor {:?} needs unit_size,alignment,units_per_block,header",
                s
            )));
        }
        let num = |text: &str| {
            parse_number(text)
                .ok_or_else(|| Error::InvalidArgument(format!("invalid number {:?}", text)))
        };
        Ok(AllocClassDesc {
            unit_size: num(fields[0])?,
            alignment: num(fields[1])?,
            units_per_block: u32::try_from(num(fields[2])?)
                .map_err(|_| Error::InvalidArgument("units per block too large".into()))?,
            header: fields[3].parse()?,
        })
    }
}

fn parse_number(text: &str) -> Option<u64> {
    let (digits, shift) = match text.as_bytes().last()? {
        b'K' | b'k' => (&text[..text.len() - 1], 10),
        b'M' | b'm' => (&text[..text.len() - 1], 20),
        b'G' | b'g' => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    digits.parse::<u64>().ok()?.checked_mul(1 << shift)
}

/// A registered class with its run geometry resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocClass {
    /// Class id
    pub id: u8,
    /// Description it was registered with
    pub desc: AllocClassDesc,
    /// Chunks per run
    pub run_chunks: u32,
    /// Units per run
    pub units: u32,
    /// Offset of unit 0 from the start of the run
    pub data_offset: u64,
}

impl AllocClass {
    /// Resolve run geometry for `desc`
    pub fn new(id: u8, desc: AllocClassDesc) -> Result<Self> {
        desc.validate()?;
        let meta_for = |units: u64| {
            let bitmap = (units + 63) / 64 * 8;
            let mut meta = align_up(RUN_HEADER_SIZE + bitmap, 64);
            if desc.alignment > 0 {
                meta = align_up(meta + desc.header.size(), desc.alignment) - desc.header.size();
            }
            meta
        };
        let wanted = desc.units_per_block as u64;
        let run_chunks = ((meta_for(wanted) + wanted * desc.unit_size + CHUNK_SIZE - 1) / CHUNK_SIZE) as u32;
        let run_bytes = run_chunks as u64 * CHUNK_SIZE;
        let upper = run_bytes / desc.unit_size;
        let data_offset = meta_for(upper);
        let units = ((run_bytes - data_offset) / desc.unit_size).max(wanted);
        let data_offset = if data_offset + units * desc.unit_size > run_bytes {
            meta_for(wanted)
        } else {
            data_offset
        };
        Ok(AllocClass {
            id,
            desc,
            run_chunks,
            units: units as u32,
            data_offset,
        })
    }

    /// Largest request a unit can hold
    pub fn max_request(&self) -> u64 {
        self.desc.unit_size - self.desc.header.size()
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// Unit sizes with ~20% growth, rounded to 16 bytes
pub fn calculate_size_classes(min_size: u64, max_size: u64) -> Vec<u64> {
    let mut classes = Vec::new();
    let mut current = min_size;
    while current <= max_size {
        classes.push(current);
        let next = align_up((current as f64 * 1.2).ceil() as u64, 16);
        current = next.max(current + 16);
    }
    classes
}

static DEFAULT_CLASSES: Lazy<Vec<AllocClassDesc>> = Lazy::new(|| {
    calculate_size_classes(64, DEFAULT_MAX_UNIT)
        .into_iter()
        .map(|unit_size| AllocClassDesc {
            unit_size,
            alignment: 0,
            units_per_block: ((CHUNK_SIZE - 1024) / unit_size).max(8) as u32,
            header: HeaderType::Compact,
        })
        .collect()
});

/// Number of built-in classes
pub fn default_class_count() -> usize {
    DEFAULT_CLASSES.len()
}

/// Table of registered classes, indexed by id
#[derive(Debug, Clone)]
pub struct AllocClassRegistry {
    classes: Vec<Option<AllocClass>>,
}

impl Default for AllocClassRegistry {
    fn default() -> Self {
        let mut classes = vec![None; MAX_CLASS_ID as usize + 1];
        for (i, desc) in DEFAULT_CLASSES.iter().enumerate() {
            let id = (i + 1) as u8;
            // Built-in descriptors are valid by construction.
            classes[id as usize] = AllocClass::new(id, *desc).ok();
        }
        AllocClassRegistry { classes }
    }
}

impl AllocClassRegistry {
    /// Class registered under `id`
    pub fn get(&self, id: u8) -> Option<&AllocClass> {
        self.classes.get(id as usize).and_then(Option::as_ref)
    }

    /// Register `desc` under `id`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for id 0, ids above `MAX_CLASS_ID`, ids
    /// already in use, or an invalid descriptor.
    pub fn register(&mut self, id: u8, desc: AllocClassDesc) -> Result<AllocClass> {
        if id == HUGE_CLASS_ID || id > MAX_CLASS_ID {
            return Err(Error::InvalidArgument(format!(
                "class id {} is outside 1..={}",
                id, MAX_CLASS_ID
            )));
        }
        if self.get(id).is_some() {
            return Err(Error::InvalidArgument(format!("class id {} is already registered", id)));
        }
        let class = AllocClass::new(id, desc)?;
        self.classes[id as usize] = Some(class);
        Ok(class)
    }

    /// Register `desc` under the first free id
    pub fn register_next(&mut self, desc: AllocClassDesc) -> Result<AllocClass> {
        let id = (1..=MAX_CLASS_ID)
            .find(|id| self.get(*id).is_none())
            .ok_or_else(|| Error::InvalidArgument("all class ids are in use".into()))?;
        self.register(id, desc)
    }

    /// Smallest built-in class whose unit holds `size` bytes
    pub fn best_default(&self, size: u64) -> Option<&AllocClass> {
        (1..=default_class_count() as u8)
            .filter_map(|id| self.get(id))
            .find(|c| c.max_request() >= size)
    }
}
