//! Pool-set descriptor
//!
//! A pool set is a text file describing the replicas of a pool and the
//! parts each replica is built from:
//!
//! ```text
//! PMEMPOOLSET
//! OPTION SINGLEHDR
//! 30M /mnt/pmem/dir1/
//! 30M /mnt/pmem/dir2/
//! REPLICA
//! 60M /mnt/pmem/mirror/
//! ```
//!
//! A part is either an explicit file of fixed size, or a growth directory
//! in which parts are created on demand up to the given reservation.

mod parse;

pub use parse::{format_size, parse_size, DescriptorError};

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use pmobj_core::limits::{MIN_PART, MIN_POOL, PART_ALIGN};
use pmobj_core::{Error, Result};

use crate::format::PART_HEADER_SIZE;

/// First significant line of every pool-set file
pub const POOLSET_SIGNATURE: &str = "PMEMPOOLSET";

/// Kind of a part entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    /// Explicit file of fixed size
    File,
    /// Directory receiving auto-named parts up to a reservation
    Directory,
}

/// One part entry of a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDesc {
    /// File size, or address-space reservation for a directory
    pub size: u64,
    /// Absolute path of the file or directory
    pub path: PathBuf,
    /// File or directory
    pub kind: PartKind,
}

impl PartDesc {
    /// Explicit file part
    pub fn file(size: u64, path: impl Into<PathBuf>) -> Self {
        PartDesc {
            size,
            path: path.into(),
            kind: PartKind::File,
        }
    }

    /// Growth directory part
    pub fn directory(size: u64, path: impl Into<PathBuf>) -> Self {
        PartDesc {
            size,
            path: path.into(),
            kind: PartKind::Directory,
        }
    }
}

/// One replica: an ordered list of parts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaDesc {
    /// Parts in logical order
    pub parts: Vec<PartDesc>,
}

impl ReplicaDesc {
    /// Kind shared by all parts, `None` if mixed or empty
    pub fn kind(&self) -> Option<PartKind> {
        let first = self.parts.first()?.kind;
        self.parts.iter().all(|p| p.kind == first).then_some(first)
    }

    /// Logical bytes this replica can ever address
    pub fn ceiling(&self, single_header: bool) -> u64 {
        self.parts
            .iter()
            .map(|p| match p.kind {
                PartKind::File if !single_header => p.size.saturating_sub(PART_HEADER_SIZE),
                _ => p.size,
            })
            .sum()
    }
}

/// Parsed pool-set descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSetDescriptor {
    /// One shared pool header instead of one header per part
    pub single_header: bool,
    /// Replicas; index 0 is the primary
    pub replicas: Vec<ReplicaDesc>,
}

impl PoolSetDescriptor {
    /// Empty descriptor
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `SINGLEHDR` option
    pub fn with_single_header(mut self, single_header: bool) -> Self {
        self.single_header = single_header;
        self
    }

    /// Append a replica
    pub fn with_replica(mut self, parts: Vec<PartDesc>) -> Self {
        self.replicas.push(ReplicaDesc { parts });
        self
    }

    /// Parse descriptor text
    ///
    /// Paths ending in `/` or naming an existing directory become
    /// directory parts. The result is not validated; see [`validate`].
    ///
    /// [`validate`]: PoolSetDescriptor::validate
    pub fn parse(text: &str) -> Result<Self> {
        Ok(parse::parse(text)?)
    }

    /// Read, parse and validate a descriptor file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let desc = Self::parse(&text)?;
        desc.validate()?;
        Ok(desc)
    }

    /// True if the file at `path` starts with the pool-set signature
    pub fn is_poolset_file(path: impl AsRef<Path>) -> Result<bool> {
        let mut head = Vec::with_capacity(512);
        fs::File::open(path.as_ref())?
            .take(512)
            .read_to_end(&mut head)?;
        let text = String::from_utf8_lossy(&head);
        Ok(text
            .lines()
            .map(|l| l.split('#').next().unwrap_or("").trim())
            .find(|l| !l.is_empty())
            .map_or(false, |l| l == POOLSET_SIGNATURE))
    }

    /// Render back to descriptor text
    pub fn to_text(&self) -> String {
        let mut out = String::from(POOLSET_SIGNATURE);
        out.push('\n');
        if self.single_header {
            out.push_str("OPTION SINGLEHDR\n");
        }
        for (i, replica) in self.replicas.iter().enumerate() {
            if i > 0 {
                out.push_str("REPLICA\n");
            }
            for part in &replica.parts {
                let mut path = part.path.display().to_string();
                if part.kind == PartKind::Directory && !path.ends_with('/') {
                    path.push('/');
                }
                out.push_str(&format!("{} {}\n", format_size(part.size), path));
            }
        }
        out
    }

    /// Write the rendered descriptor to `path`
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), self.to_text())?;
        Ok(())
    }

    /// True if every replica grows through directories
    pub fn is_directory_based(&self) -> bool {
        !self.replicas.is_empty()
            && self
                .replicas
                .iter()
                .all(|r| r.kind() == Some(PartKind::Directory))
    }

    /// Smallest replica ceiling: the usable address space of the pool
    pub fn effective_ceiling(&self) -> u64 {
        self.replicas
            .iter()
            .map(|r| r.ceiling(self.single_header))
            .min()
            .unwrap_or(0)
    }

    /// Check structural consistency
    ///
    /// # Errors
    ///
    /// Returns `DescriptorInvalid` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::DescriptorInvalid(msg));

        if self.replicas.is_empty() {
            return invalid("no replicas defined".into());
        }

        let mut seen = HashSet::new();
        let mut kinds = Vec::with_capacity(self.replicas.len());
        for (r, replica) in self.replicas.iter().enumerate() {
            let kind = match (replica.parts.is_empty(), replica.kind()) {
                (true, _) => return invalid(format!("replica {} has no parts", r)),
                (false, None) => {
                    return invalid(format!("replica {} mixes directories and files", r))
                }
                (false, Some(kind)) => kind,
            };
            if kind == PartKind::Directory && !self.single_header {
                return invalid(format!(
                    "replica {} uses directories, which require OPTION SINGLEHDR",
                    r
                ));
            }
            for part in &replica.parts {
                if !part.path.is_absolute() {
                    return invalid(format!("path {} is not absolute", part.path.display()));
                }
                if part.size < MIN_PART {
                    return invalid(format!(
                        "part {} is {} bytes, below the minimum of {}",
                        part.path.display(),
                        part.size,
                        MIN_PART
                    ));
                }
                if part.kind == PartKind::File && part.size % PART_ALIGN != 0 {
                    return invalid(format!(
                        "part {} size {} is not a multiple of {}",
                        part.path.display(),
                        part.size,
                        PART_ALIGN
                    ));
                }
                if !seen.insert(part.path.clone()) {
                    return invalid(format!("path {} used more than once", part.path.display()));
                }
            }
            kinds.push(kind);
        }

        if kinds.iter().any(|k| *k != kinds[0]) {
            return invalid("replicas mix directory-based and file-based layouts".into());
        }

        match kinds[0] {
            PartKind::File => {
                let size = self.replicas[0].ceiling(self.single_header);
                if let Some(r) = self
                    .replicas
                    .iter()
                    .position(|r| r.ceiling(self.single_header) != size)
                {
                    return invalid(format!(
                        "replica {} size differs from the primary's {} bytes",
                        r, size
                    ));
                }
                if size < MIN_POOL {
                    return invalid(format!(
                        "pool size {} is below the minimum of {}",
                        size, MIN_POOL
                    ));
                }
            }
            PartKind::Directory => {
                for (r, replica) in self.replicas.iter().enumerate() {
                    if replica.parts[0].size < MIN_POOL {
                        return invalid(format!(
                            "first directory of replica {} reserves {} bytes, below the minimum pool size of {}",
                            r, replica.parts[0].size, MIN_POOL
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
