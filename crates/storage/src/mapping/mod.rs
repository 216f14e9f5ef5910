//! Pool mapping
//!
//! `PoolMapping` turns a pool path (single file or pool-set descriptor)
//! into one flat logical address space per replica:
//! - each replica reserves its address-space ceiling up front
//! - parts are mapped back to back inside the reservation
//! - replica 0 is read and written; `persist` mirrors ranges to the other
//!   replicas and flushes all of them
//! - directory-based pools grow by one mirrored part per replica
//!
//! The pool header lives at logical offset 0 of every replica.

mod parts;
mod range;

pub use parts::{parse_part_index, part_file_name};

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt;
use parking_lot::Mutex;
use pmobj_core::limits::{align_down, align_up, MAX_LAYOUT, MIN_PART, MIN_POOL};
use pmobj_core::{Error, PersistentMemory, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::format::{
    read_pool_header, write_pool_header, PartHeader, PoolHeader, HEADER_COPY_SIZE, PART_HEADER_SIZE,
};
use crate::poolset::{PartKind, PoolSetDescriptor};
use parts::{
    any_parts_exist, commit_staged, create_sized, open_rw, remove_parts, scan_directories, sync_dir, StagedPart,
};
use range::{page_size, ReservedRange};

/// How the pool is backed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// One plain file; fixed size
    SingleFile,
    /// Pool set of explicit part files; fixed size
    FileSet,
    /// Pool set of growth directories
    DirectorySet,
}

/// Mapping options
#[derive(Debug, Clone, Copy, Default)]
pub struct MapOptions {
    /// Touch every page after mapping
    pub prefault: bool,
}

/// Identifies a part added by growth; the same index exists in every replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHandle {
    /// Index of the new part inside each replica
    pub part_index: usize,
    /// Logical offset where the part starts
    pub offset: u64,
    /// Size of the part
    pub len: u64,
}

struct MappedPart {
    path: PathBuf,
    file: File,
    offset: u64,
    len: u64,
    file_offset: u64,
}

struct DirSlot {
    path: PathBuf,
    reservation: u64,
    used: u64,
}

impl DirSlot {
    fn headroom(&self) -> u64 {
        self.reservation.saturating_sub(self.used)
    }
}

#[derive(Default)]
struct ReplicaState {
    dirs: Vec<DirSlot>,
    parts: Vec<MappedPart>,
}

impl ReplicaState {
    fn committed(&self) -> u64 {
        self.parts.iter().map(|p| p.len).sum()
    }

    /// Space growth can still claim: directories with at least a minimum part free
    fn headroom(&self) -> u64 {
        self.dirs
            .iter()
            .map(DirSlot::headroom)
            .filter(|h| *h >= MIN_PART)
            .sum()
    }

    fn lock(&self) -> Result<()> {
        match self.parts.first() {
            Some(part) => lock_file(&part.file, &part.path),
            None => Ok(()),
        }
    }
}

/// The mapped replicas: replica 0 is the working copy
struct ReplicaSet {
    ranges: Vec<ReservedRange>,
    committed: AtomicU64,
    page_size: u64,
}

impl ReplicaSet {
    fn map(states: &[ReplicaState], ceilings: &[u64]) -> Result<Self> {
        let mut ranges = Vec::with_capacity(states.len());
        for (state, ceiling) in states.iter().zip(ceilings) {
            let range = ReservedRange::reserve(*ceiling)?;
            for part in &state.parts {
                range.map_file(part.offset, part.len, &part.file, part.file_offset)?;
            }
            ranges.push(range);
        }
        Ok(ReplicaSet {
            ranges,
            committed: AtomicU64::new(states.first().map_or(0, ReplicaState::committed)),
            page_size: page_size(),
        })
    }

    fn read_replica(&self, replica: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = self
            .ranges
            .get(replica)
            .ok_or_else(|| Error::InvalidArgument(format!("no replica {}", replica)))?;
        self.check_range(offset, buf.len() as u64)?;
        // SAFETY: in committed space, mapped in every replica.
        unsafe {
            std::ptr::copy_nonoverlapping(
                range.as_ptr().add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    fn prefault(&self) {
        let committed = self.committed();
        for range in &self.ranges {
            let mut off = 0;
            while off < committed {
                // SAFETY: in committed space.
                unsafe {
                    std::ptr::read_volatile(range.as_ptr().add(off as usize));
                }
                off += self.page_size;
            }
        }
    }
}

impl PersistentMemory for ReplicaSet {
    fn base(&self) -> *mut u8 {
        self.ranges[0].as_ptr()
    }

    fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    fn persist(&self, offset: u64, len: u64) -> Result<()> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let primary = self.ranges[0].as_ptr();
        for range in &self.ranges[1..] {
            // SAFETY: same committed range in two distinct mappings.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    primary.add(offset as usize),
                    range.as_ptr().add(offset as usize),
                    len as usize,
                );
            }
        }
        for range in &self.ranges {
            range.sync(offset, len, self.page_size)?;
        }
        Ok(())
    }
}

/// A mapped pool: replicas, parts, header and growth state
pub struct PoolMapping {
    path: PathBuf,
    kind: PoolKind,
    ceiling: u64,
    header: PoolHeader,
    replicas: ReplicaSet,
    state: Mutex<Vec<ReplicaState>>,
}

enum Target {
    Single,
    Set(PoolSetDescriptor),
}

impl Target {
    fn resolve(path: &Path) -> Result<Self> {
        if path.is_file() && PoolSetDescriptor::is_poolset_file(path)? {
            Ok(Target::Set(PoolSetDescriptor::load(path)?))
        } else {
            Ok(Target::Single)
        }
    }
}

impl PoolMapping {
    /// Create a new pool at `path` and map it
    ///
    /// `path` is a pool-set descriptor (then `size` must be 0) or a plain
    /// file. A plain file is created with `size` bytes, or, with `size` 0,
    /// an existing zeroed file is used as is. Files created before a failure
    /// are removed again.
    pub fn create(path: impl AsRef<Path>, layout: &str, size: u64, opts: &MapOptions) -> Result<Self> {
        let path = path.as_ref();
        let mut created = Vec::new();
        let result = Self::create_inner(path, layout, size, opts, &mut created);
        if result.is_err() {
            for file in &created {
                let _ = fs::remove_file(file);
            }
        }
        result
    }

    fn create_inner(
        path: &Path,
        layout: &str,
        size: u64,
        opts: &MapOptions,
        created: &mut Vec<PathBuf>,
    ) -> Result<Self> {
        if layout.len() > MAX_LAYOUT {
            return Err(Error::InvalidArgument(format!(
                "layout is {} bytes, the limit is {}",
                layout.len(),
                MAX_LAYOUT
            )));
        }
        let uuid = *Uuid::new_v4().as_bytes();

        let (kind, single_header, states, ceilings) = match Target::resolve(path)? {
            Target::Single => {
                let state = create_single_file(path, size, created)?;
                let len = state.committed();
                (PoolKind::SingleFile, true, vec![state], vec![len])
            }
            Target::Set(desc) => {
                if size != 0 {
                    return Err(Error::InvalidArgument(
                        "pool size must be 0 when creating from a pool set".into(),
                    ));
                }
                let ceilings = ceilings_of(&desc);
                if desc.is_directory_based() {
                    let states = create_directory_parts(&desc, created)?;
                    (PoolKind::DirectorySet, true, states, ceilings)
                } else {
                    let states = create_file_parts(&desc, uuid, created)?;
                    (PoolKind::FileSet, desc.single_header, states, ceilings)
                }
            }
        };

        let ceiling = ceilings.iter().copied().min().unwrap_or(0);
        let replicas = ReplicaSet::map(&states, &ceilings)?;
        let header = PoolHeader::new(uuid, layout, single_header, ceiling);
        write_pool_header(&replicas, &header)?;
        if opts.prefault {
            replicas.prefault();
        }

        info!(
            target: "pmobj::mapper",
            path = %path.display(),
            ?kind,
            replicas = states.len(),
            committed = replicas.committed(),
            ceiling,
            "Pool created"
        );

        Ok(PoolMapping {
            path: path.to_path_buf(),
            kind,
            ceiling,
            header,
            replicas,
            state: Mutex::new(states),
        })
    }

    /// Map an existing pool
    ///
    /// Leftovers of an interrupted growth are cleaned up first. The
    /// descriptor's reservation may grow between opens but never shrink.
    pub fn open(path: impl AsRef<Path>, opts: &MapOptions) -> Result<Self> {
        let path = path.as_ref();
        let mut part_headers = Vec::new();

        let (kind, desc, states, ceilings) = match Target::resolve(path)? {
            Target::Single => {
                let file = open_rw(path)?;
                let len = align_down(file.metadata()?.len());
                let state = ReplicaState {
                    dirs: Vec::new(),
                    parts: vec![MappedPart {
                        path: path.to_path_buf(),
                        file,
                        offset: 0,
                        len,
                        file_offset: 0,
                    }],
                };
                (PoolKind::SingleFile, None, vec![state], vec![len])
            }
            Target::Set(desc) => {
                let ceilings = ceilings_of(&desc);
                if desc.is_directory_based() {
                    let states = open_directory_parts(&desc)?;
                    (PoolKind::DirectorySet, Some(desc), states, ceilings)
                } else {
                    let states = open_file_parts(&desc, &mut part_headers)?;
                    (PoolKind::FileSet, Some(desc), states, ceilings)
                }
            }
        };
        for state in &states {
            state.lock()?;
        }

        let ceiling = ceilings.iter().copied().min().unwrap_or(0);
        let committed = states.first().map_or(0, ReplicaState::committed);
        if committed > ceiling {
            return Err(Error::DescriptorInvalid(format!(
                "address-space reservation of {} bytes is smaller than the {} bytes already in use",
                ceiling, committed
            )));
        }

        let replicas = ReplicaSet::map(&states, &ceilings)?;
        let mut header = read_pool_header(&replicas)?;

        if let Some(desc) = &desc {
            if kind == PoolKind::FileSet && header.single_header != desc.single_header {
                return Err(Error::DescriptorInvalid(
                    "OPTION SINGLEHDR does not match how the pool was created".into(),
                ));
            }
        }
        for (replica, part, ph) in &part_headers {
            if ph.pool_uuid != header.uuid || ph.replica != *replica || ph.part != *part {
                return Err(Error::Corruption(format!(
                    "part {} of replica {} belongs to a different pool or position",
                    part, replica
                )));
            }
        }
        let mut copy = vec![0u8; HEADER_COPY_SIZE as usize];
        for r in 1..replicas.ranges.len() {
            replicas.read_replica(r, 0, &mut copy)?;
            match PoolHeader::from_bytes(&copy) {
                Ok(h) if h.uuid == header.uuid => {}
                _ => {
                    return Err(Error::Corruption(format!(
                        "replica {} does not hold this pool",
                        r
                    )))
                }
            }
        }

        if ceiling < header.reservation {
            return Err(Error::DescriptorInvalid(format!(
                "address-space reservation decreased from {} to {} bytes",
                header.reservation, ceiling
            )));
        }
        if ceiling > header.reservation {
            info!(target: "pmobj::mapper", from = header.reservation, to = ceiling, "Address-space reservation increased");
            header.reservation = ceiling;
            write_pool_header(&replicas, &header)?;
        }
        if opts.prefault {
            replicas.prefault();
        }

        info!(
            target: "pmobj::mapper",
            path = %path.display(),
            ?kind,
            replicas = states.len(),
            committed,
            ceiling,
            "Pool opened"
        );

        Ok(PoolMapping {
            path: path.to_path_buf(),
            kind,
            ceiling,
            header,
            replicas,
            state: Mutex::new(states),
        })
    }

    /// Pool header as of open
    pub fn header(&self) -> &PoolHeader {
        &self.header
    }

    /// Path the pool was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How the pool is backed
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// True if growth can add parts
    pub fn is_growable(&self) -> bool {
        self.kind == PoolKind::DirectorySet
    }

    /// Effective address-space ceiling
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Number of replicas
    pub fn replica_count(&self) -> usize {
        self.replicas.ranges.len()
    }

    /// Number of parts in each replica
    pub fn part_count(&self) -> usize {
        self.state.lock().first().map_or(0, |s| s.parts.len())
    }

    /// Paths of the parts of `replica`, in logical order
    pub fn part_paths(&self, replica: usize) -> Vec<PathBuf> {
        self.state
            .lock()
            .get(replica)
            .map(|s| s.parts.iter().map(|p| p.path.clone()).collect())
            .unwrap_or_default()
    }

    /// Bytes growth can still add, bounded by the tightest replica
    pub fn headroom(&self) -> u64 {
        if !self.is_growable() {
            return 0;
        }
        self.state
            .lock()
            .iter()
            .map(ReplicaState::headroom)
            .min()
            .unwrap_or(0)
    }

    /// Read from a specific replica
    pub fn read_replica(&self, replica: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.replicas.read_replica(replica, offset, buf)
    }

    /// Add one part to every replica
    ///
    /// With `exact`, the part is `size` bytes (rounded up to a page) and must
    /// fit in a single directory of each replica. Otherwise the part is the
    /// lesser of `size` and the room left in the first directory of each
    /// replica that can hold a minimum part.
    ///
    /// # Errors
    ///
    /// - `PoolNotExtensible` if the pool has no growth directories
    /// - `OutOfAddressSpace` if any replica lacks room; no file is created
    ///
    /// On any error every replica is left as it was: files created for the
    /// new part are removed and nothing new stays mapped.
    pub fn grow(&self, size: u64, exact: bool) -> Result<RegionHandle> {
        if !self.is_growable() {
            return Err(Error::PoolNotExtensible(format!(
                "{} is not backed by growth directories",
                self.path.display()
            )));
        }

        let mut state = self.state.lock();
        let committed = self.replicas.committed();
        let want = if exact { align_up(size) } else { size };
        let need = if exact { want } else { MIN_PART };
        let available = state
            .iter()
            .map(|s| s.dirs.iter().map(DirSlot::headroom).max().unwrap_or(0))
            .min()
            .unwrap_or(0);
        let out_of_space = || Error::OutOfAddressSpace {
            requested: want,
            available,
        };

        let mut choices = Vec::with_capacity(state.len());
        let mut part_size = want;
        for replica in state.iter() {
            let dir = replica
                .dirs
                .iter()
                .position(|d| d.headroom() >= need)
                .ok_or_else(out_of_space)?;
            part_size = part_size.min(replica.dirs[dir].headroom());
            choices.push(dir);
        }
        let part_size = align_down(part_size);
        if part_size < MIN_PART || (exact && part_size < want) {
            return Err(out_of_space());
        }

        let index = state.first().map_or(0, |s| s.parts.len());
        let mut staged = Vec::with_capacity(state.len());
        for (replica, dir) in state.iter().zip(&choices) {
            match StagedPart::create(&replica.dirs[*dir].path, index, part_size) {
                Ok(s) => staged.push(s),
                Err(e) => {
                    staged.into_iter().for_each(StagedPart::abort);
                    return Err(e);
                }
            }
        }
        let paths = commit_staged(staged)?;
        let synced = state
            .iter()
            .zip(&choices)
            .try_for_each(|(replica, dir)| sync_dir(&replica.dirs[*dir].path));
        let files = match synced.and_then(|()| self.map_parts(committed, part_size, &paths)) {
            Ok(files) => files,
            Err(e) => {
                remove_parts(&paths);
                return Err(e);
            }
        };

        for (((replica, dir), path), file) in state.iter_mut().zip(&choices).zip(paths).zip(files) {
            replica.dirs[*dir].used += part_size;
            replica.parts.push(MappedPart {
                path,
                file,
                offset: committed,
                len: part_size,
                file_offset: 0,
            });
        }
        self.replicas
            .committed
            .store(committed + part_size, Ordering::Release);

        info!(
            target: "pmobj::mapper",
            part = index,
            size = part_size,
            committed = committed + part_size,
            "Pool grown"
        );

        Ok(RegionHandle {
            part_index: index,
            offset: committed,
            len: part_size,
        })
    }

    /// Map `paths[r]` at `offset` in replica `r`, for every replica or none
    fn map_parts(&self, offset: u64, len: u64, paths: &[PathBuf]) -> Result<Vec<File>> {
        let mut files = Vec::with_capacity(paths.len());
        for (range, path) in self.replicas.ranges.iter().zip(paths) {
            let mapped = open_rw(path).and_then(|file| {
                range.map_file(offset, len, &file, 0)?;
                Ok(file)
            });
            match mapped {
                Ok(file) => files.push(file),
                Err(e) => {
                    for range in &self.replicas.ranges[..files.len()] {
                        if let Err(release) = range.release(offset, len) {
                            warn!(target: "pmobj::mapper", offset, error = %release, "Failed to unmap part");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(files)
    }
}

impl PersistentMemory for PoolMapping {
    fn base(&self) -> *mut u8 {
        self.replicas.base()
    }

    fn committed(&self) -> u64 {
        self.replicas.committed()
    }

    fn persist(&self, offset: u64, len: u64) -> Result<()> {
        self.replicas.persist(offset, len)
    }
}

fn lock_file(file: &File, path: &Path) -> Result<()> {
    file.try_lock_exclusive().map_err(|e| {
        if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            Error::PoolInUse(path.to_path_buf())
        } else {
            Error::Io(e)
        }
    })
}

fn ceilings_of(desc: &PoolSetDescriptor) -> Vec<u64> {
    desc.replicas
        .iter()
        .map(|r| align_down(r.ceiling(desc.single_header)))
        .collect()
}

fn create_single_file(path: &Path, size: u64, created: &mut Vec<PathBuf>) -> Result<ReplicaState> {
    let (file, len) = if size == 0 {
        let mut file = open_rw(path)?;
        let len = file.metadata()?.len();
        let mut head = [0u8; 64];
        file.read_exact(&mut head)?;
        if head.iter().any(|b| *b != 0) {
            return Err(Error::PoolExists(path.to_path_buf()));
        }
        (file, len)
    } else {
        let file = create_sized(path, size)?;
        created.push(path.to_path_buf());
        (file, size)
    };
    if len < MIN_POOL {
        return Err(Error::InvalidArgument(format!(
            "pool size {} is below the minimum of {}",
            len, MIN_POOL
        )));
    }
    let state = ReplicaState {
        dirs: Vec::new(),
        parts: vec![MappedPart {
            path: path.to_path_buf(),
            file,
            offset: 0,
            len: align_down(len),
            file_offset: 0,
        }],
    };
    state.lock()?;
    Ok(state)
}

fn create_file_parts(
    desc: &PoolSetDescriptor,
    uuid: [u8; 16],
    created: &mut Vec<PathBuf>,
) -> Result<Vec<ReplicaState>> {
    let mut states = Vec::with_capacity(desc.replicas.len());
    for (r, replica) in desc.replicas.iter().enumerate() {
        let mut state = ReplicaState::default();
        let mut offset = 0;
        for (i, part) in replica.parts.iter().enumerate() {
            let mut file = create_sized(&part.path, part.size)?;
            created.push(part.path.clone());
            let file_offset = if desc.single_header {
                0
            } else {
                PartHeader {
                    pool_uuid: uuid,
                    replica: r as u32,
                    part: i as u32,
                    size: part.size,
                }
                .write_to(&mut file)?;
                PART_HEADER_SIZE
            };
            let len = part.size - file_offset;
            state.parts.push(MappedPart {
                path: part.path.clone(),
                file,
                offset,
                len,
                file_offset,
            });
            offset += len;
        }
        state.lock()?;
        states.push(state);
    }
    Ok(states)
}

fn directory_slots(parts: &[crate::poolset::PartDesc]) -> Vec<DirSlot> {
    parts
        .iter()
        .filter(|p| p.kind == PartKind::Directory)
        .map(|p| DirSlot {
            path: p.path.clone(),
            reservation: p.size,
            used: 0,
        })
        .collect()
}

fn create_directory_parts(
    desc: &PoolSetDescriptor,
    created: &mut Vec<PathBuf>,
) -> Result<Vec<ReplicaState>> {
    for replica in &desc.replicas {
        let dirs: Vec<PathBuf> = replica.parts.iter().map(|p| p.path.clone()).collect();
        if let Some(existing) = any_parts_exist(&dirs)? {
            return Err(Error::PoolExists(existing));
        }
    }

    let mut states = Vec::with_capacity(desc.replicas.len());
    for replica in &desc.replicas {
        let mut dirs = directory_slots(&replica.parts);
        let path = StagedPart::create(&dirs[0].path, 0, MIN_POOL)?.commit()?;
        created.push(path.clone());
        sync_dir(&dirs[0].path)?;
        dirs[0].used = MIN_POOL;
        let state = ReplicaState {
            dirs,
            parts: vec![MappedPart {
                file: open_rw(&path)?,
                path,
                offset: 0,
                len: MIN_POOL,
                file_offset: 0,
            }],
        };
        state.lock()?;
        states.push(state);
    }
    Ok(states)
}

fn open_file_parts(
    desc: &PoolSetDescriptor,
    part_headers: &mut Vec<(u32, u32, PartHeader)>,
) -> Result<Vec<ReplicaState>> {
    let mut states = Vec::with_capacity(desc.replicas.len());
    for (r, replica) in desc.replicas.iter().enumerate() {
        let mut state = ReplicaState::default();
        let mut offset = 0;
        for (i, part) in replica.parts.iter().enumerate() {
            let mut file = open_rw(&part.path)?;
            let actual = file.metadata()?.len();
            if actual != part.size {
                return Err(Error::Corruption(format!(
                    "part {} is {} bytes, the descriptor says {}",
                    part.path.display(),
                    actual,
                    part.size
                )));
            }
            let file_offset = if desc.single_header {
                0
            } else {
                part_headers.push((r as u32, i as u32, PartHeader::read_from(&mut file)?));
                PART_HEADER_SIZE
            };
            let len = part.size - file_offset;
            state.parts.push(MappedPart {
                path: part.path.clone(),
                file,
                offset,
                len,
                file_offset,
            });
            offset += len;
        }
        states.push(state);
    }
    Ok(states)
}

fn open_directory_parts(desc: &PoolSetDescriptor) -> Result<Vec<ReplicaState>> {
    let mut found = Vec::with_capacity(desc.replicas.len());
    for replica in &desc.replicas {
        let dirs: Vec<PathBuf> = replica.parts.iter().map(|p| p.path.clone()).collect();
        found.push(scan_directories(&dirs)?);
    }

    let count = found.iter().map(Vec::len).min().unwrap_or(0);
    if count == 0 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "no pool parts found in the replica directories",
        )));
    }
    for replica in found.iter_mut() {
        for extra in replica.drain(count..) {
            warn!(target: "pmobj::mapper", path = %extra.path.display(), "Discarding part from interrupted growth");
            fs::remove_file(&extra.path)?;
        }
    }
    for index in 0..count {
        let len = found[0][index].len;
        if found.iter().any(|parts| parts[index].len != len) {
            return Err(Error::Corruption(format!(
                "part {} differs in size between replicas",
                index
            )));
        }
    }

    let mut states = Vec::with_capacity(found.len());
    for (replica, parts) in desc.replicas.iter().zip(found) {
        let mut state = ReplicaState {
            dirs: directory_slots(&replica.parts),
            parts: Vec::with_capacity(parts.len()),
        };
        let mut offset = 0;
        for part in parts {
            state.dirs[part.dir].used += part.len;
            state.parts.push(MappedPart {
                file: open_rw(&part.path)?,
                path: part.path,
                offset,
                len: part.len,
                file_offset: 0,
            });
            offset += part.len;
        }
        states.push(state);
    }
    Ok(states)
}
