//! Pool handle
//!
//! [`Pool`] ties the layers together:
//! - the mapping (storage crate) provides the flat, mirrored address space
//! - the action log (durability crate) is replayed before anything else
//! - the heap (heap crate) is loaded from the replayed metadata
//! - the extension controller grows the mapping when the heap runs dry
//!
//! Every public operation records its failure in the thread's last-error
//! slot, see [`pmobj_core::errormsg`].

use std::path::Path;
use std::sync::Arc;

use pmobj_core::{record_error, Error, ObjectId, PersistentMemory, Result};
use pmobj_durability::{ActionLog, CrashPoint, PublishOutcome};
use pmobj_heap::{merge_entries, Heap, HeapStatsSnapshot, ObjectInfo};
use pmobj_storage::{MapOptions, PoolKind, PoolMapping};
use tracing::{debug, info, warn};

use crate::action::{Action, AllocFlags};
use crate::config::PoolOptions;
use crate::extend::ExtensionController;

pub(crate) struct PoolInner {
    pub(crate) mapping: Arc<PoolMapping>,
    pub(crate) heap: Arc<Heap>,
    pub(crate) log: ActionLog,
    pub(crate) extension: ExtensionController,
    pub(crate) uuid_lo: u64,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        info!(target: "pmobj::pool", path = %self.mapping.path().display(), "Pool closed");
    }
}

/// An open pool
///
/// Cheap to clone; all clones share one mapping. The pool closes when the
/// last clone is dropped or [`close`](Pool::close)d.
///
/// # Example
///
/// ```ignore
/// use pmobj::Pool;
///
/// let pool = Pool::create("/mnt/pmem/pool.set", "app", 0)?;
/// let mut batch = vec![pool.reserve(4096)?, pool.reserve(4096)?];
/// for action in &batch {
///     pool.write(action.object_id(), 0, b"hello")?;
/// }
/// pool.publish(&mut batch)?;
/// ```
#[derive(Clone)]
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool with default options
    ///
    /// `path` is either a pool-set descriptor (then `size` must be 0) or a
    /// plain file of `size` bytes (0 = use an existing zeroed file).
    pub fn create(path: impl AsRef<Path>, layout: &str, size: u64) -> Result<Pool> {
        Self::create_with_options(path, layout, size, &PoolOptions::default())
    }

    /// Create a pool
    ///
    /// # Errors
    ///
    /// - `DescriptorInvalid` for a malformed or inconsistent pool set
    /// - `PoolExists` if part files already exist
    /// - `InvalidGranularity` / `InvalidArgument` for bad options
    pub fn create_with_options(
        path: impl AsRef<Path>,
        layout: &str,
        size: u64,
        options: &PoolOptions,
    ) -> Result<Pool> {
        record_error((|| {
            let options = options.resolve()?;
            let map_options = MapOptions {
                prefault: options.prefault_at_create,
            };
            let mapping = PoolMapping::create(path.as_ref(), layout, size, &map_options)?;
            Self::assemble(mapping, &options)
        })())
    }

    /// Open a pool with default options
    ///
    /// With `layout`, the pool's layout identifier must match.
    pub fn open(path: impl AsRef<Path>, layout: Option<&str>) -> Result<Pool> {
        Self::open_with_options(path, layout, &PoolOptions::default())
    }

    /// Open a pool
    ///
    /// Committed batches left by a crash are replayed before the heap is
    /// loaded.
    ///
    /// # Errors
    ///
    /// - `LayoutMismatch` if `layout` differs from the stored one
    /// - `PoolInUse` if another handle has the pool open
    /// - `Corruption` if metadata fails validation
    pub fn open_with_options(
        path: impl AsRef<Path>,
        layout: Option<&str>,
        options: &PoolOptions,
    ) -> Result<Pool> {
        record_error((|| {
            let options = options.resolve()?;
            let map_options = MapOptions {
                prefault: options.prefault_at_open,
            };
            let mapping = PoolMapping::open(path.as_ref(), &map_options)?;
            if let Some(expected) = layout {
                if mapping.header().layout != expected {
                    return Err(Error::LayoutMismatch {
                        expected: expected.to_string(),
                        found: mapping.header().layout.clone(),
                    });
                }
            }
            Self::assemble(mapping, &options)
        })())
    }

    fn assemble(mapping: PoolMapping, options: &PoolOptions) -> Result<Pool> {
        let mapping = Arc::new(mapping);
        let mem: Arc<dyn PersistentMemory> = mapping.clone();
        Self::assemble_with(mapping, options, mem)
    }

    /// Build the pool with the log and heap going through `mem`, a view of
    /// `mapping`'s address space
    fn assemble_with(
        mapping: Arc<PoolMapping>,
        options: &PoolOptions,
        mem: Arc<dyn PersistentMemory>,
    ) -> Result<Pool> {
        let log = ActionLog::new(mem.clone());
        let recovery = log.recover()?;
        let heap = Arc::new(Heap::open(mem, options.stats_enabled)?);
        let pool = Pool {
            inner: Arc::new(PoolInner {
                uuid_lo: mapping.header().uuid_lo(),
                extension: ExtensionController::new(options.granularity)?,
                mapping,
                heap,
                log,
            }),
        };
        for (key, value) in &options.queries {
            pool.apply_query(key, value)?;
        }

        info!(
            target: "pmobj::pool",
            path = %pool.path().display(),
            layout = %pool.layout(),
            committed = pool.committed(),
            ceiling = pool.ceiling(),
            replicas = pool.replica_count(),
            replayed = recovery.lanes_replayed,
            "Pool ready"
        );
        Ok(pool)
    }

    /// Open the pool and validate its metadata
    ///
    /// Returns `Ok(false)` if the pool is corrupt. Opening replays committed
    /// batches, so a pool that crashed mid-publish checks clean.
    pub fn check(path: impl AsRef<Path>, layout: Option<&str>) -> Result<bool> {
        let options = PoolOptions::default();
        let result = Self::open_with_options(path, layout, &options).and_then(|pool| pool.inner.heap.check());
        match result {
            Ok(()) => Ok(true),
            Err(Error::Corruption(msg)) => {
                warn!(target: "pmobj::pool", reason = %msg, "Pool check failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Close this handle
    pub fn close(self) {
        drop(self);
    }

    // ========================================================================
    // Reserve / publish
    // ========================================================================

    /// Reserve `size` bytes
    pub fn reserve(&self, size: u64) -> Result<Action> {
        self.reserve_with(size, 0, AllocFlags::default())
    }

    /// Reserve `size` bytes with a type number and flags
    ///
    /// Grows the pool if the heap is out of space and growth is enabled.
    ///
    /// # Errors
    ///
    /// `OutOfSpace` if no block fits even after growth, `InvalidArgument`
    /// for a zero size or an unknown class.
    pub fn reserve_with(&self, size: u64, type_num: u64, flags: AllocFlags) -> Result<Action> {
        let inner = &self.inner;
        record_error(
            inner
                .extension
                .with_growth(&inner.mapping, &inner.heap, size, flags.class, || {
                    inner.heap.reserve(size, type_num, flags.class, flags.zero)
                })
                .map(|res| Action::reserve(res, inner.heap.clone(), inner.uuid_lo)),
        )
    }

    /// Schedule `id` to be freed on publish
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `id` is not a published object of this pool or
    /// is already scheduled.
    pub fn defer_free(&self, id: ObjectId) -> Result<Action> {
        record_error((|| {
            let info = self.resolve(id, false)?;
            self.inner.heap.mark_pending_free(id.off)?;
            Ok(Action::defer_free(info.block, id.off, self.inner.heap.clone(), self.inner.uuid_lo))
        })())
    }

    /// Publish `actions` as one atomic batch
    ///
    /// On success the vector is drained. A failure before the batch became
    /// durable leaves both the vector and the pool untouched.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if an action belongs to another pool
    /// - `BatchTooLarge` if the batch does not fit in one log lane
    /// - `CommittedNotApplied` if the batch is durable but could not be
    ///   applied; the vector is drained as on success, and every later
    ///   publish fails with `RecoveryRequired` until the pool is reopened
    pub fn publish(&self, actions: &mut Vec<Action>) -> Result<()> {
        record_error(self.publish_batch(actions, None).map(|_| ()))
    }

    fn publish_batch(&self, actions: &mut Vec<Action>, crash: Option<CrashPoint>) -> Result<PublishOutcome> {
        if actions.is_empty() {
            return Ok(PublishOutcome::Completed);
        }
        let inner = &self.inner;
        if actions.iter().any(|a| !a.belongs_to(&inner.heap)) {
            return Err(Error::InvalidArgument("action belongs to another pool".into()));
        }
        let entries = merge_entries(actions.iter().map(Action::redo_entry).collect());
        if entries.len() > ActionLog::capacity() {
            return Err(Error::BatchTooLarge {
                entries: entries.len(),
                capacity: ActionLog::capacity(),
            });
        }

        let _visible = inner.heap.visibility();
        let outcome = match inner.log.publish_until(
            &entries,
            || {
                for (offset, len) in actions.iter().filter_map(Action::payload) {
                    inner.mapping.persist(offset, len)?;
                }
                Ok(())
            },
            crash,
        ) {
            Ok(outcome) => outcome,
            Err(Error::CommittedNotApplied(reason)) => {
                // Replay will make the batch visible; its blocks are no longer ours to reuse.
                for action in actions.drain(..) {
                    action.published();
                }
                warn!(target: "pmobj::pool", reason = %reason, "Batch committed but not applied, reopen to replay");
                return Err(Error::CommittedNotApplied(reason));
            }
            Err(e) => return Err(e),
        };
        if let PublishOutcome::Interrupted(point) = outcome {
            return Ok(PublishOutcome::Interrupted(point));
        }

        let count = actions.len();
        for action in actions.drain(..) {
            action.published();
        }
        debug!(target: "pmobj::pool", actions = count, entries = entries.len(), "Published");
        Ok(outcome)
    }

    /// Cancel `actions`: reservations are released, deferred frees dropped
    pub fn cancel(&self, actions: Vec<Action>) {
        let count = actions.len();
        drop(actions);
        debug!(target: "pmobj::pool", actions = count, "Cancelled");
    }

    /// Publish `actions` but stop at `point`, then drop the pool without cleanup
    ///
    /// Simulates the process dying mid-publish; reopen the pool to observe
    /// recovery. Other clones of this handle keep the pool mapped.
    pub fn publish_interrupted(self, mut actions: Vec<Action>, point: CrashPoint) -> Result<()> {
        let outcome = self.publish_batch(&mut actions, Some(point));
        for action in actions {
            action.abandon();
        }
        warn!(target: "pmobj::pool", point = point.description(), "Publish interrupted");
        drop(self);
        outcome.map(|_| ())
    }

    // ========================================================================
    // Single-action conveniences
    // ========================================================================

    /// Allocate and publish `size` bytes
    pub fn alloc(&self, size: u64) -> Result<ObjectId> {
        self.alloc_with(size, 0, AllocFlags::default())
    }

    /// Allocate and publish with a type number and flags
    pub fn alloc_with(&self, size: u64, type_num: u64, flags: AllocFlags) -> Result<ObjectId> {
        let action = self.reserve_with(size, type_num, flags)?;
        let id = action.object_id();
        self.publish(&mut vec![action])?;
        Ok(id)
    }

    /// Free a published object
    pub fn free(&self, id: ObjectId) -> Result<()> {
        let action = self.defer_free(id)?;
        self.publish(&mut vec![action])
    }

    // ========================================================================
    // Object data
    // ========================================================================

    fn resolve(&self, id: ObjectId, include_reserved: bool) -> Result<ObjectInfo> {
        if id.is_null() {
            return Err(Error::InvalidArgument("null object id".into()));
        }
        if id.pool_uuid_lo != self.inner.uuid_lo {
            return Err(Error::InvalidArgument(format!("object {} belongs to another pool", id)));
        }
        self.inner.heap.object(id.off, include_reserved)
    }

    fn resolve_range(&self, id: ObjectId, offset: u64, len: u64) -> Result<u64> {
        let info = self.resolve(id, true)?;
        match offset.checked_add(len) {
            Some(end) if end <= info.usable => Ok(id.off + offset),
            _ => Err(Error::InvalidArgument(format!(
                "range {}+{} exceeds the {} usable bytes of {}",
                offset, len, info.usable, id
            ))),
        }
    }

    /// Copy `data` into the object at `offset`; not durable until persisted or published
    pub fn write(&self, id: ObjectId, offset: u64, data: &[u8]) -> Result<()> {
        record_error((|| {
            let at = self.resolve_range(id, offset, data.len() as u64)?;
            self.inner.mapping.write(at, data)
        })())
    }

    /// Whole usable payload of the object
    pub fn read(&self, id: ObjectId) -> Result<Vec<u8>> {
        record_error((|| {
            let info = self.resolve(id, true)?;
            let mut buf = vec![0u8; info.usable as usize];
            self.inner.mapping.read(id.off, &mut buf)?;
            Ok(buf)
        })())
    }

    /// Fill `buf` from the object at `offset`
    pub fn read_at(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<()> {
        record_error((|| {
            let at = self.resolve_range(id, offset, buf.len() as u64)?;
            self.inner.mapping.read(at, buf)
        })())
    }

    /// Make the object's payload durable in every replica
    pub fn persist(&self, id: ObjectId) -> Result<()> {
        record_error((|| {
            let info = self.resolve(id, true)?;
            self.inner.mapping.persist(id.off, info.usable)
        })())
    }

    /// Type number given at reservation
    pub fn type_num(&self, id: ObjectId) -> Result<u64> {
        record_error(self.resolve(id, true).and_then(|_| self.inner.heap.type_num(id.off)))
    }

    /// Usable bytes of a published object (at least the requested size)
    pub fn usable_size(&self, id: ObjectId) -> Result<u64> {
        record_error(self.resolve(id, false).map(|info| info.usable))
    }

    /// Raw pointer to the object's data
    ///
    /// # Safety
    ///
    /// The pointer is valid for [`usable_size`](Pool::usable_size) bytes
    /// while the pool is open and the object is not freed. Writes through it
    /// are not durable until [`persist`](Pool::persist) or publish.
    pub unsafe fn direct(&self, id: ObjectId) -> Result<*mut u8> {
        record_error(
            self.resolve(id, true)
                .map(|_| self.inner.mapping.base().add(id.off as usize)),
        )
    }

    // ========================================================================
    // Enumeration
    // ========================================================================

    /// First published object in offset order
    pub fn first(&self) -> Option<ObjectId> {
        self.inner
            .heap
            .next_object(None)
            .map(|off| ObjectId::new(self.inner.uuid_lo, off))
    }

    /// Published object following `id`
    pub fn next(&self, id: ObjectId) -> Option<ObjectId> {
        self.inner
            .heap
            .next_object(Some(id.off))
            .map(|off| ObjectId::new(self.inner.uuid_lo, off))
    }

    /// Iterate over published objects
    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        std::iter::successors(self.first(), move |id| self.next(*id))
    }

    // ========================================================================
    // Growth and introspection
    // ========================================================================

    /// Grow the pool by exactly `size` bytes
    pub fn extend(&self, size: u64) -> Result<u64> {
        let inner = &self.inner;
        record_error(inner.extension.extend(&inner.mapping, &inner.heap, size))
    }

    /// Low 64 bits of the pool UUID
    pub fn uuid_lo(&self) -> u64 {
        self.inner.uuid_lo
    }

    /// Layout identifier
    pub fn layout(&self) -> &str {
        &self.inner.mapping.header().layout
    }

    /// Path the pool was opened from
    pub fn path(&self) -> &Path {
        self.inner.mapping.path()
    }

    /// How the pool is backed
    pub fn kind(&self) -> PoolKind {
        self.inner.mapping.kind()
    }

    /// True if the pool can grow
    pub fn is_growable(&self) -> bool {
        self.inner.mapping.is_growable()
    }

    /// Committed size in bytes
    pub fn committed(&self) -> u64 {
        self.inner.mapping.committed()
    }

    /// Address-space ceiling in bytes
    pub fn ceiling(&self) -> u64 {
        self.inner.mapping.ceiling()
    }

    /// Number of replicas
    pub fn replica_count(&self) -> usize {
        self.inner.mapping.replica_count()
    }

    /// Parts per replica
    pub fn part_count(&self) -> usize {
        self.inner.mapping.part_count()
    }

    /// Part file paths of `replica`
    pub fn part_paths(&self, replica: usize) -> Vec<std::path::PathBuf> {
        self.inner.mapping.part_paths(replica)
    }

    /// Read straight from one replica, bypassing the primary
    pub fn read_replica(&self, replica: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.mapping.read_replica(replica, offset, buf)
    }

    /// Heap statistics
    pub fn stats(&self) -> HeapStatsSnapshot {
        self.inner.heap.stats_snapshot()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("path", &self.path())
            .field("uuid_lo", &format_args!("{:016x}", self.uuid_lo()))
            .field("committed", &self.committed())
            .finish()
    }
}
