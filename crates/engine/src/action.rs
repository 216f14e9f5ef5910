//! Pending actions
//!
//! An [`Action`] is one step of a logical transaction: space that was
//! reserved, or an object scheduled to be freed. Nothing an action does is
//! observable until it is published. Dropping an unpublished action cancels
//! it, so a reservation cannot leak.

use std::sync::Arc;

use pmobj_core::ObjectId;
use pmobj_durability::RedoEntry;
use pmobj_heap::{Block, Heap, Reservation};

/// What an action will do when published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Space claimed, not yet visible
    Reserve(Reservation),
    /// Published object to release
    DeferFree {
        /// Block backing the object
        block: Block,
        /// Offset of the object's data
        offset: u64,
    },
}

/// Flags for [`Pool::reserve_with`](crate::Pool::reserve_with)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    /// Zero the usable bytes
    pub zero: bool,
    /// Allocation class to serve the request from (0 = huge)
    pub class: Option<u8>,
}

impl AllocFlags {
    /// No flags
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-initialise
    pub fn zeroed(mut self) -> Self {
        self.zero = true;
        self
    }

    /// Use class `id`
    pub fn class(mut self, id: u8) -> Self {
        self.class = Some(id);
        self
    }
}

/// A reserved allocation or a deferred free
pub struct Action {
    kind: ActionKind,
    heap: Arc<Heap>,
    pool_uuid_lo: u64,
    settled: bool,
}

impl Action {
    pub(crate) fn reserve(res: Reservation, heap: Arc<Heap>, pool_uuid_lo: u64) -> Self {
        Action {
            kind: ActionKind::Reserve(res),
            heap,
            pool_uuid_lo,
            settled: false,
        }
    }

    pub(crate) fn defer_free(block: Block, offset: u64, heap: Arc<Heap>, pool_uuid_lo: u64) -> Self {
        Action {
            kind: ActionKind::DeferFree { block, offset },
            heap,
            pool_uuid_lo,
            settled: false,
        }
    }

    /// Object the action concerns
    pub fn object_id(&self) -> ObjectId {
        let off = match self.kind {
            ActionKind::Reserve(res) => res.offset,
            ActionKind::DeferFree { offset, .. } => offset,
        };
        ObjectId::new(self.pool_uuid_lo, off)
    }

    /// What the action does
    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    /// Usable bytes of a reservation; 0 for a deferred free
    pub fn usable_size(&self) -> u64 {
        match self.kind {
            ActionKind::Reserve(res) => res.usable,
            ActionKind::DeferFree { .. } => 0,
        }
    }

    pub(crate) fn belongs_to(&self, heap: &Arc<Heap>) -> bool {
        Arc::ptr_eq(&self.heap, heap)
    }

    pub(crate) fn redo_entry(&self) -> RedoEntry {
        match &self.kind {
            ActionKind::Reserve(res) => self.heap.alloc_entry(res),
            ActionKind::DeferFree { block, .. } => self.heap.free_entry(block),
        }
    }

    /// Range to flush before the commit point
    pub(crate) fn payload(&self) -> Option<(u64, u64)> {
        match self.kind {
            ActionKind::Reserve(res) => Some(res.extent()),
            ActionKind::DeferFree { .. } => None,
        }
    }

    /// Bring volatile heap state in line with a completed publish
    pub(crate) fn published(mut self) {
        match self.kind {
            ActionKind::Reserve(res) => self.heap.commit(&res.block),
            ActionKind::DeferFree { block, offset } => {
                self.heap.release(&block);
                self.heap.clear_pending_free(offset);
            }
        }
        self.settled = true;
    }

    /// Leave the heap as it is, for simulated crashes
    pub(crate) fn abandon(mut self) {
        self.settled = true;
    }

    fn cancel(&mut self) {
        if self.settled {
            return;
        }
        match self.kind {
            ActionKind::Reserve(res) => self.heap.cancel(&res.block),
            ActionKind::DeferFree { offset, .. } => self.heap.clear_pending_free(offset),
        }
        self.settled = true;
    }
}

impl Drop for Action {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("object", &self.object_id())
            .field("settled", &self.settled)
            .finish()
    }
}
