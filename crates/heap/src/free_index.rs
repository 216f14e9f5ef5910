//! Free-chunk index
//!
//! Free chunk ranges kept twice: by start for coalescing, and by
//! (length, start) for best-fit lookup. Ranges never cross a zone.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunk::{zone_of, ChunkId};

/// Best-fit index of free chunk ranges
#[derive(Debug, Default, Clone)]
pub struct FreeIndex {
    by_start: BTreeMap<ChunkId, u32>,
    by_len: BTreeSet<(u32, ChunkId)>,
}

impl FreeIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[start, start + len)`, merging with neighbours in the same zone
    pub fn insert(&mut self, start: ChunkId, len: u32) {
        if len == 0 {
            return;
        }
        let mut start = start;
        let mut len = len;

        if let Some((&prev, &prev_len)) = self.by_start.range(..start).next_back() {
            if prev + prev_len == start && zone_of(prev) == zone_of(start) {
                self.remove(prev, prev_len);
                start = prev;
                len += prev_len;
            }
        }
        let end = start + len;
        if let Some(&next_len) = self.by_start.get(&end) {
            if zone_of(end) == zone_of(start) {
                self.remove(end, next_len);
                len += next_len;
            }
        }

        self.by_start.insert(start, len);
        self.by_len.insert((len, start));
    }

    /// Take the smallest range of at least `len` chunks, lowest start first
    pub fn take(&mut self, len: u32) -> Option<ChunkId> {
        let &(found_len, start) = self.by_len.range((len, 0)..).next()?;
        self.remove(start, found_len);
        if found_len > len {
            self.by_start.insert(start + len, found_len - len);
            self.by_len.insert((found_len - len, start + len));
        }
        Some(start)
    }

    /// Start of the free range ending exactly at `end`, if any
    pub fn range_ending_at(&self, end: ChunkId) -> Option<ChunkId> {
        let (&start, &len) = self.by_start.range(..end).next_back()?;
        (start + len == end).then_some(start)
    }

    /// True if `id` lies in a free range
    pub fn contains(&self, id: ChunkId) -> bool {
        self.by_start
            .range(..=id)
            .next_back()
            .map_or(false, |(&start, &len)| id < start + len)
    }

    /// Total free chunks
    pub fn total(&self) -> u64 {
        self.by_start.values().map(|l| *l as u64).sum()
    }

    /// Free ranges in start order
    pub fn ranges(&self) -> impl Iterator<Item = (ChunkId, u32)> + '_ {
        self.by_start.iter().map(|(s, l)| (*s, *l))
    }

    fn remove(&mut self, start: ChunkId, len: u32) {
        self.by_start.remove(&start);
        self.by_len.remove(&(len, start));
    }
}
