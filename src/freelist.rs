//! Reclaimable page-id tracking
//!
//! A page superseded by copy-on-write (or unlinked by a structural
//! replace) stays readable until the checkpoint that makes its replacement
//! durable, so its id is pended under the generation that superseded it.
//! `release` moves matured ids into the reusable pool once that generation
//! has become stable. The list is in-memory only; ids still pending at
//! close leak until the file is rebuilt, and the header's last-page-id
//! keeps allocation monotonic across reopens.

use crate::error::PageId;

/// Two-stage free list: pending until stable, then reusable
#[derive(Debug, Default)]
pub struct FreeList {
    pending: Vec<(u64, PageId)>,
    free: Vec<PageId>,
}

impl FreeList {
    /// Create an empty free list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a superseded page under the generation that replaced it
    pub fn pend(&mut self, id: PageId, generation: u64) {
        debug_assert!(id.is_some());
        self.pending.push((generation, id));
    }

    /// Move ids whose superseding generation is now stable into the pool
    pub fn release(&mut self, stable_generation: u64) {
        let mut kept = Vec::new();
        for (generation, id) in self.pending.drain(..) {
            if generation <= stable_generation {
                self.free.push(id);
            } else {
                kept.push((generation, id));
            }
        }
        self.pending = kept;
    }

    /// Take a reusable id, if any
    pub fn acquire(&mut self) -> Option<PageId> {
        self.free.pop()
    }

    /// Ids awaiting their superseding checkpoint
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ids ready for reuse
    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}
