//! Range-scan cursor
//!
//! A `Seeker` yields `(key, value)` pairs in ascending order over
//! `[from, to)`. Each refill buffers one leaf under a shared latch and
//! drops the latch before yielding, so nothing is pinned across caller
//! code and abandoning a cursor releases everything.
//!
//! Concurrent structural changes are tolerated three ways, cheapest
//! first: a copied-on-write leaf is reached through its successor
//! pointer; a split that moved the resume point rightward is chased
//! through the right-sibling chain; and a page whose generation postdates
//! the cursor's snapshot (reclaimed and reused since the last descent)
//! forces a fresh descent from the current root at the resume key.

use crate::cache::PageRead;
use crate::error::{Error, PageId, Result};
use crate::layout::Layout;
use crate::page::SearchResult;
use crate::tree::{TreeInner, MAX_TREE_DEPTH};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

/// Ordered cursor over a key range; see [`crate::Tree::seek`]
pub struct Seeker<L: Layout> {
    inner: Arc<TreeInner>,
    to: Option<Vec<u8>>,
    from: Vec<u8>,
    resume: Option<Vec<u8>>,
    buffered: VecDeque<(Vec<u8>, Vec<u8>)>,
    next_leaf: PageId,
    snapshot_generation: u64,
    exhausted: bool,
    _layout: PhantomData<L>,
}

impl<L: Layout> Seeker<L> {
    pub(crate) fn new(inner: Arc<TreeInner>, from: Vec<u8>, to: Option<Vec<u8>>) -> Self {
        let exhausted = match &to {
            Some(to) => L::compare(&from, to) != std::cmp::Ordering::Less,
            None => false,
        };
        Self {
            inner,
            to,
            from,
            resume: None,
            buffered: VecDeque::new(),
            next_leaf: PageId::NONE,
            snapshot_generation: 0,
            exhausted,
            _layout: PhantomData,
        }
    }

    /// Latch a page, following its successor chain to the current version
    fn latch_current(&self, id: PageId) -> Result<PageRead> {
        let mut guard = self.inner.cache.shared(id)?;
        let mut hops = 0;
        while guard.successor().is_some() {
            hops += 1;
            if hops > MAX_TREE_DEPTH {
                return Err(Error::CorruptIndex(format!(
                    "successor chain from page {id} exceeds {MAX_TREE_DEPTH} hops"
                )));
            }
            let next = guard.successor();
            guard = self.inner.cache.shared(next)?;
        }
        Ok(guard)
    }

    /// Descend from the current root to the leaf covering the resume point
    fn descend(&mut self) -> Result<PageId> {
        let (mut id, unstable) = {
            let state = self.inner.state.read();
            (state.root_id, state.unstable_generation)
        };
        self.snapshot_generation = unstable;

        let target: &[u8] = self.resume.as_deref().unwrap_or(&self.from);
        for _ in 0..MAX_TREE_DEPTH {
            let guard = self.latch_current(id)?;
            guard.validate(guard.id())?;
            if guard.is_leaf() {
                return Ok(guard.id());
            }
            let child_idx = match guard.search::<L>(target)? {
                SearchResult::Found { index } => index + 1,
                SearchResult::NotFound { insert_pos } => insert_pos,
            };
            id = guard.child_at(child_idx)?;
        }
        Err(Error::CorruptIndex(format!("tree deeper than {MAX_TREE_DEPTH} levels during seek")))
    }

    /// Buffer the next run of matching entries, one leaf at a time
    fn refill(&mut self) -> Result<()> {
        debug_assert!(self.buffered.is_empty());
        loop {
            let leaf_id = if self.next_leaf.is_some() {
                self.next_leaf
            } else {
                let id = self.descend()?;
                self.next_leaf = id;
                id
            };

            let guard = self.latch_current(leaf_id)?;
            if guard.generation() > self.snapshot_generation {
                // page may have been reclaimed and reused since our last
                // descent; the sibling chain can no longer be trusted
                self.next_leaf = PageId::NONE;
                continue;
            }
            guard.validate(guard.id())?;
            if !guard.is_leaf() {
                return Err(Error::CorruptPage {
                    details: "leaf chain reached a non-leaf page".into(),
                    page_id: Some(guard.id()),
                });
            }

            let start = match self.resume.as_deref() {
                Some(resume) => match guard.search::<L>(resume)? {
                    SearchResult::Found { index } => index + 1,
                    SearchResult::NotFound { insert_pos } => insert_pos,
                },
                None => match guard.search::<L>(&self.from)? {
                    SearchResult::Found { index } => index,
                    SearchResult::NotFound { insert_pos } => insert_pos,
                },
            };

            for i in start..guard.key_count() {
                let key = guard.key_at(i)?;
                if let Some(to) = &self.to {
                    if L::compare(key, to) != std::cmp::Ordering::Less {
                        self.exhausted = true;
                        break;
                    }
                }
                self.buffered.push_back((key.to_vec(), guard.value_at(i)?.to_vec()));
            }
            let right = guard.right_sibling();
            drop(guard);

            if let Some((key, _)) = self.buffered.back() {
                self.resume = Some(key.clone());
                if right.is_some() {
                    self.next_leaf = right;
                } else {
                    self.exhausted = true;
                }
                return Ok(());
            }
            if self.exhausted {
                return Ok(());
            }
            if right.is_some() {
                // empty leaf, or a split moved our range further right
                self.next_leaf = right;
                continue;
            }
            self.exhausted = true;
            return Ok(());
        }
    }
}

impl<L: Layout> Iterator for Seeker<L> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.pop_front() {
                return Some(Ok(entry));
            }
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.refill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
    }
}
