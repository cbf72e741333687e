//! Single-writer mutation engine
//!
//! One writer may be open at a time; the facade enforces this with a
//! non-blocking permit. Descent latches one node exclusively at a time,
//! releasing the parent before recursing and re-latching it only to apply
//! a child's copy or split result, so concurrent seekers are never blocked
//! on more than one node.
//!
//! Structural writes follow the copy-on-write rule: a node whose
//! generation predates the current unstable generation is first copied to
//! a fresh page stamped with the unstable generation; the superseded page
//! gets a successor pointer to the copy and is pended for reclamation at
//! the checkpoint that makes the copy durable. The in-memory root pointer
//! update at the end of an operation is the single commit point.

use crate::cache::PageWrite;
use crate::error::{Error, PageId, Result};
use crate::layout::Layout;
use crate::page::{max_entry_size, SearchResult, CHILD_PTR_SIZE, NODE_INTERNAL, NODE_LEAF};
use crate::tree::{TreeInner, MAX_TREE_DEPTH};
use parking_lot::MutexGuard;
use std::marker::PhantomData;
use tracing::trace;

/// Conflict policy for [`Writer::insert`]
///
/// Non-exhaustive: merge-style policies are an extension point and funnel
/// through the same conflict arm in the leaf descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OnConflict {
    /// Fail with [`Error::KeyAlreadyExists`], leaving the tree unchanged
    Fail,
    /// Replace the value and return the previous one
    Overwrite,
}

/// The exclusive structural-mutation handle
pub struct Writer<'t, L: Layout> {
    pub(crate) inner: &'t TreeInner,
    pub(crate) _permit: MutexGuard<'t, ()>,
    pub(crate) _layout: PhantomData<L>,
}

struct MutationResult {
    /// Value replaced or removed, if any
    replaced: Option<Vec<u8>>,
    /// Separator and right page of a split that must propagate upward
    split: Option<(Vec<u8>, PageId)>,
}

impl MutationResult {
    fn done(replaced: Option<Vec<u8>>) -> Self {
        Self { replaced, split: None }
    }
}

impl<'t, L: Layout> Writer<'t, L> {
    /// Insert a key-value pair
    ///
    /// With [`OnConflict::Overwrite`] an existing value is replaced and
    /// returned, which is what higher layers build compare-and-swap on.
    /// With [`OnConflict::Fail`] an existing key is an error and the tree
    /// is left untouched.
    pub fn insert(
        &mut self,
        key: &[u8],
        value: &[u8],
        on_conflict: OnConflict,
    ) -> Result<Option<Vec<u8>>> {
        let max = max_entry_size(self.inner.cache.page_size());
        if key.len() + value.len() > max || key.len() + CHILD_PTR_SIZE > max {
            return Err(Error::EntryTooLarge { size: key.len() + value.len(), max });
        }

        let (root_id, unstable) = {
            let state = self.inner.state.read();
            (state.root_id, state.unstable_generation)
        };

        // marked before descending: an operation aborted by an I/O error may
        // leave in-flight pages behind, and only a dirty close routes the
        // next open through recovery to discard them
        self.inner.changed.store(true, std::sync::atomic::Ordering::SeqCst);
        let (new_root, result) = self.insert_rec(root_id, key, value, on_conflict, unstable, 0)?;

        let mut state = self.inner.state.write();
        if let Some((separator, right)) = result.split {
            let grown_root = self.grow_root(new_root, &separator, right, unstable)?;
            state.root_id = grown_root;
            state.root_generation = unstable;
            trace!(root = grown_root.0, "root split");
        } else if new_root != root_id {
            state.root_id = new_root;
            state.root_generation = unstable;
        }
        drop(state);
        Ok(result.replaced)
    }

    /// Remove a key, returning the removed value
    ///
    /// A missing key is not an error; the tree is left unchanged and
    /// `None` is returned.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (root_id, unstable) = {
            let state = self.inner.state.read();
            (state.root_id, state.unstable_generation)
        };

        self.inner.changed.store(true, std::sync::atomic::Ordering::SeqCst);
        let (new_root, removed) = self.remove_rec(root_id, key, unstable, 0)?;

        if new_root != root_id {
            let mut state = self.inner.state.write();
            state.root_id = new_root;
            state.root_generation = unstable;
        }
        Ok(removed)
    }

    fn insert_rec(
        &self,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
        on_conflict: OnConflict,
        unstable: u64,
        depth: usize,
    ) -> Result<(PageId, MutationResult)> {
        if depth > MAX_TREE_DEPTH {
            return Err(Error::CorruptIndex(format!(
                "tree deeper than {MAX_TREE_DEPTH} levels during insert"
            )));
        }

        let page = self.inner.cache.exclusive(page_id)?;
        page.validate(page_id)?;

        if page.is_leaf() {
            return self.insert_into_leaf(page_id, page, key, value, on_conflict, unstable);
        }

        let child_idx = match page.search::<L>(key)? {
            SearchResult::Found { index } => index + 1,
            SearchResult::NotFound { insert_pos } => insert_pos,
        };
        let child_id = page.child_at(child_idx)?;
        drop(page);

        let (new_child, child_result) =
            self.insert_rec(child_id, key, value, on_conflict, unstable, depth + 1)?;
        if new_child == child_id && child_result.split.is_none() {
            return Ok((page_id, child_result));
        }

        // re-latch the parent to apply the child's copy or split
        let page = self.inner.cache.exclusive(page_id)?;
        let (id, mut page) = self.make_writable(page_id, page, unstable)?;
        if new_child != child_id {
            page.set_child_at(child_idx, new_child)?;
        }

        let mut result = MutationResult { replaced: child_result.replaced, split: None };
        if let Some((separator, right)) = child_result.split {
            if page.fits(separator.len(), CHILD_PTR_SIZE) {
                let pos = match page.search::<L>(&separator)? {
                    SearchResult::Found { index } => index,
                    SearchResult::NotFound { insert_pos } => insert_pos,
                };
                page.insert_at(pos, &separator, &right.0.to_le_bytes());
            } else {
                result.split = Some(self.split_internal(id, page, separator, right, unstable)?);
            }
        }
        Ok((id, result))
    }

    fn insert_into_leaf(
        &self,
        page_id: PageId,
        page: PageWrite,
        key: &[u8],
        value: &[u8],
        on_conflict: OnConflict,
        unstable: u64,
    ) -> Result<(PageId, MutationResult)> {
        match page.search::<L>(key)? {
            SearchResult::Found { index } => match on_conflict {
                // checked before any copy-on-write so the tree stays untouched
                OnConflict::Fail => Err(Error::KeyAlreadyExists),
                OnConflict::Overwrite => {
                    let old = page.value_at(index)?.to_vec();
                    let (id, mut page) = self.make_writable(page_id, page, unstable)?;
                    if value.len() == old.len() {
                        page.set_value_at(index, value)?;
                        return Ok((id, MutationResult::done(Some(old))));
                    }
                    page.remove_at(index);
                    if page.fits(key.len(), value.len()) {
                        page.insert_at(index, key, value);
                        return Ok((id, MutationResult::done(Some(old))));
                    }
                    let split = self.split_leaf(id, page, key, value, unstable)?;
                    Ok((id, MutationResult { replaced: Some(old), split: Some(split) }))
                }
            },
            SearchResult::NotFound { insert_pos } => {
                let (id, mut page) = self.make_writable(page_id, page, unstable)?;
                if page.fits(key.len(), value.len()) {
                    page.insert_at(insert_pos, key, value);
                    return Ok((id, MutationResult::done(None)));
                }
                let split = self.split_leaf(id, page, key, value, unstable)?;
                Ok((id, MutationResult { replaced: None, split: Some(split) }))
            }
        }
    }

    fn remove_rec(
        &self,
        page_id: PageId,
        key: &[u8],
        unstable: u64,
        depth: usize,
    ) -> Result<(PageId, Option<Vec<u8>>)> {
        if depth > MAX_TREE_DEPTH {
            return Err(Error::CorruptIndex(format!(
                "tree deeper than {MAX_TREE_DEPTH} levels during remove"
            )));
        }

        let page = self.inner.cache.exclusive(page_id)?;
        page.validate(page_id)?;

        if page.is_leaf() {
            return match page.search::<L>(key)? {
                SearchResult::NotFound { .. } => Ok((page_id, None)),
                SearchResult::Found { index } => {
                    let old = page.value_at(index)?.to_vec();
                    let (id, mut page) = self.make_writable(page_id, page, unstable)?;
                    // underflow is left to lazy consolidation; no eager merge
                    page.remove_at(index);
                    Ok((id, Some(old)))
                }
            };
        }

        let child_idx = match page.search::<L>(key)? {
            SearchResult::Found { index } => index + 1,
            SearchResult::NotFound { insert_pos } => insert_pos,
        };
        let child_id = page.child_at(child_idx)?;
        drop(page);

        let (new_child, removed) = self.remove_rec(child_id, key, unstable, depth + 1)?;
        if new_child == child_id {
            return Ok((page_id, removed));
        }

        let page = self.inner.cache.exclusive(page_id)?;
        let (id, mut page) = self.make_writable(page_id, page, unstable)?;
        page.set_child_at(child_idx, new_child)?;
        Ok((id, removed))
    }

    /// Copy a stale-generation node before mutating it
    ///
    /// Returns the page to mutate, which is the same latch when the node is
    /// already of the unstable generation. The superseded page keeps
    /// serving readers through its successor pointer until reclaimed.
    fn make_writable(
        &self,
        page_id: PageId,
        page: PageWrite,
        unstable: u64,
    ) -> Result<(PageId, PageWrite)> {
        if page.generation() == unstable {
            return Ok((page_id, page));
        }

        let new_id = self.allocate()?;
        let mut copy = self.inner.cache.exclusive(new_id)?;
        page.compact_into(&mut copy)?;
        copy.set_generation(unstable);

        let mut old = page;
        old.set_successor(new_id);
        self.inner.freelist.lock().pend(page_id, unstable);
        drop(old);

        // keep the sibling chain accurate for live readers; after a crash
        // these in-place hints are rebuilt by recovery
        let left = copy.left_sibling();
        if left.is_some() {
            self.inner.cache.exclusive(left)?.set_right_sibling(new_id);
        }
        let right = copy.right_sibling();
        if right.is_some() {
            self.inner.cache.exclusive(right)?.set_left_sibling(new_id);
        }

        trace!(from = page_id.0, to = new_id.0, generation = unstable, "copy-on-write");
        Ok((new_id, copy))
    }

    /// Split a writable leaf, inserting the pending entry into the correct
    /// half, and return the separator for the parent
    fn split_leaf(
        &self,
        page_id: PageId,
        mut page: PageWrite,
        key: &[u8],
        value: &[u8],
        unstable: u64,
    ) -> Result<(Vec<u8>, PageId)> {
        let count = page.key_count();
        let mid = count / 2;
        let separator = page.key_at(mid)?.to_vec();

        let right_id = self.allocate()?;
        let mut right = self.inner.cache.exclusive(right_id)?;
        right.init(NODE_LEAF);
        right.set_generation(unstable);
        for i in mid..count {
            right.insert_at(i - mid, page.key_at(i)?, page.value_at(i)?);
        }

        page.truncate(mid);
        page.compact()?;

        let old_next = page.right_sibling();
        page.set_right_sibling(right_id);
        right.set_left_sibling(page_id);
        right.set_right_sibling(old_next);

        if L::compare(key, &separator) == std::cmp::Ordering::Less {
            let pos = match page.search::<L>(key)? {
                SearchResult::Found { .. } => {
                    return Err(Error::CorruptPage {
                        details: "split target already contains pending key".into(),
                        page_id: Some(page_id),
                    })
                }
                SearchResult::NotFound { insert_pos } => insert_pos,
            };
            page.insert_at(pos, key, value);
        } else {
            let pos = match right.search::<L>(key)? {
                SearchResult::Found { .. } => {
                    return Err(Error::CorruptPage {
                        details: "split target already contains pending key".into(),
                        page_id: Some(right_id),
                    })
                }
                SearchResult::NotFound { insert_pos } => insert_pos,
            };
            right.insert_at(pos, key, value);
        }
        drop(page);
        drop(right);

        if old_next.is_some() {
            self.inner.cache.exclusive(old_next)?.set_left_sibling(right_id);
        }

        trace!(left = page_id.0, right = right_id.0, "leaf split");
        Ok((separator, right_id))
    }

    /// Split a writable internal node around the median separator
    ///
    /// The median is promoted, not kept; its child becomes the right
    /// page's leftmost child.
    fn split_internal(
        &self,
        page_id: PageId,
        mut page: PageWrite,
        pending_separator: Vec<u8>,
        pending_right: PageId,
        unstable: u64,
    ) -> Result<(Vec<u8>, PageId)> {
        let count = page.key_count();
        let mut entries: Vec<(Vec<u8>, PageId)> = Vec::with_capacity(count + 1);
        for i in 0..count {
            entries.push((page.key_at(i)?.to_vec(), page.child_at(i + 1)?));
        }
        let pos = entries
            .binary_search_by(|(k, _)| L::compare(k, &pending_separator))
            .unwrap_or_else(|pos| pos);
        entries.insert(pos, (pending_separator, pending_right));

        let leftmost = page.child_at(0)?;
        let split_point = entries.len() / 2;
        let (median_key, median_child) = entries[split_point].clone();

        let right_id = self.allocate()?;
        let mut right = self.inner.cache.exclusive(right_id)?;
        right.init(NODE_INTERNAL);
        right.set_generation(unstable);
        right.set_child_at(0, median_child)?;
        for (i, (key, child)) in entries[split_point + 1..].iter().enumerate() {
            right.insert_at(i, key, &child.0.to_le_bytes());
        }

        let old_left = page.left_sibling();
        let old_next = page.right_sibling();
        page.init(NODE_INTERNAL);
        page.set_generation(unstable);
        page.set_child_at(0, leftmost)?;
        for (i, (key, child)) in entries[..split_point].iter().enumerate() {
            page.insert_at(i, key, &child.0.to_le_bytes());
        }
        page.set_left_sibling(old_left);
        page.set_right_sibling(right_id);
        right.set_left_sibling(page_id);
        right.set_right_sibling(old_next);
        drop(page);
        drop(right);

        if old_next.is_some() {
            self.inner.cache.exclusive(old_next)?.set_left_sibling(right_id);
        }

        trace!(left = page_id.0, right = right_id.0, "internal split");
        Ok((median_key, right_id))
    }

    /// Allocate a fresh root above a split pair
    fn grow_root(
        &self,
        left: PageId,
        separator: &[u8],
        right: PageId,
        unstable: u64,
    ) -> Result<PageId> {
        let root_id = self.allocate()?;
        let mut root = self.inner.cache.exclusive(root_id)?;
        root.init(NODE_INTERNAL);
        root.set_generation(unstable);
        root.set_child_at(0, left)?;
        root.insert_at(0, separator, &right.0.to_le_bytes());
        Ok(root_id)
    }

    fn allocate(&self) -> Result<PageId> {
        if let Some(id) = self.inner.freelist.lock().acquire() {
            return Ok(id);
        }
        self.inner.cache.allocate()
    }
}
