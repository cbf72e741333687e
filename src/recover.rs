//! Startup recovery pass
//!
//! Runs from `open()` when the previous shutdown was not clean, before any
//! writer or seeker is handed out, as a plain synchronous walk of the
//! stable tree. Three repairs:
//!
//! - a reachable node whose successor is itself stable had its parent
//!   link lost mid-operation; the successor is linked into the parent
//!   (the change is completed),
//! - a successor pointing at an unstable or unreadable page is a crashed
//!   copy-on-write; the pointer is cleared (the orphan is discarded),
//! - sibling chains are rebuilt per level from the parent structure,
//!   since sibling pointers are the one in-place hint the writer leaves
//!   on stable pages.
//!
//! Every repair is idempotent; a crash during recovery just re-runs it.

use crate::cache::PageCache;
use crate::error::{Error, PageId, Result};
use crate::tree::MAX_TREE_DEPTH;
use tracing::{debug, info};

/// What a recovery pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Completed structural changes: successors linked into their parent
    pub successors_adopted: usize,
    /// Discarded crashed copy-on-write orphans
    pub successors_cleared: usize,
    /// Sibling pointers rewritten while rebuilding the chains
    pub siblings_relinked: usize,
}

/// Run the recovery pass; returns the (possibly adopted) root and stats
pub(crate) fn run(
    cache: &dyn PageCache,
    root: PageId,
    stable_generation: u64,
) -> Result<(PageId, RecoveryStats)> {
    let mut stats = RecoveryStats::default();
    let mut levels: Vec<Vec<PageId>> = Vec::new();

    let root = visit(cache, root, None, 0, 0, stable_generation, &mut levels, &mut stats)?;
    rebuild_siblings(cache, &levels, &mut stats)?;

    info!(
        adopted = stats.successors_adopted,
        cleared = stats.successors_cleared,
        relinked = stats.siblings_relinked,
        "recovery pass finished"
    );
    Ok((root, stats))
}

#[allow(clippy::too_many_arguments)]
fn visit(
    cache: &dyn PageCache,
    page_id: PageId,
    parent: Option<(PageId, usize)>,
    depth: usize,
    hops: usize,
    stable_generation: u64,
    levels: &mut Vec<Vec<PageId>>,
    stats: &mut RecoveryStats,
) -> Result<PageId> {
    if depth > MAX_TREE_DEPTH || hops > MAX_TREE_DEPTH {
        return Err(Error::CorruptIndex(format!(
            "tree deeper than {MAX_TREE_DEPTH} levels during recovery"
        )));
    }

    let mut page = cache.exclusive(page_id)?;
    page.validate(page_id)?;

    let successor = page.successor();
    if successor.is_some() {
        if is_adoptable(cache, successor, stable_generation) {
            drop(page);
            if let Some((parent_id, child_idx)) = parent {
                cache.exclusive(parent_id)?.set_child_at(child_idx, successor)?;
            }
            stats.successors_adopted += 1;
            debug!(from = page_id.0, to = successor.0, "adopted stable successor");
            // the replacement may carry its own repairs; walk it instead
            return visit(cache, successor, parent, depth, hops + 1, stable_generation, levels, stats);
        }
        page.set_successor(PageId::NONE);
        stats.successors_cleared += 1;
        debug!(page = page_id.0, orphan = successor.0, "discarded crashed successor");
    }

    if levels.len() <= depth {
        levels.push(Vec::new());
    }
    levels[depth].push(page_id);

    if page.is_leaf() {
        return Ok(page_id);
    }

    let mut children = Vec::with_capacity(page.key_count() + 1);
    for idx in 0..=page.key_count() {
        children.push((idx, page.child_at(idx)?));
    }
    drop(page);

    for (idx, child_id) in children {
        visit(cache, child_id, Some((page_id, idx)), depth + 1, 0, stable_generation, levels, stats)?;
    }
    Ok(page_id)
}

/// A successor can be adopted only if it survived a checkpoint intact
fn is_adoptable(cache: &dyn PageCache, id: PageId, stable_generation: u64) -> bool {
    match cache.shared(id) {
        Ok(page) => page.validate(id).is_ok() && page.generation() <= stable_generation,
        Err(_) => false,
    }
}

fn rebuild_siblings(
    cache: &dyn PageCache,
    levels: &[Vec<PageId>],
    stats: &mut RecoveryStats,
) -> Result<()> {
    for level in levels {
        for (pos, &id) in level.iter().enumerate() {
            let left = if pos > 0 { level[pos - 1] } else { PageId::NONE };
            let right = if pos + 1 < level.len() { level[pos + 1] } else { PageId::NONE };
            let mut page = cache.exclusive(id)?;
            if page.left_sibling() != left {
                page.set_left_sibling(left);
                stats.siblings_relinked += 1;
            }
            if page.right_sibling() != right {
                page.set_right_sibling(right);
                stats.siblings_relinked += 1;
            }
        }
    }
    Ok(())
}
