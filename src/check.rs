//! Full-tree structural audit
//!
//! Verifies every invariant the tree relies on and reports violations as
//! structured values; it never repairs. Checked per node: readable page,
//! sane header, in-node key ordering, key-range containment from the
//! parent separators, no reachable successor pointers, no generations
//! from the future. Checked per level: uniform leaf depth and sibling
//! chains that match the parent structure in order and linkage, which
//! together make the leaf ranges partition the key space.

use crate::cache::PageCache;
use crate::error::{PageId, Result};
use crate::layout::Layout;
use crate::tree::MAX_TREE_DEPTH;
use std::fmt;

/// One structural violation found by [`crate::Tree::consistency_check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyViolation {
    /// Page could not be read or its header is invalid
    BadNode {
        /// Offending page
        page_id: PageId,
        /// What went wrong
        details: String,
    },
    /// Keys within a node are not strictly ascending
    KeyOrder {
        /// Offending page
        page_id: PageId,
        /// Index of the key that breaks the order
        index: usize,
    },
    /// A key lies outside the range its parent separators allow
    RangeBounds {
        /// Offending page
        page_id: PageId,
        /// Index of the out-of-range key
        index: usize,
    },
    /// A leaf sits at a different depth than the first leaf found
    UnevenDepth {
        /// Offending leaf
        page_id: PageId,
        /// Depth of the first leaf
        expected: usize,
        /// Depth of this leaf
        found: usize,
    },
    /// A sibling pointer disagrees with the parent structure
    SiblingLink {
        /// Page whose pointer is wrong
        page_id: PageId,
        /// Id the chain requires
        expected: PageId,
        /// Id actually stored
        found: PageId,
    },
    /// Adjacent pages on a level are not in ascending key order
    SiblingOrder {
        /// Left page of the offending pair
        left: PageId,
        /// Right page of the offending pair
        right: PageId,
    },
    /// A reachable node still carries a successor pointer
    DanglingSuccessor {
        /// Offending page
        page_id: PageId,
        /// Target of the stale pointer
        successor: PageId,
    },
    /// A node is stamped with a generation newer than the tree's
    FutureGeneration {
        /// Offending page
        page_id: PageId,
        /// Generation found on the page
        generation: u64,
    },
}

impl fmt::Display for ConsistencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadNode { page_id, details } => write!(f, "page {page_id}: {details}"),
            Self::KeyOrder { page_id, index } => {
                write!(f, "page {page_id}: key {index} out of order")
            }
            Self::RangeBounds { page_id, index } => {
                write!(f, "page {page_id}: key {index} outside parent bounds")
            }
            Self::UnevenDepth { page_id, expected, found } => {
                write!(f, "leaf {page_id} at depth {found}, expected {expected}")
            }
            Self::SiblingLink { page_id, expected, found } => {
                write!(f, "page {page_id}: sibling link {found}, chain requires {expected}")
            }
            Self::SiblingOrder { left, right } => {
                write!(f, "pages {left} and {right} break level key order")
            }
            Self::DanglingSuccessor { page_id, successor } => {
                write!(f, "page {page_id}: dangling successor {successor}")
            }
            Self::FutureGeneration { page_id, generation } => {
                write!(f, "page {page_id}: generation {generation} from the future")
            }
        }
    }
}

struct Checker<'c> {
    cache: &'c dyn PageCache,
    unstable_generation: u64,
    violations: Vec<ConsistencyViolation>,
    levels: Vec<Vec<PageId>>,
    leaf_depth: Option<usize>,
}

/// Audit the tree reachable from `root`
pub(crate) fn check_tree<L: Layout>(
    cache: &dyn PageCache,
    root: PageId,
    unstable_generation: u64,
) -> Result<Vec<ConsistencyViolation>> {
    let mut checker = Checker {
        cache,
        unstable_generation,
        violations: Vec::new(),
        levels: Vec::new(),
        leaf_depth: None,
    };
    checker.visit::<L>(root, None, None, 0);
    checker.check_sibling_chains::<L>();
    Ok(checker.violations)
}

impl<'c> Checker<'c> {
    fn visit<L: Layout>(
        &mut self,
        page_id: PageId,
        min: Option<&[u8]>,
        max: Option<&[u8]>,
        depth: usize,
    ) {
        if depth > MAX_TREE_DEPTH {
            self.violations.push(ConsistencyViolation::BadNode {
                page_id,
                details: format!("deeper than {MAX_TREE_DEPTH} levels"),
            });
            return;
        }

        let page = match self.cache.shared(page_id) {
            Ok(page) => page,
            Err(err) => {
                self.violations
                    .push(ConsistencyViolation::BadNode { page_id, details: err.to_string() });
                return;
            }
        };
        if let Err(err) = page.validate(page_id) {
            self.violations
                .push(ConsistencyViolation::BadNode { page_id, details: err.to_string() });
            return;
        }

        if page.generation() > self.unstable_generation {
            self.violations.push(ConsistencyViolation::FutureGeneration {
                page_id,
                generation: page.generation(),
            });
        }
        if page.successor().is_some() {
            self.violations.push(ConsistencyViolation::DanglingSuccessor {
                page_id,
                successor: page.successor(),
            });
        }

        if self.levels.len() <= depth {
            self.levels.push(Vec::new());
        }
        self.levels[depth].push(page_id);

        // in-node ordering and parent bounds
        let count = page.key_count();
        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(count);
        for index in 0..count {
            let key = match page.key_at(index) {
                Ok(key) => key.to_vec(),
                Err(err) => {
                    self.violations
                        .push(ConsistencyViolation::BadNode { page_id, details: err.to_string() });
                    return;
                }
            };
            if let Some(prev) = keys.last() {
                if L::compare(prev, &key) != std::cmp::Ordering::Less {
                    self.violations.push(ConsistencyViolation::KeyOrder { page_id, index });
                }
            }
            let below_min =
                min.is_some_and(|min| L::compare(&key, min) == std::cmp::Ordering::Less);
            let above_max =
                max.is_some_and(|max| L::compare(&key, max) != std::cmp::Ordering::Less);
            if below_min || above_max {
                self.violations.push(ConsistencyViolation::RangeBounds { page_id, index });
            }
            keys.push(key);
        }

        if page.is_leaf() {
            match self.leaf_depth {
                None => self.leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    self.violations.push(ConsistencyViolation::UnevenDepth {
                        page_id,
                        expected,
                        found: depth,
                    });
                }
                Some(_) => {}
            }
            return;
        }

        let mut children = Vec::with_capacity(count + 1);
        for idx in 0..=count {
            match page.child_at(idx) {
                Ok(child) => children.push((idx, child)),
                Err(err) => {
                    self.violations
                        .push(ConsistencyViolation::BadNode { page_id, details: err.to_string() });
                    return;
                }
            }
        }
        drop(page);

        for (idx, child) in children {
            let child_min = if idx == 0 { min } else { Some(keys[idx - 1].as_slice()) };
            let child_max = if idx == count { max } else { Some(keys[idx].as_slice()) };
            self.visit::<L>(child, child_min, child_max, depth + 1);
        }
    }

    /// Verify each level's sibling chain against the in-order traversal
    fn check_sibling_chains<L: Layout>(&mut self) {
        for level in std::mem::take(&mut self.levels) {
            for (pos, &id) in level.iter().enumerate() {
                let expected_left = if pos > 0 { level[pos - 1] } else { PageId::NONE };
                let expected_right =
                    if pos + 1 < level.len() { level[pos + 1] } else { PageId::NONE };

                let page = match self.cache.shared(id) {
                    Ok(page) => page,
                    Err(_) => continue, // already reported during the walk
                };
                if page.left_sibling() != expected_left {
                    self.violations.push(ConsistencyViolation::SiblingLink {
                        page_id: id,
                        expected: expected_left,
                        found: page.left_sibling(),
                    });
                }
                if page.right_sibling() != expected_right {
                    self.violations.push(ConsistencyViolation::SiblingLink {
                        page_id: id,
                        expected: expected_right,
                        found: page.right_sibling(),
                    });
                }

                // cross-boundary ordering with the right neighbor
                if expected_right.is_some() && page.key_count() > 0 {
                    let last = match page.key_at(page.key_count() - 1) {
                        Ok(key) => key.to_vec(),
                        Err(_) => continue,
                    };
                    drop(page);
                    let right = match self.cache.shared(expected_right) {
                        Ok(page) => page,
                        Err(_) => continue,
                    };
                    if right.key_count() > 0 {
                        if let Ok(first) = right.key_at(0) {
                            if L::compare(&last, first) != std::cmp::Ordering::Less {
                                self.violations.push(ConsistencyViolation::SiblingOrder {
                                    left: id,
                                    right: expected_right,
                                });
                            }
                        }
                    }
                }
            }
        }
    }
}
