//! Tree facade and lifecycle
//!
//! `Tree` composes the page cache, mutation engine, cursor, checkpoint
//! protocol, recovery, and consistency checker behind the public
//! lifecycle: open (create or verify-and-recover), `writer()`, `seek()`,
//! `checkpoint()`, `consistency_check()`, `close()`.
//!
//! The durability contract: `checkpoint()` flushes all unstable pages and
//! then commits the header page, after which the previous unstable
//! generation is stable and its superseded pages become reclaimable.
//! `close()` never checkpoints; it persists the last checkpointed state
//! plus current metadata and sets the clean flag only when nothing changed
//! since the last checkpoint. Changes after the last checkpoint are
//! legitimately lost on crash or dirty close, and the next open runs the
//! recovery pass to discard their leftovers.

use crate::cache::{FilePageCache, PageCache};
use crate::check::{self, ConsistencyViolation};
use crate::error::{Error, PageId, Result};
use crate::freelist::FreeList;
use crate::layout::{Layout, LexicographicLayout};
use crate::page::{SearchResult, MAX_PAGE_SIZE, MIN_PAGE_SIZE, NODE_LEAF};
use crate::recover;
use crate::seek::Seeker;
use crate::state::{self, TreeState};
use crate::writer::Writer;
use parking_lot::{Mutex, RwLock};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Safety bound on descent depth and successor-chain length
pub(crate) const MAX_TREE_DEPTH: usize = 100;

const FIRST_STABLE_GENERATION: u64 = 1;

/// Live tree state, shared between the facade, writer, and cursors
pub(crate) struct SharedState {
    pub(crate) root_id: PageId,
    pub(crate) root_generation: u64,
    pub(crate) stable_generation: u64,
    pub(crate) unstable_generation: u64,
    pub(crate) metadata: Vec<u8>,
    /// Last state committed to the header page; what `close` persists
    pub(crate) checkpointed: TreeState,
}

pub(crate) struct TreeInner {
    pub(crate) cache: Arc<dyn PageCache>,
    pub(crate) state: RwLock<SharedState>,
    pub(crate) freelist: Mutex<FreeList>,
    pub(crate) writer_lock: Mutex<()>,
    pub(crate) changed: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) layout_id: u64,
}

/// Options builder for opening or creating a tree file
pub struct TreeOptions {
    page_size: Option<usize>,
    metadata: Vec<u8>,
}

impl TreeOptions {
    /// Start from defaults: 4 KiB pages, empty metadata
    pub fn new() -> Self {
        Self { page_size: None, metadata: Vec::new() }
    }

    /// Page size for a newly created file; must match on reopen
    ///
    /// Power of two between 256 and 16384. An existing file opened without
    /// an explicit size adopts the size recorded in its header.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Initial metadata blob for a newly created file
    ///
    /// Ignored when opening an existing file; use
    /// [`Tree::set_metadata`] to change a live tree's blob.
    pub fn metadata(mut self, blob: &[u8]) -> Self {
        self.metadata = blob.to_vec();
        self
    }

    /// Open an existing tree file or create a new one
    pub fn open<L: Layout>(self, path: impl AsRef<Path>) -> Result<Tree<L>> {
        let path = path.as_ref();
        match state::probe_page_size(path)? {
            None => {
                let page_size = self.page_size.unwrap_or(crate::DEFAULT_PAGE_SIZE);
                validate_page_size(page_size)?;
                Tree::create(path, page_size, self.metadata)
            }
            Some(stored) => {
                if let Some(requested) = self.page_size {
                    if requested != stored {
                        return Err(Error::MetadataMismatch {
                            what: "page size",
                            expected: requested as u64,
                            found: stored as u64,
                        });
                    }
                }
                if validate_page_size(stored).is_err() {
                    return Err(Error::CorruptIndex(format!(
                        "header page records invalid page size {stored}"
                    )));
                }
                Tree::open_existing(path, stored)
            }
        }
    }
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_page_size(page_size: usize) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(Error::Usage("page size must be a power of two between 256 and 16384"));
    }
    Ok(())
}

fn write_header_page(cache: &dyn PageCache, layout_id: u64, state: &TreeState) -> Result<()> {
    {
        let mut page = cache.exclusive(PageId(0))?;
        state::write_header(&mut page, layout_id, state)?;
    }
    cache.flush_page(PageId(0))
}

/// A persistent ordered key-value index over copy-on-write pages
pub struct Tree<L: Layout = LexicographicLayout> {
    inner: Arc<TreeInner>,
    _layout: PhantomData<L>,
}

impl<L: Layout> std::fmt::Debug for Tree<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("layout_id", &self.inner.layout_id)
            .finish_non_exhaustive()
    }
}

impl<L: Layout> Tree<L> {
    /// Open with default options
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        TreeOptions::new().open(path)
    }

    fn create(path: &Path, page_size: usize, metadata: Vec<u8>) -> Result<Self> {
        let cache = Arc::new(FilePageCache::open(path, page_size)?);
        let unstable = FIRST_STABLE_GENERATION + 1;

        let root_id = cache.allocate()?;
        {
            let mut root = cache.exclusive(root_id)?;
            root.init(NODE_LEAF);
            root.set_generation(unstable);
        }

        // the creation checkpoint: make the empty root stable
        cache.flush()?;
        let header = TreeState {
            root_id,
            root_generation: unstable,
            stable_generation: unstable,
            unstable_generation: unstable + 1,
            last_page_id: cache.page_count() - 1,
            clean: false,
            metadata,
        };
        write_header_page(cache.as_ref(), L::identifier(), &header)?;
        info!(page_size, root = root_id.0, "created tree file");

        Ok(Self::assemble(cache, L::identifier(), header))
    }

    fn open_existing(path: &Path, page_size: usize) -> Result<Self> {
        let cache = Arc::new(FilePageCache::open(path, page_size)?);
        let (layout_id, stored) = {
            let page = cache.shared(PageId(0))?;
            state::read_header(&page)?
        };
        if layout_id != L::identifier() {
            return Err(Error::MetadataMismatch {
                what: "layout identifier",
                expected: L::identifier(),
                found: layout_id,
            });
        }
        cache.set_next_id(stored.last_page_id + 1);

        let mut root_id = stored.root_id;
        if !stored.clean {
            info!(root = root_id.0, "unclean shutdown detected, running recovery");
            let (recovered, _stats) =
                recover::run(cache.as_ref(), root_id, stored.stable_generation)?;
            root_id = recovered;
        }
        let root_generation = cache.shared(root_id)?.generation();

        // bump past any crashed session's writes and mark the file dirty
        // while open; only a clean close sets the flag again
        let header = TreeState {
            root_id,
            root_generation,
            stable_generation: stored.stable_generation,
            unstable_generation: stored.unstable_generation + 1,
            last_page_id: cache.page_count() - 1,
            clean: false,
            metadata: stored.metadata,
        };
        cache.flush()?;
        write_header_page(cache.as_ref(), layout_id, &header)?;
        debug!(
            root = root_id.0,
            stable = header.stable_generation,
            unstable = header.unstable_generation,
            "opened tree file"
        );

        Ok(Self::assemble(cache, layout_id, header))
    }

    fn assemble(cache: Arc<FilePageCache>, layout_id: u64, header: TreeState) -> Self {
        let state = SharedState {
            root_id: header.root_id,
            root_generation: header.root_generation,
            stable_generation: header.stable_generation,
            unstable_generation: header.unstable_generation,
            metadata: header.metadata.clone(),
            checkpointed: header,
        };
        Self {
            inner: Arc::new(TreeInner {
                cache,
                state: RwLock::new(state),
                freelist: Mutex::new(FreeList::new()),
                writer_lock: Mutex::new(()),
                changed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                layout_id,
            }),
            _layout: PhantomData,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Usage("tree is closed"));
        }
        Ok(())
    }

    /// Page size this tree file was created with
    pub fn page_size(&self) -> usize {
        self.inner.cache.page_size()
    }

    /// Acquire the exclusive writer
    ///
    /// Fails immediately with [`Error::Usage`] if a writer is already
    /// open; requests are not queued.
    pub fn writer(&self) -> Result<Writer<'_, L>> {
        self.ensure_open()?;
        let permit = self
            .inner
            .writer_lock
            .try_lock()
            .ok_or(Error::Usage("a writer is already open"))?;
        Ok(Writer { inner: &self.inner, _permit: permit, _layout: PhantomData })
    }

    /// Point lookup
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let mut id = self.inner.state.read().root_id;
        for _ in 0..MAX_TREE_DEPTH {
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
            guard.validate(guard.id())?;
            if guard.is_leaf() {
                return match guard.search::<L>(key)? {
                    SearchResult::Found { index } => Ok(Some(guard.value_at(index)?.to_vec())),
                    SearchResult::NotFound { .. } => Ok(None),
                };
            }
            let child_idx = match guard.search::<L>(key)? {
                SearchResult::Found { index } => index + 1,
                SearchResult::NotFound { insert_pos } => insert_pos,
            };
            id = guard.child_at(child_idx)?;
        }
        Err(Error::CorruptIndex(format!("tree deeper than {MAX_TREE_DEPTH} levels during get")))
    }

    /// Ordered cursor over `[from, to)`
    ///
    /// `from >= to` yields an empty cursor, not an error. Cursors may run
    /// concurrently with each other and with one writer.
    pub fn seek(&self, from: &[u8], to: &[u8]) -> Result<Seeker<L>> {
        self.ensure_open()?;
        Ok(Seeker::new(Arc::clone(&self.inner), from.to_vec(), Some(to.to_vec())))
    }

    /// Ordered cursor from `from` (inclusive) to the end of the tree
    pub fn seek_from(&self, from: &[u8]) -> Result<Seeker<L>> {
        self.ensure_open()?;
        Ok(Seeker::new(Arc::clone(&self.inner), from.to_vec(), None))
    }

    /// Ordered cursor over the whole tree
    pub fn seek_all(&self) -> Result<Seeker<L>> {
        self.seek_from(&[])
    }

    /// Freeze the current tree state into the stable generation
    ///
    /// Flushes every unstable page, commits the header, and releases
    /// superseded pages for reuse. Fails with [`Error::Usage`] while a
    /// writer is open.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        let _permit = self
            .inner
            .writer_lock
            .try_lock()
            .ok_or(Error::Usage("checkpoint while a writer is open"))?;

        self.inner.cache.flush()?;

        let header = {
            let mut state = self.inner.state.write();
            let new_stable = state.unstable_generation;
            state.stable_generation = new_stable;
            state.unstable_generation = new_stable + 1;
            let header = TreeState {
                root_id: state.root_id,
                root_generation: state.root_generation,
                stable_generation: new_stable,
                unstable_generation: new_stable + 1,
                last_page_id: self.inner.cache.page_count() - 1,
                clean: false,
                metadata: state.metadata.clone(),
            };
            state.checkpointed = header.clone();
            header
        };
        write_header_page(self.inner.cache.as_ref(), self.inner.layout_id, &header)?;

        self.inner.freelist.lock().release(header.stable_generation);
        self.inner.changed.store(false, Ordering::SeqCst);
        debug!(stable = header.stable_generation, root = header.root_id.0, "checkpoint complete");
        Ok(())
    }

    /// Audit the tree's structure, returning all violations found
    ///
    /// Reports only; never repairs.
    pub fn consistency_check(&self) -> Result<Vec<ConsistencyViolation>> {
        self.ensure_open()?;
        // quiesce: a half-applied mutation would read as a violation
        let _permit = self
            .inner
            .writer_lock
            .try_lock()
            .ok_or(Error::Usage("consistency check while a writer is open"))?;
        let (root_id, unstable) = {
            let state = self.inner.state.read();
            (state.root_id, state.unstable_generation)
        };
        check::check_tree::<L>(self.inner.cache.as_ref(), root_id, unstable)
    }

    /// The header's opaque metadata blob
    pub fn metadata(&self) -> Vec<u8> {
        self.inner.state.read().metadata.clone()
    }

    /// Replace the metadata blob; persisted by the next checkpoint or close
    pub fn set_metadata(&self, blob: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if blob.len() > state::max_metadata_size(self.inner.cache.page_size()) {
            return Err(Error::Usage("metadata blob does not fit in the header page"));
        }
        self.inner.state.write().metadata = blob.to_vec();
        Ok(())
    }

    /// Close the tree
    ///
    /// Does not checkpoint: changes since the last checkpoint are dropped,
    /// exactly as a crash would drop them, and the clean flag is set only
    /// when there are none. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _permit = self
            .inner
            .writer_lock
            .try_lock()
            .ok_or(Error::Usage("close while a writer is open"))?;

        let header = {
            let state = self.inner.state.read();
            TreeState {
                clean: !self.inner.changed.load(Ordering::SeqCst),
                metadata: state.metadata.clone(),
                ..state.checkpointed.clone()
            }
        };
        write_header_page(self.inner.cache.as_ref(), self.inner.layout_id, &header)?;
        self.inner.closed.store(true, Ordering::SeqCst);
        info!(clean = header.clean, "tree closed");
        Ok(())
    }
}

impl<L: Layout> Drop for Tree<L> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
