//! Page cache capability and the bundled file-backed implementation
//!
//! The tree consumes pages through the [`PageCache`] trait: acquire a page
//! by id under a shared or exclusive latch, allocate fresh pages, and flush
//! dirty pages through to durable storage. [`FilePageCache`] is the bundled
//! implementation: one boxed frame per page behind a `parking_lot::RwLock`,
//! miss-filled from the file with positioned reads and written back on
//! flush. It keeps frames resident; eviction is a cache concern, not a tree
//! concern, and hosts with stricter budgets can supply their own impl.

use crate::error::{Error, PageId, Result};
use crate::page::Page;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared (read) latch on one page
pub struct PageRead {
    id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, Page>,
}

impl PageRead {
    /// Id of the latched page
    pub fn id(&self) -> PageId {
        self.id
    }
}

impl Deref for PageRead {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

/// Exclusive (write) latch on one page
pub struct PageWrite {
    id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
}

impl PageWrite {
    /// Id of the latched page
    pub fn id(&self) -> PageId {
        self.id
    }
}

impl Deref for PageWrite {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl DerefMut for PageWrite {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

/// Abstract page-cache capability the tree is built against
pub trait PageCache: Send + Sync {
    /// Page size in bytes, fixed for the cache's lifetime
    fn page_size(&self) -> usize;

    /// One past the highest allocated page id
    fn page_count(&self) -> u64;

    /// Extend the id space with a fresh zeroed page
    fn allocate(&self) -> Result<PageId>;

    /// Latch a page for reading; blocks while an exclusive latch is held
    fn shared(&self, id: PageId) -> Result<PageRead>;

    /// Latch a page for writing and mark it dirty
    fn exclusive(&self, id: PageId) -> Result<PageWrite>;

    /// Write all dirty pages through to storage and fsync
    fn flush(&self) -> Result<()>;

    /// Write one page through to storage and fsync it
    fn flush_page(&self, id: PageId) -> Result<()>;
}

/// File-backed page cache with per-page latches
pub struct FilePageCache {
    file: File,
    page_size: usize,
    frames: Mutex<HashMap<u64, Arc<RwLock<Page>>>>,
    dirty: Mutex<BTreeSet<u64>>,
    next_id: AtomicU64,
}

impl FilePageCache {
    /// Open or create the backing file
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let len = file.metadata()?.len();
        // id 0 (the header page) always exists, even for a fresh file
        let pages = (len / page_size as u64).max(1);
        Ok(Self {
            file,
            page_size,
            frames: Mutex::new(HashMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
            next_id: AtomicU64::new(pages),
        })
    }

    /// Reset the allocation cursor, e.g. from a header's last page id
    pub fn set_next_id(&self, next: u64) {
        self.next_id.store(next.max(1), Ordering::SeqCst);
    }

    fn frame(&self, id: PageId) -> Result<Arc<RwLock<Page>>> {
        if id.0 >= self.next_id.load(Ordering::SeqCst) {
            return Err(Error::CorruptIndex(format!("page {id} beyond allocated range")));
        }
        if let Some(frame) = self.frames.lock().get(&id.0) {
            return Ok(Arc::clone(frame));
        }

        // miss: load outside the map lock, then race-check on insert
        let mut page = Page::new(self.page_size);
        let offset = id.to_offset(self.page_size);
        if offset + self.page_size as u64 <= self.file.metadata()?.len() {
            self.file.read_exact_at(page.as_bytes_mut(), offset)?;
        }
        let frame = Arc::new(RwLock::new(page));
        let mut frames = self.frames.lock();
        Ok(Arc::clone(frames.entry(id.0).or_insert(frame)))
    }

    fn write_back(&self, id: u64) -> Result<()> {
        let frame = {
            let frames = self.frames.lock();
            frames.get(&id).map(Arc::clone)
        };
        if let Some(frame) = frame {
            let page = frame.read();
            self.file.write_all_at(page.as_bytes(), id * self.page_size as u64)?;
        }
        Ok(())
    }
}

impl PageCache for FilePageCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    fn allocate(&self) -> Result<PageId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = Arc::new(RwLock::new(Page::new(self.page_size)));
        self.frames.lock().insert(id, frame);
        self.dirty.lock().insert(id);
        Ok(PageId(id))
    }

    fn shared(&self, id: PageId) -> Result<PageRead> {
        let frame = self.frame(id)?;
        Ok(PageRead { id, guard: frame.read_arc() })
    }

    fn exclusive(&self, id: PageId) -> Result<PageWrite> {
        let frame = self.frame(id)?;
        self.dirty.lock().insert(id.0);
        Ok(PageWrite { id, guard: frame.write_arc() })
    }

    fn flush(&self) -> Result<()> {
        // dirty ids are cleared only after the whole write-back succeeds,
        // so a failed flush can be retried
        let ids: Vec<u64> = self.dirty.lock().iter().copied().collect();
        for id in &ids {
            self.write_back(*id)?;
        }
        self.file.sync_all()?;
        let mut dirty = self.dirty.lock();
        for id in ids {
            dirty.remove(&id);
        }
        Ok(())
    }

    fn flush_page(&self, id: PageId) -> Result<()> {
        self.write_back(id.0)?;
        self.dirty.lock().remove(&id.0);
        self.file.sync_all()?;
        Ok(())
    }
}
