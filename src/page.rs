//! Page structures and the slotted byte format
//!
//! Pages are the fundamental unit of storage. Each page starts with a fixed
//! header, followed by a slot array growing upward from `lower` and an entry
//! heap growing downward from `upper`. Slots hold absolute u16 offsets of
//! entries and are kept in key order; entries are `key_len, val_len, key,
//! value`. Internal pages reserve eight bytes after the header for the
//! leftmost child id, so `child(i)` covers keys below `key(i)` and
//! `child(i + 1)` covers keys at or above it.

use crate::error::{Error, PageId, Result};
use crate::layout::Layout;
use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 256;

/// Largest supported page size
pub const MAX_PAGE_SIZE: usize = 16384;

/// Node type tag for leaf pages
pub const NODE_LEAF: u8 = 1;

/// Node type tag for internal pages
pub const NODE_INTERNAL: u8 = 2;

/// Size of the fixed page header
pub const PAGE_HEADER_SIZE: usize = 40;

/// Size of one entry header (key length + value length)
pub const ENTRY_HEADER_SIZE: usize = 4;

/// Size of one slot
pub const SLOT_SIZE: usize = 2;

/// Size of the leftmost-child field on internal pages
pub const CHILD_PTR_SIZE: usize = 8;

const OFF_NODE_TYPE: usize = 0;
const OFF_KEY_COUNT: usize = 2;
const OFF_LOWER: usize = 4;
const OFF_UPPER: usize = 6;
const OFF_GENERATION: usize = 8;
const OFF_LEFT_SIBLING: usize = 16;
const OFF_RIGHT_SIBLING: usize = 24;
const OFF_SUCCESSOR: usize = 32;

const_assert!(OFF_SUCCESSOR + 8 == PAGE_HEADER_SIZE);
const_assert!(MIN_PAGE_SIZE > PAGE_HEADER_SIZE + CHILD_PTR_SIZE);

/// Largest key+value payload a tree with the given page size accepts
///
/// Capped so any node holds at least three entries and a split of an
/// overfull node always succeeds.
pub fn max_entry_size(page_size: usize) -> usize {
    let usable = page_size - PAGE_HEADER_SIZE - CHILD_PTR_SIZE;
    usable / 4 - ENTRY_HEADER_SIZE - SLOT_SIZE
}

/// Result of searching for a key in a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key was found at index
    Found {
        /// Index of the found key
        index: usize,
    },
    /// Key was not found, would be inserted at position
    NotFound {
        /// Position where the key would be inserted
        insert_pos: usize,
    },
}

/// A page buffer with header and slotted-entry accessors
pub struct Page {
    buf: Box<[u8]>,
}

impl Page {
    /// Create a new zeroed page
    pub fn new(page_size: usize) -> Self {
        debug_assert!((MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size));
        Self { buf: vec![0u8; page_size].into_boxed_slice() }
    }

    /// Wrap an existing page-sized buffer
    pub fn from_bytes(buf: Box<[u8]>) -> Self {
        Self { buf }
    }

    /// Page size in bytes
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Raw page bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable raw page bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Initialize as an empty node of the given type
    pub fn init(&mut self, node_type: u8) {
        debug_assert!(node_type == NODE_LEAF || node_type == NODE_INTERNAL);
        self.buf.fill(0);
        self.buf[OFF_NODE_TYPE] = node_type;
        let start = self.slots_start();
        self.set_lower(start as u16);
        self.set_upper(self.size() as u16);
    }

    /// Node type tag
    pub fn node_type(&self) -> u8 {
        self.buf[OFF_NODE_TYPE]
    }

    /// Whether this is a leaf page
    pub fn is_leaf(&self) -> bool {
        self.node_type() == NODE_LEAF
    }

    /// Whether this is an internal page
    pub fn is_internal(&self) -> bool {
        self.node_type() == NODE_INTERNAL
    }

    /// Number of keys stored
    pub fn key_count(&self) -> usize {
        LittleEndian::read_u16(&self.buf[OFF_KEY_COUNT..]) as usize
    }

    fn set_key_count(&mut self, count: usize) {
        LittleEndian::write_u16(&mut self.buf[OFF_KEY_COUNT..], count as u16);
    }

    fn lower(&self) -> usize {
        LittleEndian::read_u16(&self.buf[OFF_LOWER..]) as usize
    }

    fn set_lower(&mut self, lower: u16) {
        LittleEndian::write_u16(&mut self.buf[OFF_LOWER..], lower);
    }

    fn upper(&self) -> usize {
        LittleEndian::read_u16(&self.buf[OFF_UPPER..]) as usize
    }

    fn set_upper(&mut self, upper: u16) {
        LittleEndian::write_u16(&mut self.buf[OFF_UPPER..], upper);
    }

    /// Generation stamp of the last structural write
    pub fn generation(&self) -> u64 {
        LittleEndian::read_u64(&self.buf[OFF_GENERATION..])
    }

    /// Stamp the generation
    pub fn set_generation(&mut self, generation: u64) {
        LittleEndian::write_u64(&mut self.buf[OFF_GENERATION..], generation);
    }

    /// Left sibling at the same level, `PageId::NONE` if leftmost
    pub fn left_sibling(&self) -> PageId {
        PageId(LittleEndian::read_u64(&self.buf[OFF_LEFT_SIBLING..]))
    }

    /// Set the left sibling
    pub fn set_left_sibling(&mut self, id: PageId) {
        LittleEndian::write_u64(&mut self.buf[OFF_LEFT_SIBLING..], id.0);
    }

    /// Right sibling at the same level, `PageId::NONE` if rightmost
    pub fn right_sibling(&self) -> PageId {
        PageId(LittleEndian::read_u64(&self.buf[OFF_RIGHT_SIBLING..]))
    }

    /// Set the right sibling
    pub fn set_right_sibling(&mut self, id: PageId) {
        LittleEndian::write_u64(&mut self.buf[OFF_RIGHT_SIBLING..], id.0);
    }

    /// Page that structurally replaced this one, `PageId::NONE` if current
    pub fn successor(&self) -> PageId {
        PageId(LittleEndian::read_u64(&self.buf[OFF_SUCCESSOR..]))
    }

    /// Set the successor pointer
    pub fn set_successor(&mut self, id: PageId) {
        LittleEndian::write_u64(&mut self.buf[OFF_SUCCESSOR..], id.0);
    }

    /// Offset of the first slot, past the leftmost-child field on internal
    /// pages
    pub fn slots_start(&self) -> usize {
        if self.is_internal() {
            PAGE_HEADER_SIZE + CHILD_PTR_SIZE
        } else {
            PAGE_HEADER_SIZE
        }
    }

    /// Free bytes between the slot array and the entry heap
    pub fn free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    /// Whether an entry of the given payload size can be inserted
    pub fn fits(&self, key_len: usize, val_len: usize) -> bool {
        self.free_space() >= ENTRY_HEADER_SIZE + key_len + val_len + SLOT_SIZE
    }

    /// Check the structural header invariants
    pub fn validate(&self, page_id: PageId) -> Result<()> {
        let node_type = self.node_type();
        if node_type != NODE_LEAF && node_type != NODE_INTERNAL {
            return Err(Error::CorruptPage {
                details: format!("invalid node type tag {node_type}"),
                page_id: Some(page_id),
            });
        }
        let expected_lower = self.slots_start() + self.key_count() * SLOT_SIZE;
        if self.lower() != expected_lower || self.upper() > self.size() || self.lower() > self.upper()
        {
            return Err(Error::CorruptPage {
                details: format!(
                    "key count {} inconsistent with bounds {}..{}",
                    self.key_count(),
                    self.lower(),
                    self.upper()
                ),
                page_id: Some(page_id),
            });
        }
        Ok(())
    }

    fn slot(&self, index: usize) -> usize {
        assert!(index < self.key_count(), "slot index out of bounds");
        let off = self.slots_start() + index * SLOT_SIZE;
        LittleEndian::read_u16(&self.buf[off..]) as usize
    }

    fn set_slot(&mut self, index: usize, entry_offset: usize) {
        let off = self.slots_start() + index * SLOT_SIZE;
        LittleEndian::write_u16(&mut self.buf[off..], entry_offset as u16);
    }

    fn entry_bounds(&self, index: usize) -> Result<(usize, usize, usize)> {
        let off = self.slot(index);
        if off < self.upper() || off + ENTRY_HEADER_SIZE > self.size() {
            return Err(Error::CorruptPage {
                details: format!("entry offset {off} out of bounds"),
                page_id: None,
            });
        }
        let key_len = LittleEndian::read_u16(&self.buf[off..]) as usize;
        let val_len = LittleEndian::read_u16(&self.buf[off + 2..]) as usize;
        if off + ENTRY_HEADER_SIZE + key_len + val_len > self.size() {
            return Err(Error::CorruptPage {
                details: format!("entry at {off} extends beyond page"),
                page_id: None,
            });
        }
        Ok((off, key_len, val_len))
    }

    /// Key bytes at index
    pub fn key_at(&self, index: usize) -> Result<&[u8]> {
        let (off, key_len, _) = self.entry_bounds(index)?;
        let start = off + ENTRY_HEADER_SIZE;
        Ok(&self.buf[start..start + key_len])
    }

    /// Value bytes at index
    pub fn value_at(&self, index: usize) -> Result<&[u8]> {
        let (off, key_len, val_len) = self.entry_bounds(index)?;
        let start = off + ENTRY_HEADER_SIZE + key_len;
        Ok(&self.buf[start..start + val_len])
    }

    /// Child page id at index, for internal pages
    ///
    /// Index 0 is the leftmost child; index `i + 1` is the child stored
    /// with key `i`. Valid indices are `0..=key_count`.
    pub fn child_at(&self, index: usize) -> Result<PageId> {
        debug_assert!(self.is_internal());
        assert!(index <= self.key_count(), "child index out of bounds");
        if index == 0 {
            return Ok(PageId(LittleEndian::read_u64(&self.buf[PAGE_HEADER_SIZE..])));
        }
        let value = self.value_at(index - 1)?;
        if value.len() != CHILD_PTR_SIZE {
            return Err(Error::CorruptPage {
                details: format!("child pointer has {} bytes", value.len()),
                page_id: None,
            });
        }
        Ok(PageId(LittleEndian::read_u64(value)))
    }

    /// Overwrite the child page id at index
    pub fn set_child_at(&mut self, index: usize, id: PageId) -> Result<()> {
        debug_assert!(self.is_internal());
        assert!(index <= self.key_count(), "child index out of bounds");
        if index == 0 {
            LittleEndian::write_u64(&mut self.buf[PAGE_HEADER_SIZE..], id.0);
            return Ok(());
        }
        let (off, key_len, val_len) = self.entry_bounds(index - 1)?;
        if val_len != CHILD_PTR_SIZE {
            return Err(Error::CorruptPage {
                details: format!("child pointer has {val_len} bytes"),
                page_id: None,
            });
        }
        let start = off + ENTRY_HEADER_SIZE + key_len;
        LittleEndian::write_u64(&mut self.buf[start..], id.0);
        Ok(())
    }

    /// Search for a key using binary search over the sorted slots
    pub fn search<L: Layout>(&self, key: &[u8]) -> Result<SearchResult> {
        let mut left = 0;
        let mut right = self.key_count();
        while left < right {
            let mid = left + (right - left) / 2;
            match L::compare(key, self.key_at(mid)?) {
                std::cmp::Ordering::Less => right = mid,
                std::cmp::Ordering::Greater => left = mid + 1,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found { index: mid }),
            }
        }
        Ok(SearchResult::NotFound { insert_pos: left })
    }

    /// Insert an entry at the given slot index, shifting later slots
    ///
    /// The caller must have checked `fits`; running out of space here is a
    /// programming error.
    pub fn insert_at(&mut self, index: usize, key: &[u8], value: &[u8]) {
        let count = self.key_count();
        assert!(index <= count, "insert index out of bounds");
        assert!(self.fits(key.len(), value.len()), "insert into full page");

        let need = ENTRY_HEADER_SIZE + key.len() + value.len();
        let entry_off = self.upper() - need;
        self.set_upper(entry_off as u16);

        LittleEndian::write_u16(&mut self.buf[entry_off..], key.len() as u16);
        LittleEndian::write_u16(&mut self.buf[entry_off + 2..], value.len() as u16);
        let key_start = entry_off + ENTRY_HEADER_SIZE;
        self.buf[key_start..key_start + key.len()].copy_from_slice(key);
        let val_start = key_start + key.len();
        self.buf[val_start..val_start + value.len()].copy_from_slice(value);

        // shift slots [index..count) one position right
        let start = self.slots_start() + index * SLOT_SIZE;
        let end = self.slots_start() + count * SLOT_SIZE;
        self.buf.copy_within(start..end, start + SLOT_SIZE);

        self.set_key_count(count + 1);
        self.set_lower((self.slots_start() + (count + 1) * SLOT_SIZE) as u16);
        self.set_slot(index, entry_off);
    }

    /// Remove the entry at the given slot index
    ///
    /// Heap space is not reclaimed; copy-on-write copies compact.
    pub fn remove_at(&mut self, index: usize) {
        let count = self.key_count();
        assert!(index < count, "remove index out of bounds");

        let start = self.slots_start() + (index + 1) * SLOT_SIZE;
        let end = self.slots_start() + count * SLOT_SIZE;
        self.buf.copy_within(start..end, start - SLOT_SIZE);

        self.set_key_count(count - 1);
        self.set_lower((self.slots_start() + (count - 1) * SLOT_SIZE) as u16);
    }

    /// Replace the value at index in place; lengths must match
    pub fn set_value_at(&mut self, index: usize, value: &[u8]) -> Result<()> {
        let (off, key_len, val_len) = self.entry_bounds(index)?;
        assert_eq!(val_len, value.len(), "in-place value must keep its size");
        let start = off + ENTRY_HEADER_SIZE + key_len;
        self.buf[start..start + value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Drop all entries from `from_index` on, keeping the slot prefix
    pub fn truncate(&mut self, from_index: usize) {
        if from_index >= self.key_count() {
            return;
        }
        self.set_key_count(from_index);
        self.set_lower((self.slots_start() + from_index * SLOT_SIZE) as u16);
    }

    /// Compact the page in place, reclaiming dead heap space
    ///
    /// Needed after `truncate` on a page that keeps receiving entries,
    /// since neither `remove_at` nor `truncate` reclaims the heap.
    pub fn compact(&mut self) -> Result<()> {
        let mut fresh = Page::new(self.size());
        self.compact_into(&mut fresh)?;
        fresh.set_generation(self.generation());
        fresh.set_successor(self.successor());
        self.buf.copy_from_slice(fresh.as_bytes());
        Ok(())
    }

    /// Rewrite this page's live entries compactly into a fresh page
    ///
    /// Sibling links and the leftmost child carry over; the generation and
    /// successor of the copy are the caller's to stamp.
    pub fn compact_into(&self, dst: &mut Page) -> Result<()> {
        debug_assert_eq!(self.size(), dst.size());
        dst.init(self.node_type());
        dst.set_left_sibling(self.left_sibling());
        dst.set_right_sibling(self.right_sibling());
        if self.is_internal() {
            let leftmost = self.child_at(0)?;
            LittleEndian::write_u64(&mut dst.buf[PAGE_HEADER_SIZE..], leftmost.0);
        }
        for i in 0..self.key_count() {
            dst.insert_at(i, self.key_at(i)?, self.value_at(i)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LexicographicLayout;

    fn leaf() -> Page {
        let mut page = Page::new(512);
        page.init(NODE_LEAF);
        page
    }

    #[test]
    fn test_init_empty() {
        let page = leaf();
        assert!(page.is_leaf());
        assert_eq!(page.key_count(), 0);
        assert_eq!(page.free_space(), 512 - PAGE_HEADER_SIZE);
        assert!(page.validate(PageId(1)).is_ok());
    }

    #[test]
    fn test_insert_and_read() {
        let mut page = leaf();
        page.insert_at(0, b"bbb", b"2");
        page.insert_at(0, b"aaa", b"1");
        page.insert_at(2, b"ccc", b"3");

        assert_eq!(page.key_count(), 3);
        assert_eq!(page.key_at(0).unwrap(), b"aaa");
        assert_eq!(page.key_at(1).unwrap(), b"bbb");
        assert_eq!(page.key_at(2).unwrap(), b"ccc");
        assert_eq!(page.value_at(1).unwrap(), b"2");
    }

    #[test]
    fn test_search() {
        let mut page = leaf();
        for (i, key) in [b"aa", b"cc", b"ee"].iter().enumerate() {
            page.insert_at(i, *key, b"v");
        }
        assert_eq!(
            page.search::<LexicographicLayout>(b"cc").unwrap(),
            SearchResult::Found { index: 1 }
        );
        assert_eq!(
            page.search::<LexicographicLayout>(b"dd").unwrap(),
            SearchResult::NotFound { insert_pos: 2 }
        );
        assert_eq!(
            page.search::<LexicographicLayout>(b"a").unwrap(),
            SearchResult::NotFound { insert_pos: 0 }
        );
    }

    #[test]
    fn test_remove_shifts_slots() {
        let mut page = leaf();
        for (i, key) in [b"aa", b"bb", b"cc"].iter().enumerate() {
            page.insert_at(i, *key, b"v");
        }
        page.remove_at(1);
        assert_eq!(page.key_count(), 2);
        assert_eq!(page.key_at(0).unwrap(), b"aa");
        assert_eq!(page.key_at(1).unwrap(), b"cc");
    }

    #[test]
    fn test_children() {
        let mut page = Page::new(512);
        page.init(NODE_INTERNAL);
        page.set_child_at(0, PageId(10)).unwrap();
        page.insert_at(0, b"mm", &20u64.to_le_bytes());
        page.insert_at(1, b"tt", &30u64.to_le_bytes());

        assert_eq!(page.child_at(0).unwrap(), PageId(10));
        assert_eq!(page.child_at(1).unwrap(), PageId(20));
        assert_eq!(page.child_at(2).unwrap(), PageId(30));

        page.set_child_at(1, PageId(25)).unwrap();
        assert_eq!(page.child_at(1).unwrap(), PageId(25));
    }

    #[test]
    fn test_fits_and_fill() {
        let mut page = leaf();
        let mut count = 0;
        while page.fits(8, 8) {
            let key = format!("key{count:05}");
            page.insert_at(count, key.as_bytes(), b"deadbeef");
            count += 1;
        }
        assert!(count > 10);
        assert_eq!(page.key_count(), count);
        assert!(page.validate(PageId(1)).is_ok());
    }

    #[test]
    fn test_compact_reclaims_removed_space() {
        let mut page = leaf();
        for i in 0..10 {
            let key = format!("key{i:02}");
            page.insert_at(i, key.as_bytes(), b"somevalue");
        }
        for _ in 0..8 {
            page.remove_at(0);
        }
        let before = page.free_space();

        let mut copy = Page::new(512);
        page.compact_into(&mut copy).unwrap();
        assert_eq!(copy.key_count(), 2);
        assert_eq!(copy.key_at(0).unwrap(), b"key08");
        assert!(copy.free_space() > before);
    }

    #[test]
    fn test_validate_rejects_bad_type() {
        let mut page = leaf();
        page.as_bytes_mut()[0] = 9;
        assert!(page.validate(PageId(1)).is_err());
    }

    #[test]
    fn test_max_entry_size_leaves_room() {
        for page_size in [256, 512, 4096, 16384] {
            let max = max_entry_size(page_size);
            let mut page = Page::new(page_size);
            page.init(NODE_LEAF);
            // three maximal entries must fit in any node
            for i in 0..3 {
                assert!(page.fits(max / 2, max - max / 2));
                page.insert_at(i, &vec![i as u8; max / 2], &vec![0u8; max - max / 2]);
            }
        }
    }
}
