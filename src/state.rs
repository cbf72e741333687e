//! Durable tree state and the header page codec
//!
//! Page 0 holds the tree's durable state: file identity (magic, version,
//! page size, layout id), the root pointer and generation pair, the
//! allocation high-water mark, a clean-shutdown flag, and an opaque
//! caller-supplied metadata blob. The whole record is covered by a CRC32
//! and rewritten in a single page write during checkpoint and close.

use crate::error::{Error, PageId, Result};
use crate::page::Page;
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Magic number identifying a stratum tree file
pub const MAGIC: u32 = 0x5354_5241;

/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_LAYOUT_ID: usize = 16;
const OFF_ROOT_ID: usize = 24;
const OFF_ROOT_GENERATION: usize = 32;
const OFF_STABLE_GENERATION: usize = 40;
const OFF_UNSTABLE_GENERATION: usize = 48;
const OFF_LAST_PAGE_ID: usize = 56;
const OFF_CHECKSUM: usize = 64;
const OFF_METADATA_LEN: usize = 68;
const OFF_METADATA: usize = 72;

bitflags! {
    /// Header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u16 {
        /// Set on clean shutdown, cleared while the tree is open for writing
        const CLEAN = 0x1;
    }
}

/// Largest metadata blob a header page of the given size can carry
pub fn max_metadata_size(page_size: usize) -> usize {
    page_size - OFF_METADATA
}

/// The durable tree state carried by the header page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeState {
    /// Current root page
    pub root_id: PageId,
    /// Generation the root was written in
    pub root_generation: u64,
    /// Generation that survived the last checkpoint
    pub stable_generation: u64,
    /// Generation in-flight writes are stamped with
    pub unstable_generation: u64,
    /// Highest allocated page id
    pub last_page_id: u64,
    /// Whether the last shutdown was clean
    pub clean: bool,
    /// Opaque caller-supplied blob, round-tripped byte-identically
    pub metadata: Vec<u8>,
}

fn checksum(buf: &[u8], metadata: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..OFF_CHECKSUM]);
    hasher.update(metadata);
    hasher.finalize()
}

/// Serialize the state into a header page
pub fn write_header(page: &mut Page, layout_id: u64, state: &TreeState) -> Result<()> {
    let page_size = page.size();
    if state.metadata.len() > max_metadata_size(page_size) {
        return Err(Error::Usage("metadata blob does not fit in the header page"));
    }

    let buf = page.as_bytes_mut();
    buf.fill(0);
    LittleEndian::write_u32(&mut buf[OFF_MAGIC..], MAGIC);
    LittleEndian::write_u32(&mut buf[OFF_VERSION..], FORMAT_VERSION);
    LittleEndian::write_u32(&mut buf[OFF_PAGE_SIZE..], page_size as u32);
    let flags = if state.clean { StateFlags::CLEAN } else { StateFlags::empty() };
    LittleEndian::write_u16(&mut buf[OFF_FLAGS..], flags.bits());
    LittleEndian::write_u64(&mut buf[OFF_LAYOUT_ID..], layout_id);
    LittleEndian::write_u64(&mut buf[OFF_ROOT_ID..], state.root_id.0);
    LittleEndian::write_u64(&mut buf[OFF_ROOT_GENERATION..], state.root_generation);
    LittleEndian::write_u64(&mut buf[OFF_STABLE_GENERATION..], state.stable_generation);
    LittleEndian::write_u64(&mut buf[OFF_UNSTABLE_GENERATION..], state.unstable_generation);
    LittleEndian::write_u64(&mut buf[OFF_LAST_PAGE_ID..], state.last_page_id);
    LittleEndian::write_u32(&mut buf[OFF_METADATA_LEN..], state.metadata.len() as u32);
    buf[OFF_METADATA..OFF_METADATA + state.metadata.len()].copy_from_slice(&state.metadata);

    let crc = checksum(buf, &state.metadata);
    LittleEndian::write_u32(&mut buf[OFF_CHECKSUM..], crc);
    Ok(())
}

/// Deserialize and verify a header page, returning the layout id and state
pub fn read_header(page: &Page) -> Result<(u64, TreeState)> {
    let buf = page.as_bytes();
    let magic = LittleEndian::read_u32(&buf[OFF_MAGIC..]);
    if magic != MAGIC {
        return Err(Error::CorruptIndex(format!("bad magic 0x{magic:08x} in header page")));
    }
    let version = LittleEndian::read_u32(&buf[OFF_VERSION..]);
    if version != FORMAT_VERSION {
        return Err(Error::MetadataMismatch {
            what: "format version",
            expected: FORMAT_VERSION as u64,
            found: version as u64,
        });
    }
    let page_size = LittleEndian::read_u32(&buf[OFF_PAGE_SIZE..]) as usize;
    if page_size != page.size() {
        return Err(Error::MetadataMismatch {
            what: "page size",
            expected: page.size() as u64,
            found: page_size as u64,
        });
    }

    let metadata_len = LittleEndian::read_u32(&buf[OFF_METADATA_LEN..]) as usize;
    if metadata_len > max_metadata_size(page_size) {
        return Err(Error::CorruptIndex(format!("metadata length {metadata_len} out of bounds")));
    }
    let metadata = buf[OFF_METADATA..OFF_METADATA + metadata_len].to_vec();

    let stored = LittleEndian::read_u32(&buf[OFF_CHECKSUM..]);
    let computed = checksum(buf, &metadata);
    if stored != computed {
        return Err(Error::CorruptIndex(format!(
            "header checksum mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}"
        )));
    }

    let flags = StateFlags::from_bits_truncate(LittleEndian::read_u16(&buf[OFF_FLAGS..]));
    let layout_id = LittleEndian::read_u64(&buf[OFF_LAYOUT_ID..]);
    let state = TreeState {
        root_id: PageId(LittleEndian::read_u64(&buf[OFF_ROOT_ID..])),
        root_generation: LittleEndian::read_u64(&buf[OFF_ROOT_GENERATION..]),
        stable_generation: LittleEndian::read_u64(&buf[OFF_STABLE_GENERATION..]),
        unstable_generation: LittleEndian::read_u64(&buf[OFF_UNSTABLE_GENERATION..]),
        last_page_id: LittleEndian::read_u64(&buf[OFF_LAST_PAGE_ID..]),
        clean: flags.contains(StateFlags::CLEAN),
        metadata,
    };
    Ok((layout_id, state))
}

/// Read the page size recorded in an existing tree file, if any
///
/// Needed before the page cache exists, since the cache itself is sized by
/// this value. Returns `None` for a missing or empty file.
pub fn probe_page_size(path: &Path) -> Result<Option<usize>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    let mut prefix = [0u8; 12];
    file.read_exact_at(&mut prefix, 0)?;
    let magic = LittleEndian::read_u32(&prefix[OFF_MAGIC..]);
    if magic != MAGIC {
        return Err(Error::CorruptIndex(format!("bad magic 0x{magic:08x} in header page")));
    }
    Ok(Some(LittleEndian::read_u32(&prefix[OFF_PAGE_SIZE..]) as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TreeState {
        TreeState {
            root_id: PageId(3),
            root_generation: 2,
            stable_generation: 2,
            unstable_generation: 3,
            last_page_id: 7,
            clean: true,
            metadata: b"label index v2".to_vec(),
        }
    }

    #[test]
    fn test_round_trip() {
        let mut page = Page::new(512);
        write_header(&mut page, 99, &state()).unwrap();
        let (layout_id, read) = read_header(&page).unwrap();
        assert_eq!(layout_id, 99);
        assert_eq!(read, state());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut page = Page::new(512);
        write_header(&mut page, 99, &state()).unwrap();
        page.as_bytes_mut()[OFF_ROOT_ID] ^= 0xff;
        assert!(matches!(read_header(&page), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let page = Page::new(512);
        assert!(read_header(&page).is_err());
    }

    #[test]
    fn test_metadata_too_large() {
        let mut page = Page::new(256);
        let mut st = state();
        st.metadata = vec![0u8; 512];
        assert!(matches!(write_header(&mut page, 1, &st), Err(Error::Usage(_))));
    }
}
