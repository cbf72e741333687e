//! Error types for stratum

use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for tree operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Underlying page I/O failure; the operation is aborted and the stable
    /// generation is untouched
    #[error("page access error: {0}")]
    PageAccess(String),

    /// A structural invariant was violated while reading a page
    #[error("corrupted page: {details}")]
    CorruptPage {
        /// Description of the corruption
        details: String,
        /// Page where corruption was detected
        page_id: Option<PageId>,
    },

    /// The index file as a whole is unusable
    #[error("corrupted index: {0}")]
    CorruptIndex(String),

    /// Stored file metadata does not match what the caller opened with
    #[error("metadata mismatch ({what}): expected {expected}, found {found}")]
    MetadataMismatch {
        /// Which field mismatched
        what: &'static str,
        /// Expected value
        expected: u64,
        /// Value found in the header page
        found: u64,
    },

    /// Insert with `OnConflict::Fail` hit an existing key
    #[error("key already exists")]
    KeyAlreadyExists,

    /// Key-value pair exceeds what a node of this page size can hold
    #[error("entry too large: {size} bytes, max is {max} bytes for this page size")]
    EntryTooLarge {
        /// Size of the rejected entry
        size: usize,
        /// Largest entry this tree accepts
        max: usize,
    },

    /// Programming error: the API was used outside its contract
    #[error("usage error: {0}")]
    Usage(&'static str),
}

/// Page identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// The "no page" sentinel, shared with the header page id which can
    /// never be a tree node
    pub const NONE: PageId = PageId(0);

    /// Convert to byte offset in file
    pub fn to_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }

    /// Whether this id refers to an actual tree node page
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type alias for stratum operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::PageAccess(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_offset() {
        assert_eq!(PageId(3).to_offset(4096), 12288);
        assert_eq!(PageId(0).to_offset(512), 0);
    }

    #[test]
    fn test_page_id_sentinel() {
        assert!(!PageId::NONE.is_some());
        assert!(PageId(1).is_some());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, Error::PageAccess(_)));
    }
}
