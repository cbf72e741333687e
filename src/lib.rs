//! Persistent ordered key-value index on copy-on-write pages
//!
//! This crate provides a B+-tree built directly on fixed-size pages:
//! point lookups, ordered range scans, in-place mutation under a single
//! writer with concurrent readers, and crash-safe checkpointing without a
//! write-ahead log. Durability comes from a generation-stamped
//! copy-on-write discipline: structural changes never touch pages that
//! survived the last checkpoint, so the checkpointed tree is always valid
//! and an unclean shutdown is resolved by a recovery pass on the next
//! open.
//!
//! Keys and values are opaque byte strings ordered by a [`Layout`] fixed
//! at open time. Pages are consumed through the [`PageCache`] capability;
//! [`FilePageCache`] is the bundled file-backed implementation.
//!
//! ```no_run
//! use stratum::{OnConflict, Tree};
//!
//! # fn main() -> stratum::Result<()> {
//! let tree: Tree = Tree::open("index.db")?;
//! {
//!     let mut writer = tree.writer()?;
//!     writer.insert(b"a", b"1", OnConflict::Fail)?;
//!     writer.insert(b"b", b"2", OnConflict::Fail)?;
//! }
//! tree.checkpoint()?;
//! for entry in tree.seek(b"a", b"c")? {
//!     let (key, value) = entry?;
//!     println!("{key:?} = {value:?}");
//! }
//! tree.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod check;
pub mod error;
pub mod freelist;
pub mod layout;
pub mod page;
pub mod recover;
pub mod seek;
pub mod state;
pub mod tree;
pub mod writer;

// Re-exports
pub use cache::{FilePageCache, PageCache, PageRead, PageWrite};
pub use check::ConsistencyViolation;
pub use error::{Error, PageId, Result};
pub use layout::{FixedU64Layout, Layout, LexicographicLayout};
pub use recover::RecoveryStats;
pub use seek::Seeker;
pub use state::TreeState;
pub use tree::{Tree, TreeOptions};
pub use writer::{OnConflict, Writer};

/// The default page size (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
