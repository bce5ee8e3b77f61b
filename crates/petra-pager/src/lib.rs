//! The pager: transactional page access over a database file.
//!
//! A [`Pager`] owns one database file and mediates every read and write
//! through its page cache. Durability comes from one of two protocols: the
//! rollback journal (pre-images of changed pages, replayed on rollback or
//! after a crash) or the write-ahead log from `petra-wal` (new images
//! appended to a side file, checkpointed back later). The [`pager`] module
//! holds the state machine, [`journal`] the journal file format, and
//! [`walker`] a diagnostic traversal that reports per-page statistics of a
//! b-tree.

pub mod bitvec;
pub mod journal;
pub mod page_cache;
pub mod pager;
pub mod walker;

pub use bitvec::PageBitvec;
pub use page_cache::{CachedPage, PageCache};
pub use pager::{BusyPolicy, Pager, PagerConfig, journal_path};
pub use walker::{BTreeStat, PageStatRow, aggregate_stats, walk_btree};
