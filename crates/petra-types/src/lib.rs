//! Core value types shared by every petra storage crate.
//!
//! Everything here is either a validated newtype over a raw on-disk value
//! (`PageNumber`, `PageSize`) or a small closed enum mirroring a protocol
//! state (`LockLevel`, `PagerState`, `JournalMode`). The byte-level codecs
//! for the database header and b-tree page headers live in [`header`] and
//! [`btree`].

pub mod btree;
pub mod cx;
pub mod encoding;
pub mod flags;
pub mod header;

pub use btree::{BTreePageHeader, BTreePageType, Freeblock};
pub use cx::Cx;
pub use header::{DATABASE_HEADER_MAGIC, DATABASE_HEADER_SIZE, DatabaseHeader};

use std::fmt;
use std::num::NonZeroU32;

/// A page number in the database file.
///
/// Page numbers are 1-based; page 1 holds the 100-byte file header. A value
/// of zero is unrepresentable, so `Option<PageNumber>` stays four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNumber(NonZeroU32);

impl PageNumber {
    /// Page 1, the database header page.
    pub const ONE: Self = Self(NonZeroU32::MIN);

    /// Create a page number from a raw u32; `None` if `n` is zero.
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// The raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Database page size in bytes.
///
/// A power of two in `[512, 65536]`; the default is 4096.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageSize(u32);

impl PageSize {
    /// Minimum page size: 512 bytes.
    pub const MIN: Self = Self(512);
    /// Default page size: 4096 bytes.
    pub const DEFAULT: Self = Self(4096);
    /// Maximum page size: 65536 bytes.
    pub const MAX: Self = Self(65_536);

    /// Validate and wrap a raw page size.
    #[must_use]
    pub const fn new(size: u32) -> Option<Self> {
        if size >= 512 && size <= 65_536 && size.is_power_of_two() {
            Some(Self(size))
        } else {
            None
        }
    }

    /// The raw size in bytes.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The raw size as `usize`.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Usable bytes per page: total size minus the per-page reserved region
    /// (byte 20 of the database header).
    #[inline]
    #[must_use]
    pub const fn usable(self, reserved: u8) -> u32 {
        self.0 - reserved as u32
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The five-level database file lock, plus the transient `Unknown` marker
/// used while unwinding from a failed unlock.
///
/// Ordering follows lock strength: `None < Shared < Reserved < Pending <
/// Exclusive`. `Unknown` compares above everything and never persists past
/// the next successful lock call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Shared lock (reading).
    Shared = 1,
    /// Reserved lock (intending to write).
    Reserved = 2,
    /// Pending lock (waiting for shared holders to clear).
    Pending = 3,
    /// Exclusive lock (writing).
    Exclusive = 4,
    /// The OS-level lock state could not be determined after an error.
    Unknown = 5,
}

/// The pager's transaction state machine.
///
/// Exactly one state is active at a time. Legal transitions:
///
/// ```text
/// Open -> Reader -> WriterLocked -> WriterCacheMod -> WriterDbMod -> WriterFinished
///   ^       ^            |                |               |               |
///   |       +----- commit / rollback -----+---------------+---------------+
///   +-- last ref dropped
///
/// any writer state --I/O failure during commit/rollback--> Error -> Open
/// ```
///
/// WAL-mode connections commit straight from `WriterCacheMod` and never
/// reach `WriterDbMod` or `WriterFinished`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PagerState {
    /// No transaction; no lock held (unless in exclusive-locking mode).
    #[default]
    Open,
    /// Shared lock held; reading.
    Reader,
    /// Write transaction begun; RESERVED (or EXCLUSIVE) lock held, nothing
    /// modified yet.
    WriterLocked,
    /// At least one page modified in cache; journal header written.
    WriterCacheMod,
    /// Database file itself being modified; EXCLUSIVE lock held.
    WriterDbMod,
    /// All dirty pages flushed; waiting for journal finalization.
    WriterFinished,
    /// A commit or rollback failed; page access is poisoned until every
    /// outstanding reference is released.
    Error,
}

impl PagerState {
    /// Whether a write transaction is open in this state.
    #[must_use]
    pub const fn is_writer(self) -> bool {
        matches!(
            self,
            Self::WriterLocked | Self::WriterCacheMod | Self::WriterDbMod | Self::WriterFinished
        )
    }
}

/// Journal mode for the database connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalMode {
    /// Delete the rollback journal after each transaction.
    #[default]
    Delete,
    /// Truncate the rollback journal to zero length instead of deleting it.
    Truncate,
    /// Keep the journal file; zero its header to invalidate it.
    Persist,
    /// Keep the rollback journal in memory only.
    Memory,
    /// Write-ahead logging.
    Wal,
    /// No rollback journal at all. Crash safety is forfeited.
    Off,
}

impl JournalMode {
    /// Whether this mode uses the write-ahead log instead of a rollback
    /// journal.
    #[must_use]
    pub const fn is_wal(self) -> bool {
        matches!(self, Self::Wal)
    }
}

/// Synchronous mode gating fsync calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SynchronousMode {
    /// Never sync. Fast and unsafe.
    Off = 0,
    /// Sync at the critical moments only.
    Normal = 1,
    /// Also sync the journal a second time at commit, after the true record
    /// count is written, so the count is never ahead of the durable records.
    #[default]
    Full = 2,
}

/// WAL checkpoint mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CheckpointMode {
    /// Backfill what reader marks allow; never block, never fail on
    /// contention.
    Passive = 0,
    /// Backfill everything, reporting busy if readers block completion.
    Full = 1,
    /// Like Full, then reset the WAL so the next writer starts at frame 0.
    Restart = 2,
    /// Like Restart, then truncate the WAL file to zero bytes.
    Truncate = 3,
}
