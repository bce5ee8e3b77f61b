use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for petra storage operations.
///
/// Modeled after SQLite's result codes with Rust-idiomatic structure:
/// structured variants for common cases, detail strings where a code alone
/// would lose diagnostic context.
#[derive(Error, Debug)]
pub enum PetraError {
    // === I/O Errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk I/O error during database read.
    #[error("disk I/O error reading page {page}")]
    IoRead { page: u32 },

    /// Disk I/O error during database write.
    #[error("disk I/O error writing page {page}")]
    IoWrite { page: u32 },

    /// Short read (fewer bytes than expected).
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Cannot open file.
    #[error("unable to open database file: '{path}'")]
    CannotOpen { path: PathBuf },

    // === Contention ===
    /// Another connection holds a conflicting lock.
    #[error("database is locked")]
    Busy,

    /// Another connection is running crash recovery on the WAL.
    #[error("database is locked (recovery in progress)")]
    BusyRecovery,

    /// A table-level or shared-cache style lock conflict.
    #[error("database table is locked")]
    Locked,

    /// File locking failed at the VFS level.
    #[error("file locking failed: {detail}")]
    LockFailed { detail: String },

    /// A cooperating connection is not honoring the locking discipline.
    ///
    /// Surfaced only after the bounded retry budget is exhausted; unlike
    /// [`Busy`](Self::Busy) this is not retryable.
    #[error("locking protocol violation: {detail}")]
    Protocol { detail: String },

    // === Corruption ===
    /// Database file is corrupt.
    #[error("database disk image is malformed: {detail}")]
    DatabaseCorrupt { detail: String },

    /// Rollback journal is corrupt beyond the tolerated truncated tail.
    #[error("rollback journal is malformed: {detail}")]
    JournalCorrupt { detail: String },

    /// WAL file is corrupt.
    #[error("WAL file is corrupt: {detail}")]
    WalCorrupt { detail: String },

    /// Database file is not a valid database.
    #[error("file is not a database: '{path}'")]
    NotADatabase { path: PathBuf },

    // === Resource limits ===
    /// Database or disk is full.
    #[error("database or disk is full")]
    Full,

    /// Value out of range.
    #[error("{what} out of range: {value}")]
    OutOfRange { what: String, value: String },

    // === Usage ===
    /// Attempt to write a read-only database.
    #[error("attempt to write a readonly database")]
    ReadOnly,

    /// The API was used out of sequence (e.g. commit without a write
    /// transaction).
    #[error("library routine called out of sequence: {detail}")]
    Misuse { detail: String },

    /// Operation is not supported by the current backend or configuration.
    #[error("unsupported operation")]
    Unsupported,

    /// Operation was cancelled through its `Cx` context.
    #[error("interrupted")]
    Interrupted,

    // === WAL / checkpoint ===
    /// WAL checkpoint failed.
    #[error("WAL checkpoint failed: {detail}")]
    CheckpointFailed { detail: String },

    // === Internal ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// SQLite-compatible result/error codes.
///
/// These match the numeric values from C SQLite's `sqlite3.h`; petra keeps
/// them so diagnostics and exit codes line up with the format it speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Access permission denied.
    Perm = 3,
    /// Callback requested abort.
    Abort = 4,
    /// Database file is locked.
    Busy = 5,
    /// Table is locked.
    Locked = 6,
    /// Out of memory.
    NoMem = 7,
    /// Attempt to write a read-only database.
    ReadOnly = 8,
    /// Interrupted.
    Interrupt = 9,
    /// Disk I/O error.
    IoErr = 10,
    /// Database disk image is malformed.
    Corrupt = 11,
    /// Not found (internal).
    NotFound = 12,
    /// Database or disk is full.
    Full = 13,
    /// Unable to open database file.
    CantOpen = 14,
    /// Locking protocol error.
    Protocol = 15,
    /// Database schema has changed.
    Schema = 17,
    /// String or BLOB exceeds size limit.
    TooBig = 18,
    /// Constraint violation.
    Constraint = 19,
    /// Data type mismatch.
    Mismatch = 20,
    /// Library used incorrectly.
    Misuse = 21,
    /// OS feature not available.
    NoLfs = 22,
    /// Bind parameter out of range.
    Range = 25,
    /// Not a database file.
    NotADb = 26,
}

impl PetraError {
    /// Map this error to a SQLite error code for compatibility.
    #[allow(clippy::match_same_arms)]
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Io(_)
            | Self::IoRead { .. }
            | Self::IoWrite { .. }
            | Self::ShortRead { .. }
            | Self::CheckpointFailed { .. } => ErrorCode::IoErr,
            Self::CannotOpen { .. } => ErrorCode::CantOpen,
            Self::Busy | Self::BusyRecovery | Self::LockFailed { .. } => ErrorCode::Busy,
            Self::Locked => ErrorCode::Locked,
            Self::Protocol { .. } => ErrorCode::Protocol,
            Self::DatabaseCorrupt { .. } | Self::JournalCorrupt { .. } | Self::WalCorrupt { .. } => {
                ErrorCode::Corrupt
            }
            Self::NotADatabase { .. } => ErrorCode::NotADb,
            Self::Full => ErrorCode::Full,
            Self::OutOfRange { .. } => ErrorCode::Range,
            Self::ReadOnly => ErrorCode::ReadOnly,
            Self::Misuse { .. } => ErrorCode::Misuse,
            Self::Unsupported => ErrorCode::NoLfs,
            Self::Interrupted => ErrorCode::Interrupt,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    ///
    /// Transient errors are the ones a busy-handler loop is allowed to
    /// swallow; everything else must surface to the caller.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::BusyRecovery | Self::Locked | Self::LockFailed { .. }
        )
    }

    /// Get the process exit code for this error (for CLI use).
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.error_code() as i32
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a misuse error.
    pub fn misuse(detail: impl Into<String>) -> Self {
        Self::Misuse {
            detail: detail.into(),
        }
    }

    /// Create a protocol-violation error.
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `PetraError`.
pub type Result<T> = std::result::Result<T, PetraError>;
