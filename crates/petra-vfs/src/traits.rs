use std::path::{Path, PathBuf};

use petra_error::Result;
use petra_types::LockLevel;
use petra_types::cx::Cx;
use petra_types::flags::{
    AccessFlags, DeviceCharacteristics, ShmLockFlags, SyncFlags, VfsOpenFlags,
};

use crate::shm::ShmRegion;

/// A virtual filesystem implementation.
///
/// Abstracts every file-system operation the storage layer performs so that
/// backends can be swapped: real files on Unix, in-memory storage for
/// tests, or custom implementations.
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS (e.g. "unix", "memory").
    fn name(&self) -> &'static str;

    /// Open a file.
    ///
    /// `path` is `None` for temporary files that should be auto-named.
    /// `flags` describes what kind of file this is (main database, journal,
    /// WAL) and how to open it. Returns the opened file together with the
    /// flags actually applied (the VFS may add flags such as `READWRITE`
    /// when `CREATE` is requested).
    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)>;

    /// Delete a file. When `sync_dir` is set, also sync the containing
    /// directory so the deletion itself is durable.
    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()>;

    /// Check file accessibility per `flags`.
    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool>;

    /// Resolve a possibly-relative path to an absolute one.
    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf>;

    /// Fill `buf` with bytes suitable for salts and temp-file names.
    fn randomness(&self, cx: &Cx, buf: &mut [u8]);

    /// Current time as a Julian day number.
    fn current_time(&self, cx: &Cx) -> f64 {
        let _ = cx;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        // Unix epoch in Julian days: 2440587.5.
        #[allow(clippy::cast_precision_loss)]
        let julian = 2_440_587.5 + (now.as_secs_f64() / 86_400.0);
        julian
    }
}

/// A file handle opened by a [`Vfs`].
pub trait VfsFile: Send + Sync {
    /// Close the file. The handle must not be used afterwards.
    fn close(&mut self, cx: &Cx) -> Result<()>;

    /// Read `buf.len()` bytes at byte `offset`.
    ///
    /// Returns the number of bytes actually read; on a short read the tail
    /// of `buf` is zero-filled.
    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` at byte `offset`, extending the file if needed.
    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()>;

    /// Flush file contents to stable storage.
    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()>;

    /// Current file size in bytes.
    fn file_size(&self, cx: &Cx) -> Result<u64>;

    /// Acquire the database file lock at `level`.
    ///
    /// The five-level ladder None < Shared < Reserved < Pending < Exclusive
    /// must be climbed one conceptual rung at a time; a conflicting holder
    /// yields `PetraError::Busy`.
    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Release the lock down to `level` (Shared or None).
    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Whether any connection holds a RESERVED or stronger lock.
    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool>;

    /// Minimum write granularity of the underlying storage.
    fn sector_size(&self) -> u32 {
        4096
    }

    /// Capability bits of the underlying storage device.
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }

    // --- Shared memory (WAL mode) ---

    /// Map the `region`-th shared-memory region of `size` bytes.
    ///
    /// Returns `None` when the region does not exist and `extend` is false;
    /// creates it when `extend` is true.
    fn shm_map(&mut self, cx: &Cx, region: u32, size: u32, extend: bool)
    -> Result<Option<ShmRegion>>;

    /// Acquire or release shared-memory lock slots `offset .. offset + n`.
    ///
    /// `flags` combines LOCK/UNLOCK with SHARED/EXCLUSIVE. Contention
    /// yields `PetraError::Busy` without blocking.
    fn shm_lock(&mut self, cx: &Cx, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()>;

    /// Memory barrier: all shared-memory writes before this call are
    /// visible to other connections before any read after it.
    fn shm_barrier(&self);

    /// Unmap all shared-memory regions; delete the backing store when
    /// `delete` is set (last connection closing the WAL).
    fn shm_unmap(&mut self, cx: &Cx, delete: bool) -> Result<()>;
}
