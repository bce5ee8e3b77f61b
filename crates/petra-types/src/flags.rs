//! Bitflag sets used across the VFS boundary.

use bitflags::bitflags;

bitflags! {
    /// Flags passed to `Vfs::open`, describing both what kind of file is
    /// being opened and how.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VfsOpenFlags: u32 {
        /// Open read-only.
        const READONLY = 0x0000_0001;
        /// Open read-write.
        const READWRITE = 0x0000_0002;
        /// Create the file if it does not exist.
        const CREATE = 0x0000_0004;
        /// Fail if the file already exists (with CREATE).
        const EXCLUSIVE = 0x0000_0010;
        /// Delete the file when the handle closes.
        const DELETE_ON_CLOSE = 0x0000_0008;

        /// The main database file.
        const MAIN_DB = 0x0000_0100;
        /// A temporary database.
        const TEMP_DB = 0x0000_0200;
        /// A rollback journal for a main database.
        const MAIN_JOURNAL = 0x0000_0800;
        /// A write-ahead log file.
        const WAL = 0x0008_0000;
        /// A super-journal coordinating a multi-database commit.
        const SUPER_JOURNAL = 0x0000_4000;
    }
}

bitflags! {
    /// Flags for `Vfs::access` existence/permission checks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// Does the file exist?
        const EXISTS = 0x01;
        /// Is the file readable and writable?
        const READWRITE = 0x02;
    }
}

bitflags! {
    /// Flags for `VfsFile::sync`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        /// Normal fsync.
        const NORMAL = 0x02;
        /// Full barrier sync (F_FULLFSYNC where available).
        const FULL = 0x03;
        /// Sync data only, not metadata.
        const DATAONLY = 0x10;
    }
}

bitflags! {
    /// Device capability bits reported by `VfsFile::device_characteristics`.
    ///
    /// These gate optional fast paths only; the mandatory commit protocol
    /// never depends on them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceCharacteristics: u32 {
        /// Appends never expose garbage past the old EOF.
        const SAFE_APPEND = 0x0000_0200;
        /// Writes are applied in order.
        const SEQUENTIAL = 0x0000_0400;
        /// An interrupted overwrite leaves old bytes outside the written
        /// range intact.
        const POWERSAFE_OVERWRITE = 0x0000_1000;
        /// The VFS supports atomic multi-write batches.
        const BATCH_ATOMIC = 0x0000_4000;
    }
}

bitflags! {
    /// Flags for `VfsFile::shm_lock`; exactly one of LOCK/UNLOCK and one of
    /// SHARED/EXCLUSIVE must be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShmLockFlags: u32 {
        const UNLOCK = 0x01;
        const LOCK = 0x02;
        const SHARED = 0x04;
        const EXCLUSIVE = 0x08;
    }
}
