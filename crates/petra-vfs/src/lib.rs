//! Virtual filesystem layer for petra.
//!
//! Everything above this crate does file I/O exclusively through the [`Vfs`]
//! and [`VfsFile`] traits. Two backends ship here: [`MemoryVfs`] for tests
//! and in-memory databases, and [`UnixVfs`] over real files with POSIX
//! advisory locks.
//!
//! POSIX `fcntl` locks are per-process, so cross-handle lock conflicts
//! within one process are only observable through [`MemoryVfs`]; tests that
//! exercise the locking protocols use it for that reason.

pub mod memory;
pub mod shm;
pub mod traits;
#[cfg(unix)]
pub mod unix;

pub use memory::MemoryVfs;
pub use shm::{ShmRegion, ShmRegionGuard};
pub use traits::{Vfs, VfsFile};
#[cfg(unix)]
pub use unix::UnixVfs;
