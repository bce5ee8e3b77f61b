//! Safe shared-memory region handle for wal-index coordination.
//!
//! The shm interface hands out fixed-size regions (32 KB each) of the
//! wal-index. Instead of raw pointers, petra exposes a bounds-checked
//! handle whose clones share the same backing buffer; VFS backends build it
//! from whatever storage they manage (heap buffers for `MemoryVfs`, a
//! per-path table for `UnixVfs`).

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// A handle to one mapped shared-memory region.
///
/// Clones alias the same bytes. Access goes through [`ShmRegion::lock`],
/// which serializes byte-level access within the process; cross-connection
/// ordering is the caller's job via `VfsFile::shm_barrier` and the shm lock
/// slots.
#[derive(Debug, Clone)]
pub struct ShmRegion {
    len: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

impl ShmRegion {
    /// A new zeroed region of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            len: size,
            data: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    /// Region size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is zero-length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the region bytes; the guard releases on drop.
    #[must_use]
    pub fn lock(&self) -> ShmRegionGuard<'_> {
        ShmRegionGuard {
            guard: self.data.lock(),
        }
    }

    /// Copy `src` into the region at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) {
        let mut guard = self.lock();
        guard[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Copy region bytes at `offset` into `dst`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let guard = self.lock();
        dst.copy_from_slice(&guard[offset..offset + dst.len()]);
    }
}

/// Locked shm region access guard.
pub struct ShmRegionGuard<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl Deref for ShmRegionGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.as_slice()
    }
}

impl DerefMut for ShmRegionGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.as_mut_slice()
    }
}
