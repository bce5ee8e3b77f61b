//! In-memory VFS used by tests and in-memory databases.
//!
//! All files live in a shared table keyed by path, so multiple handles
//! opened through the same `MemoryVfs` see one another's writes, locks, and
//! shared memory. That is enough to exercise the full pager and WAL locking
//! protocols single-process.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use parking_lot::Mutex;

use petra_error::{PetraError, Result};
use petra_types::LockLevel;
use petra_types::cx::Cx;
use petra_types::flags::{AccessFlags, ShmLockFlags, SyncFlags, VfsOpenFlags};

use crate::shm::ShmRegion;
use crate::traits::{Vfs, VfsFile};

/// Number of shared-memory lock slots, matching the wal-index layout.
pub const SHM_LOCK_SLOTS: usize = 8;

/// Database-file lock table shared by every handle on one path.
#[derive(Debug, Default)]
struct FileLocks {
    /// Handles holding at least SHARED.
    shared: HashSet<u64>,
    reserved: Option<u64>,
    pending: Option<u64>,
    exclusive: Option<u64>,
}

impl FileLocks {
    fn held_by_other(&self, owner: Option<u64>, me: u64) -> bool {
        owner.is_some_and(|id| id != me)
    }

    fn release(&mut self, me: u64, down_to: LockLevel) {
        if self.reserved == Some(me) {
            self.reserved = None;
        }
        if self.pending == Some(me) {
            self.pending = None;
        }
        if self.exclusive == Some(me) {
            self.exclusive = None;
        }
        if down_to == LockLevel::None {
            self.shared.remove(&me);
        }
    }
}

/// Per-slot shared-memory lock state.
#[derive(Debug, Default, Clone, Copy)]
struct ShmSlot {
    sharers: u32,
    exclusive: bool,
}

/// One named file: contents, lock table, and shm state, all behind a single
/// mutex so protocol checks are atomic.
#[derive(Debug, Default)]
struct FileNode {
    data: Vec<u8>,
    locks: FileLocks,
    shm_regions: Vec<ShmRegion>,
    shm_slots: [ShmSlot; SHM_LOCK_SLOTS],
}

#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<Mutex<FileNode>>>,
    next_handle_id: u64,
    next_temp_id: u64,
    rng_state: u64,
}

/// An in-memory VFS.
///
/// Clones share the same file table; open the same path twice to simulate
/// two connections to one database.
#[derive(Debug, Clone)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsInner>>,
}

impl Default for MemoryVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVfs {
    /// Create a new empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryVfsInner {
                rng_state: 0x9E37_79B9_7F4A_7C15,
                ..MemoryVfsInner::default()
            })),
        }
    }
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    #[allow(clippy::significant_drop_tightening)]
    fn open(
        &self,
        _cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let mut inner = self.inner.lock();

        let resolved_path = if let Some(p) = path {
            p.to_path_buf()
        } else {
            let id = inner.next_temp_id;
            inner.next_temp_id += 1;
            PathBuf::from(format!("__temp_{id}__"))
        };

        let is_create = flags.contains(VfsOpenFlags::CREATE);
        let node = if let Some(existing) = inner.files.get(&resolved_path) {
            if flags.contains(VfsOpenFlags::EXCLUSIVE) && is_create {
                return Err(PetraError::CannotOpen {
                    path: resolved_path,
                });
            }
            Arc::clone(existing)
        } else if is_create {
            let node = Arc::new(Mutex::new(FileNode::default()));
            inner.files.insert(resolved_path.clone(), Arc::clone(&node));
            node
        } else {
            return Err(PetraError::CannotOpen {
                path: resolved_path,
            });
        };

        let handle_id = inner.next_handle_id;
        inner.next_handle_id += 1;
        drop(inner);

        let file = MemoryFile {
            path: resolved_path,
            handle_id,
            node,
            lock_level: LockLevel::None,
            shm_held: [ShmHold::None; SHM_LOCK_SLOTS],
            delete_on_close: flags.contains(VfsOpenFlags::DELETE_ON_CLOSE),
            vfs: Arc::clone(&self.inner),
        };

        let mut out_flags = flags;
        if is_create {
            out_flags |= VfsOpenFlags::READWRITE;
        }
        Ok((file, out_flags))
    }

    fn delete(&self, _cx: &Cx, path: &Path, _sync_dir: bool) -> Result<()> {
        self.inner.lock().files.remove(path);
        Ok(())
    }

    fn access(&self, _cx: &Cx, path: &Path, _flags: AccessFlags) -> Result<bool> {
        Ok(self.inner.lock().files.contains_key(path))
    }

    fn full_pathname(&self, _cx: &Cx, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(Path::new("/").join(path))
        }
    }

    fn randomness(&self, _cx: &Cx, buf: &mut [u8]) {
        // Deterministic per-VFS xorshift stream; each call advances the
        // shared state so repeated calls differ.
        let mut inner = self.inner.lock();
        for chunk in buf.chunks_mut(8) {
            let mut s = inner.rng_state;
            s ^= s << 13;
            s ^= s >> 7;
            s ^= s << 17;
            inner.rng_state = s;
            let bytes = s.to_le_bytes();
            for (dst, &src) in chunk.iter_mut().zip(bytes.iter()) {
                *dst = src;
            }
        }
    }
}

/// What this handle holds on one shm lock slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShmHold {
    None,
    Shared,
    Exclusive,
}

/// A file handle in the memory VFS.
#[derive(Debug)]
pub struct MemoryFile {
    path: PathBuf,
    handle_id: u64,
    node: Arc<Mutex<FileNode>>,
    lock_level: LockLevel,
    shm_held: [ShmHold; SHM_LOCK_SLOTS],
    delete_on_close: bool,
    vfs: Arc<Mutex<MemoryVfsInner>>,
}

impl MemoryFile {
    /// The lock level this handle believes it holds.
    #[must_use]
    pub fn lock_level(&self) -> LockLevel {
        self.lock_level
    }

    fn release_everything(&mut self) {
        let mut node = self.node.lock();
        node.locks.release(self.handle_id, LockLevel::None);
        for (slot, held) in self.shm_held.iter_mut().enumerate() {
            match held {
                ShmHold::Shared => node.shm_slots[slot].sharers -= 1,
                ShmHold::Exclusive => node.shm_slots[slot].exclusive = false,
                ShmHold::None => {}
            }
            *held = ShmHold::None;
        }
        drop(node);
        self.lock_level = LockLevel::None;
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        self.release_everything();
        if self.delete_on_close {
            self.vfs.lock().files.remove(&self.path);
        }
    }
}

impl VfsFile for MemoryFile {
    fn close(&mut self, _cx: &Cx) -> Result<()> {
        self.release_everything();
        if self.delete_on_close {
            self.vfs.lock().files.remove(&self.path);
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(&mut self, _cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        let node = self.node.lock();
        let offset = offset as usize;
        let file_len = node.data.len();

        if offset >= file_len {
            drop(node);
            buf.fill(0);
            return Ok(0);
        }

        let to_read = buf.len().min(file_len - offset);
        buf[..to_read].copy_from_slice(&node.data[offset..offset + to_read]);
        drop(node);
        if to_read < buf.len() {
            buf[to_read..].fill(0);
        }
        Ok(to_read)
    }

    #[allow(clippy::cast_possible_truncation, clippy::significant_drop_tightening)]
    fn write(&mut self, _cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        let mut node = self.node.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn truncate(&mut self, _cx: &Cx, size: u64) -> Result<()> {
        self.node.lock().data.truncate(size as usize);
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        Ok(self.node.lock().data.len() as u64)
    }

    #[allow(clippy::significant_drop_tightening)]
    fn lock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        if level <= self.lock_level {
            return Ok(());
        }
        let me = self.handle_id;
        let mut node = self.node.lock();
        let locks = &mut node.locks;

        match level {
            LockLevel::Shared => {
                if locks.held_by_other(locks.pending, me)
                    || locks.held_by_other(locks.exclusive, me)
                {
                    return Err(PetraError::Busy);
                }
                locks.shared.insert(me);
            }
            LockLevel::Reserved => {
                if self.lock_level < LockLevel::Shared {
                    return Err(PetraError::misuse("RESERVED requires SHARED"));
                }
                if locks.held_by_other(locks.reserved, me)
                    || locks.held_by_other(locks.pending, me)
                    || locks.held_by_other(locks.exclusive, me)
                {
                    return Err(PetraError::Busy);
                }
                locks.reserved = Some(me);
            }
            LockLevel::Pending | LockLevel::Exclusive => {
                if self.lock_level < LockLevel::Shared {
                    return Err(PetraError::misuse("EXCLUSIVE requires SHARED"));
                }
                if locks.held_by_other(locks.pending, me)
                    || locks.held_by_other(locks.exclusive, me)
                    || locks.held_by_other(locks.reserved, me)
                {
                    return Err(PetraError::Busy);
                }
                // PENDING is taken en route and retained on failure so no
                // new readers can starve the writer.
                locks.pending = Some(me);
                if level == LockLevel::Exclusive {
                    let other_readers = locks.shared.iter().any(|&id| id != me);
                    if other_readers {
                        drop(node);
                        self.lock_level = LockLevel::Pending;
                        return Err(PetraError::Busy);
                    }
                    locks.exclusive = Some(me);
                }
            }
            LockLevel::None | LockLevel::Unknown => {
                return Err(PetraError::misuse("cannot lock to NONE"));
            }
        }
        drop(node);
        self.lock_level = level;
        Ok(())
    }

    fn unlock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        if level >= self.lock_level {
            return Ok(());
        }
        if level > LockLevel::Shared {
            return Err(PetraError::misuse("unlock target must be SHARED or NONE"));
        }
        let mut node = self.node.lock();
        node.locks.release(self.handle_id, level);
        drop(node);
        self.lock_level = level;
        Ok(())
    }

    fn check_reserved_lock(&self, _cx: &Cx) -> Result<bool> {
        let node = self.node.lock();
        let locks = &node.locks;
        Ok(locks.reserved.is_some() || locks.pending.is_some() || locks.exclusive.is_some())
    }

    fn shm_map(
        &mut self,
        _cx: &Cx,
        region: u32,
        size: u32,
        extend: bool,
    ) -> Result<Option<ShmRegion>> {
        let mut node = self.node.lock();
        let region = region as usize;
        while node.shm_regions.len() <= region {
            if !extend {
                return Ok(None);
            }
            node.shm_regions.push(ShmRegion::new(size as usize));
        }
        Ok(Some(node.shm_regions[region].clone()))
    }

    fn shm_lock(&mut self, _cx: &Cx, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        let start = offset as usize;
        let end = start + n as usize;
        if end > SHM_LOCK_SLOTS || n == 0 {
            return Err(PetraError::misuse("shm lock slot range out of bounds"));
        }
        let mut node = self.node.lock();

        if flags.contains(ShmLockFlags::UNLOCK) {
            for slot in start..end {
                match self.shm_held[slot] {
                    ShmHold::Shared => node.shm_slots[slot].sharers -= 1,
                    ShmHold::Exclusive => node.shm_slots[slot].exclusive = false,
                    ShmHold::None => {}
                }
                self.shm_held[slot] = ShmHold::None;
            }
            return Ok(());
        }

        if flags.contains(ShmLockFlags::SHARED) {
            for slot in start..end {
                if node.shm_slots[slot].exclusive && self.shm_held[slot] != ShmHold::Exclusive {
                    return Err(PetraError::Busy);
                }
            }
            for slot in start..end {
                if self.shm_held[slot] == ShmHold::None {
                    node.shm_slots[slot].sharers += 1;
                    self.shm_held[slot] = ShmHold::Shared;
                }
            }
        } else {
            for slot in start..end {
                let s = node.shm_slots[slot];
                let foreign_sharers =
                    s.sharers - u32::from(self.shm_held[slot] == ShmHold::Shared);
                if (s.exclusive && self.shm_held[slot] != ShmHold::Exclusive)
                    || foreign_sharers > 0
                {
                    return Err(PetraError::Busy);
                }
            }
            for slot in start..end {
                if self.shm_held[slot] == ShmHold::Shared {
                    node.shm_slots[slot].sharers -= 1;
                }
                node.shm_slots[slot].exclusive = true;
                self.shm_held[slot] = ShmHold::Exclusive;
            }
        }
        Ok(())
    }

    fn shm_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    fn shm_unmap(&mut self, _cx: &Cx, delete: bool) -> Result<()> {
        let mut node = self.node.lock();
        for (slot, held) in self.shm_held.iter_mut().enumerate() {
            match held {
                ShmHold::Shared => node.shm_slots[slot].sharers -= 1,
                ShmHold::Exclusive => node.shm_slots[slot].exclusive = false,
                ShmHold::None => {}
            }
            *held = ShmHold::None;
        }
        if delete {
            node.shm_regions.clear();
            node.shm_slots = [ShmSlot::default(); SHM_LOCK_SLOTS];
        }
        Ok(())
    }
}
