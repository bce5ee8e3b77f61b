//! Unix VFS backed by real files and POSIX advisory locks.
//!
//! Database locks use `fcntl` byte-range locks on the conventional lock
//! bytes near the 1 GB boundary, so petra databases interoperate with other
//! processes that follow the same convention. Shared memory for the
//! wal-index is kept on the heap in a per-path table, which coordinates WAL
//! connections within one process; cross-process WAL is not supported by
//! this VFS.

#![allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read as _;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use parking_lot::Mutex;
use tracing::debug;

use petra_error::{PetraError, Result};
use petra_types::LockLevel;
use petra_types::cx::Cx;
use petra_types::flags::{AccessFlags, ShmLockFlags, SyncFlags, VfsOpenFlags};

use crate::shm::ShmRegion;
use crate::traits::{Vfs, VfsFile};

/// First byte of the lock range, placed past 1 GB so it never overlaps
/// ordinary page data in practice.
const PENDING_BYTE: u64 = 0x4000_0000;
const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
const SHARED_FIRST: u64 = PENDING_BYTE + 2;
const SHARED_SIZE: u64 = 510;

const SHM_LOCK_SLOTS: usize = 8;

#[derive(Debug, Default, Clone, Copy)]
struct ShmSlot {
    sharers: u32,
    exclusive: bool,
}

#[derive(Debug, Default)]
struct ShmNode {
    regions: Vec<ShmRegion>,
    slots: [ShmSlot; SHM_LOCK_SLOTS],
}

#[derive(Debug, Default)]
struct ShmTable {
    nodes: Mutex<HashMap<PathBuf, Arc<Mutex<ShmNode>>>>,
}

/// VFS over the host filesystem.
#[derive(Debug, Default)]
pub struct UnixVfs {
    shm: Arc<ShmTable>,
    next_handle_id: AtomicU64,
}

impl UnixVfs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn temp_path(&self, cx: &Cx) -> PathBuf {
        let mut bytes = [0u8; 8];
        self.randomness(cx, &mut bytes);
        std::env::temp_dir().join(format!("petra_{:016x}", u64::from_le_bytes(bytes)))
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let resolved = match path {
            Some(p) => p.to_path_buf(),
            None => self.temp_path(cx),
        };

        let mut options = OpenOptions::new();
        options.read(true);
        let mut out_flags = flags;
        if flags.contains(VfsOpenFlags::READWRITE) || flags.contains(VfsOpenFlags::CREATE) {
            options.write(true);
            out_flags |= VfsOpenFlags::READWRITE;
        }
        if flags.contains(VfsOpenFlags::CREATE) {
            options.create(true);
            if flags.contains(VfsOpenFlags::EXCLUSIVE) {
                options.create_new(true);
            }
        }

        let file = options.open(&resolved).map_err(|err| {
            debug!(path = %resolved.display(), %err, "open failed");
            PetraError::CannotOpen {
                path: resolved.clone(),
            }
        })?;

        Ok((
            UnixFile {
                file,
                path: resolved,
                handle_id: self.next_handle_id.fetch_add(1, Ordering::Relaxed),
                lock_level: LockLevel::None,
                shm: Arc::clone(&self.shm),
                shm_node: None,
                shm_held: [ShmHold::None; SHM_LOCK_SLOTS],
                delete_on_close: flags.contains(VfsOpenFlags::DELETE_ON_CLOSE),
            },
            out_flags,
        ))
    }

    fn delete(&self, _cx: &Cx, path: &Path, sync_dir: bool) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        if sync_dir {
            if let Some(dir) = path.parent() {
                if let Ok(d) = File::open(dir) {
                    let _ = d.sync_all();
                }
            }
        }
        Ok(())
    }

    fn access(&self, _cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool> {
        if flags.contains(AccessFlags::READWRITE) {
            Ok(std::fs::metadata(path)
                .map(|m| !m.permissions().readonly())
                .unwrap_or(false))
        } else {
            Ok(path.exists())
        }
    }

    fn full_pathname(&self, _cx: &Cx, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }

    fn randomness(&self, _cx: &Cx, buf: &mut [u8]) {
        if let Ok(mut urandom) = File::open("/dev/urandom") {
            if urandom.read_exact(buf).is_ok() {
                return;
            }
        }
        // Last resort: nanosecond clock, good enough for temp-file names.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (nanos >> ((i % 8) * 8)) as u8;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShmHold {
    None,
    Shared,
    Exclusive,
}

/// A file handle in the Unix VFS.
#[derive(Debug)]
pub struct UnixFile {
    file: File,
    path: PathBuf,
    handle_id: u64,
    lock_level: LockLevel,
    shm: Arc<ShmTable>,
    shm_node: Option<Arc<Mutex<ShmNode>>>,
    shm_held: [ShmHold; SHM_LOCK_SLOTS],
    delete_on_close: bool,
}

impl UnixFile {
    /// Apply a non-blocking `fcntl` range lock; `Ok(false)` means a
    /// conflicting lock is held elsewhere.
    fn range_lock(&self, typ: libc::c_short, start: u64, len: u64) -> Result<bool> {
        let lock = libc::flock {
            l_type: typ,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        // SAFETY: fd is owned by self.file and valid for its lifetime;
        // the flock struct is fully initialized.
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &lock) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EACCES | libc::EAGAIN) => Ok(false),
            _ => Err(err.into()),
        }
    }

    fn shm_node(&mut self) -> Result<Arc<Mutex<ShmNode>>> {
        if let Some(node) = &self.shm_node {
            return Ok(Arc::clone(node));
        }
        let mut table = self.shm.nodes.lock();
        let node = Arc::clone(
            table
                .entry(self.path.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ShmNode::default()))),
        );
        drop(table);
        self.shm_node = Some(Arc::clone(&node));
        Ok(node)
    }

    fn drop_shm_holds(&mut self, node: &mut ShmNode) {
        for (slot, held) in self.shm_held.iter_mut().enumerate() {
            match held {
                ShmHold::Shared => node.slots[slot].sharers -= 1,
                ShmHold::Exclusive => node.slots[slot].exclusive = false,
                ShmHold::None => {}
            }
            *held = ShmHold::None;
        }
    }
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        if let Some(node) = self.shm_node.take() {
            let mut guard = node.lock();
            self.drop_shm_holds(&mut guard);
        }
        if self.delete_on_close {
            let _ = std::fs::remove_file(&self.path);
        }
        // fcntl locks on the fd are dropped by the kernel at close.
    }
}

impl VfsFile for UnixFile {
    fn close(&mut self, cx: &Cx) -> Result<()> {
        self.unlock(cx, LockLevel::None)?;
        self.shm_unmap(cx, false)?;
        if self.delete_on_close {
            let _ = std::fs::remove_file(&self.path);
            self.delete_on_close = false;
        }
        Ok(())
    }

    fn read(&mut self, _cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        if read < buf.len() {
            buf[read..].fill(0);
        }
        Ok(read)
    }

    fn write(&mut self, _cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn truncate(&mut self, _cx: &Cx, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx, flags: SyncFlags) -> Result<()> {
        if flags.contains(SyncFlags::DATAONLY) {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn lock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        if level <= self.lock_level {
            return Ok(());
        }
        match level {
            LockLevel::Shared => {
                // Read-lock PENDING first so a waiting writer blocks new
                // readers, then take the shared range and let PENDING go.
                if !self.range_lock(libc::F_RDLCK as libc::c_short, PENDING_BYTE, 1)? {
                    return Err(PetraError::Busy);
                }
                let got = self.range_lock(libc::F_RDLCK as libc::c_short, SHARED_FIRST, SHARED_SIZE)?;
                self.range_lock(libc::F_UNLCK as libc::c_short, PENDING_BYTE, 1)?;
                if !got {
                    return Err(PetraError::Busy);
                }
            }
            LockLevel::Reserved => {
                if self.lock_level < LockLevel::Shared {
                    return Err(PetraError::misuse("RESERVED requires SHARED"));
                }
                if !self.range_lock(libc::F_WRLCK as libc::c_short, RESERVED_BYTE, 1)? {
                    return Err(PetraError::Busy);
                }
            }
            LockLevel::Pending | LockLevel::Exclusive => {
                if self.lock_level < LockLevel::Shared {
                    return Err(PetraError::misuse("EXCLUSIVE requires SHARED"));
                }
                if !self.range_lock(libc::F_WRLCK as libc::c_short, PENDING_BYTE, 1)? {
                    return Err(PetraError::Busy);
                }
                if level == LockLevel::Exclusive
                    && !self.range_lock(libc::F_WRLCK as libc::c_short, SHARED_FIRST, SHARED_SIZE)?
                {
                    // PENDING is kept so readers drain.
                    self.lock_level = LockLevel::Pending;
                    return Err(PetraError::Busy);
                }
            }
            LockLevel::None | LockLevel::Unknown => {
                return Err(PetraError::misuse("cannot lock to NONE"));
            }
        }
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
        if level == LockLevel::Shared {
            // Downgrade: back to a read lock on the shared range, release
            // the writer bytes.
            self.range_lock(libc::F_RDLCK as libc::c_short, SHARED_FIRST, SHARED_SIZE)?;
            self.range_lock(libc::F_UNLCK as libc::c_short, PENDING_BYTE, 2)?;
        } else {
            self.range_lock(libc::F_UNLCK as libc::c_short, PENDING_BYTE, 2 + SHARED_SIZE)?;
        }
        self.lock_level = level;
        Ok(())
    }

    fn check_reserved_lock(&self, _cx: &Cx) -> Result<bool> {
        if self.lock_level >= LockLevel::Reserved {
            return Ok(true);
        }
        let mut lock = libc::flock {
            l_type: libc::F_WRLCK as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: RESERVED_BYTE as libc::off_t,
            l_len: 1,
            l_pid: 0,
        };
        // SAFETY: fd is valid; F_GETLK only reads the descriptor state and
        // writes back into the flock struct.
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_GETLK, &mut lock) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(lock.l_type != libc::F_UNLCK as libc::c_short)
    }

    fn shm_map(
        &mut self,
        _cx: &Cx,
        region: u32,
        size: u32,
        extend: bool,
    ) -> Result<Option<ShmRegion>> {
        let node = self.shm_node()?;
        let mut node = node.lock();
        let region = region as usize;
        while node.regions.len() <= region {
            if !extend {
                return Ok(None);
            }
            node.regions.push(ShmRegion::new(size as usize));
        }
        Ok(Some(node.regions[region].clone()))
    }

    fn shm_lock(&mut self, _cx: &Cx, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        let start = offset as usize;
        let end = start + n as usize;
        if end > SHM_LOCK_SLOTS || n == 0 {
            return Err(PetraError::misuse("shm lock slot range out of bounds"));
        }
        let node = self.shm_node()?;
        let mut node = node.lock();

        if flags.contains(ShmLockFlags::UNLOCK) {
            for slot in start..end {
                match self.shm_held[slot] {
                    ShmHold::Shared => node.slots[slot].sharers -= 1,
                    ShmHold::Exclusive => node.slots[slot].exclusive = false,
                    ShmHold::None => {}
                }
                self.shm_held[slot] = ShmHold::None;
            }
            return Ok(());
        }

        if flags.contains(ShmLockFlags::SHARED) {
            for slot in start..end {
                if node.slots[slot].exclusive && self.shm_held[slot] != ShmHold::Exclusive {
                    return Err(PetraError::Busy);
                }
            }
            for slot in start..end {
                if self.shm_held[slot] == ShmHold::None {
                    node.slots[slot].sharers += 1;
                    self.shm_held[slot] = ShmHold::Shared;
                }
            }
        } else {
            for slot in start..end {
                let s = node.slots[slot];
                let foreign_sharers = s.sharers - u32::from(self.shm_held[slot] == ShmHold::Shared);
                if (s.exclusive && self.shm_held[slot] != ShmHold::Exclusive) || foreign_sharers > 0
                {
                    return Err(PetraError::Busy);
                }
            }
            for slot in start..end {
                if self.shm_held[slot] == ShmHold::Shared {
                    node.slots[slot].sharers -= 1;
                }
                node.slots[slot].exclusive = true;
                self.shm_held[slot] = ShmHold::Exclusive;
            }
        }
        Ok(())
    }

    fn shm_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    fn shm_unmap(&mut self, _cx: &Cx, delete: bool) -> Result<()> {
        let Some(node) = self.shm_node.take() else {
            return Ok(());
        };
        let mut guard = node.lock();
        self.drop_shm_holds(&mut guard);
        drop(guard);
        if delete {
            self.shm.nodes.lock().remove(&self.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW_CREATE: VfsOpenFlags = VfsOpenFlags::READWRITE
        .union(VfsOpenFlags::CREATE)
        .union(VfsOpenFlags::MAIN_DB);

    #[test]
    fn create_write_read_roundtrip() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let vfs = UnixVfs::new();
        let (mut file, _) = vfs.open(&cx, Some(&path), RW_CREATE).unwrap();

        file.write(&cx, b"payload", 4096).unwrap();
        file.sync(&cx, SyncFlags::NORMAL).unwrap();
        assert_eq!(file.file_size(&cx).unwrap(), 4096 + 7);

        let mut buf = [0u8; 7];
        assert_eq!(file.read(&cx, &mut buf, 4096).unwrap(), 7);
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn short_read_zero_fills() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.db");
        let vfs = UnixVfs::new();
        let (mut file, _) = vfs.open(&cx, Some(&path), RW_CREATE).unwrap();
        file.write(&cx, b"ab", 0).unwrap();

        let mut buf = [0xFFu8; 8];
        assert_eq!(file.read(&cx, &mut buf, 0).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        assert!(buf[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn delete_and_access() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.db");
        let vfs = UnixVfs::new();
        drop(vfs.open(&cx, Some(&path), RW_CREATE).unwrap());
        assert!(vfs.access(&cx, &path, AccessFlags::EXISTS).unwrap());
        vfs.delete(&cx, &path, false).unwrap();
        assert!(!vfs.access(&cx, &path, AccessFlags::EXISTS).unwrap());
        // Deleting a missing file is not an error.
        vfs.delete(&cx, &path, false).unwrap();
    }

    #[test]
    fn lock_ladder_single_handle() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        let vfs = UnixVfs::new();
        let (mut file, _) = vfs.open(&cx, Some(&path), RW_CREATE).unwrap();

        file.lock(&cx, LockLevel::Shared).unwrap();
        file.lock(&cx, LockLevel::Reserved).unwrap();
        assert!(file.check_reserved_lock(&cx).unwrap());
        file.lock(&cx, LockLevel::Exclusive).unwrap();
        file.unlock(&cx, LockLevel::Shared).unwrap();
        file.unlock(&cx, LockLevel::None).unwrap();
    }

    #[test]
    fn shm_shared_between_handles_on_one_path() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.db");
        let vfs = UnixVfs::new();
        let (mut a, _) = vfs.open(&cx, Some(&path), RW_CREATE).unwrap();
        let (mut b, _) = vfs.open(&cx, Some(&path), RW_CREATE).unwrap();

        let ra = a.shm_map(&cx, 0, 32768, true).unwrap().unwrap();
        ra.write_at(0, &[0xAB]);
        let rb = b.shm_map(&cx, 0, 32768, false).unwrap().unwrap();
        let mut out = [0u8; 1];
        rb.read_at(0, &mut out);
        assert_eq!(out, [0xAB]);

        a.shm_lock(&cx, 0, 1, ShmLockFlags::LOCK | ShmLockFlags::EXCLUSIVE)
            .unwrap();
        assert!(matches!(
            b.shm_lock(&cx, 0, 1, ShmLockFlags::LOCK | ShmLockFlags::SHARED),
            Err(PetraError::Busy)
        ));
    }

    #[test]
    fn temp_file_deleted_on_close() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (mut file, _) = vfs
            .open(&cx, None, RW_CREATE | VfsOpenFlags::DELETE_ON_CLOSE)
            .unwrap();
        file.write(&cx, b"scratch", 0).unwrap();
        file.close(&cx).unwrap();
    }
}
