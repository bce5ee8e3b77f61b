//! Connection-level WAL object: append path, reader snapshots, recovery.
//!
//! One `Wal` exists per connection in WAL mode. All cross-connection
//! coordination goes through the wal-index shared memory (mapped via the
//! WAL file handle) and its lock slots; the WAL file itself is append-only
//! except for the in-transaction same-page rewrite and checkpoint resets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace};

use petra_error::{PetraError, Result};
use petra_types::PageSize;
use petra_types::cx::Cx;
use petra_types::flags::{ShmLockFlags, SyncFlags, VfsOpenFlags};
use petra_vfs::{Vfs, VfsFile};

use crate::checksum::{
    WAL_FORMAT_VERSION, WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WAL_MAGIC_BE, WAL_MAGIC_LE,
    WalChecksum, WalFrameHeader, WalHeader, WalSalts, compute_frame_checksum, frame_offset,
};
use crate::wal_index::{
    CKPT_LOCK, READ_LOCK_BASE, READ_MARK_COUNT, READ_MARK_NOT_USED, RECOVER_LOCK, SEGMENT_BYTES,
    WRITE_LOCK, WalCkptInfo, WalIndex, WalIndexHdr, segment_for_frame,
};

/// Attempts before a reader declares the locking protocol broken.
pub const WAL_RETRY_LIMIT: u32 = 100;

/// Suffix appended to the database path to name the WAL file.
pub const WAL_SUFFIX: &str = "-wal";

/// Derive the WAL file path for a database path.
#[must_use]
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(WAL_SUFFIX);
    PathBuf::from(name)
}

fn native_magic() -> u32 {
    if cfg!(target_endian = "big") {
        WAL_MAGIC_BE
    } else {
        WAL_MAGIC_LE
    }
}

/// Per-connection WAL state.
pub struct Wal<F: VfsFile> {
    file: F,
    page_size: PageSize,
    index: WalIndex,
    /// Local copy of the published wal-index header, refreshed at the start
    /// of every read transaction.
    hdr: WalIndexHdr,
    /// Read-mark slot held while in a read transaction.
    read_lock: Option<usize>,
    /// Lowest frame this reader must consult; frames below are already
    /// backfilled into the database file.
    min_frame: u32,
    writer: Option<WriterTxn>,
    rng_state: u64,
}

/// Book-keeping for one uncommitted writer transaction.
struct WriterTxn {
    /// `mx_frame` when the transaction began; frames above it are ours.
    start_frame: u32,
    /// Highest frame written so far in this transaction.
    cur_frame: u32,
    /// Checksum at `start_frame`, the base of this transaction's chain.
    base_cksum: WalChecksum,
    /// Cumulative checksum after each of our frames, indexed by
    /// `frame - start_frame - 1`.
    cksums: Vec<WalChecksum>,
    /// Page → frame for frames written in this transaction, enabling
    /// in-place rewrite when the same page is dirtied twice.
    pages: HashMap<u32, u32>,
}

impl<F: VfsFile> Wal<F> {
    /// Open (creating if needed) the WAL for `db_path` and make the
    /// wal-index usable, running recovery if no valid header is published.
    pub fn open<V>(cx: &Cx, vfs: &V, db_path: &Path, page_size: PageSize) -> Result<Self>
    where
        V: Vfs<File = F>,
    {
        let path = wal_path(db_path);
        let (file, _) = vfs.open(
            cx,
            Some(&path),
            VfsOpenFlags::READWRITE | VfsOpenFlags::CREATE | VfsOpenFlags::WAL,
        )?;

        let mut seed = [0u8; 8];
        vfs.randomness(cx, &mut seed);
        let mut wal = Self {
            file,
            page_size,
            index: WalIndex::new(),
            hdr: WalIndexHdr::default(),
            read_lock: None,
            min_frame: 0,
            writer: None,
            rng_state: u64::from_le_bytes(seed) | 1,
        };

        wal.map_segment(cx, 0)?;
        if wal.index.read_header().is_err() {
            wal.recover(cx)?;
        }
        Ok(wal)
    }

    fn next_random(&mut self) -> u32 {
        let mut s = self.rng_state;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.rng_state = s;
        #[allow(clippy::cast_possible_truncation)]
        {
            s as u32
        }
    }

    fn map_segment(&mut self, cx: &Cx, segment: usize) -> Result<()> {
        while self.index.segment_count() <= segment {
            #[allow(clippy::cast_possible_truncation)]
            let next = self.index.segment_count() as u32;
            let region = self
                .file
                .shm_map(cx, next, SEGMENT_BYTES as u32, true)?
                .ok_or_else(|| PetraError::Protocol {
                    detail: "shm segment vanished during extend".to_owned(),
                })?;
            self.index.push_segment(region)?;
        }
        Ok(())
    }

    fn lock_shared(&mut self, cx: &Cx, slot: u32) -> Result<()> {
        self.file
            .shm_lock(cx, slot, 1, ShmLockFlags::LOCK | ShmLockFlags::SHARED)
    }

    fn unlock_shared(&mut self, cx: &Cx, slot: u32) -> Result<()> {
        self.file
            .shm_lock(cx, slot, 1, ShmLockFlags::UNLOCK | ShmLockFlags::SHARED)
    }

    fn lock_exclusive(&mut self, cx: &Cx, slot: u32, n: u32) -> Result<()> {
        self.file
            .shm_lock(cx, slot, n, ShmLockFlags::LOCK | ShmLockFlags::EXCLUSIVE)
    }

    fn unlock_exclusive(&mut self, cx: &Cx, slot: u32, n: u32) -> Result<()> {
        self.file
            .shm_lock(cx, slot, n, ShmLockFlags::UNLOCK | ShmLockFlags::EXCLUSIVE)
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Rebuild the wal-index from the WAL file.
    ///
    /// Walks frames from the start, validating salts and the chained
    /// checksum; the valid prefix up to the last commit frame becomes the
    /// recovered content, anything after it is discarded.
    fn recover(&mut self, cx: &Cx) -> Result<()> {
        self.lock_exclusive(cx, RECOVER_LOCK, 1)?;
        let result = self.recover_locked(cx);
        let unlock = self.unlock_exclusive(cx, RECOVER_LOCK, 1);
        result?;
        unlock
    }

    #[allow(clippy::cast_possible_truncation)]
    fn recover_locked(&mut self, cx: &Cx) -> Result<()> {
        let file_size = self.file.file_size(cx)?;
        let mut hdr = WalIndexHdr {
            is_init: true,
            page_size: self.page_size.get(),
            ..WalIndexHdr::default()
        };

        if file_size >= WAL_HEADER_SIZE as u64 {
            let mut header_bytes = [0u8; WAL_HEADER_SIZE];
            self.file.read(cx, &mut header_bytes, 0)?;
            let wal_hdr = WalHeader::decode(&header_bytes)?;
            if wal_hdr.page_size != self.page_size.get() {
                return Err(PetraError::WalCorrupt {
                    detail: format!("WAL page size {} does not match", wal_hdr.page_size),
                });
            }
            let big_endian = wal_hdr.big_endian_checksum();
            hdr.big_end_cksum = big_endian;
            hdr.salt1 = wal_hdr.salts.salt1;
            hdr.salt2 = wal_hdr.salts.salt2;

            let page_size = self.page_size.as_usize();
            let frame_size = (WAL_FRAME_HEADER_SIZE + page_size) as u64;
            let frame_count = ((file_size - WAL_HEADER_SIZE as u64) / frame_size) as u32;

            let mut running = wal_hdr.checksum;
            let mut buf = vec![0u8; WAL_FRAME_HEADER_SIZE + page_size];
            let mut commit_cksum = running;
            for frame in 1..=frame_count {
                cx.checkpoint()?;
                let n = self.file.read(cx, &mut buf, frame_offset(frame, hdr.page_size))?;
                if n < buf.len() {
                    break;
                }
                let fh = WalFrameHeader::decode(&buf[..WAL_FRAME_HEADER_SIZE])?;
                if fh.salts != wal_hdr.salts {
                    break;
                }
                let prefix: [u8; 8] = buf[..8].try_into().map_err(|_| {
                    PetraError::internal("frame prefix slice length")
                })?;
                running = compute_frame_checksum(
                    running,
                    &prefix,
                    &buf[WAL_FRAME_HEADER_SIZE..],
                    big_endian,
                );
                if running != fh.checksum {
                    break;
                }
                self.map_segment(cx, segment_for_frame(frame))?;
                self.index.append(frame, fh.page_number)?;
                if fh.is_commit() {
                    hdr.mx_frame = frame;
                    hdr.n_page = fh.db_size;
                    commit_cksum = running;
                }
            }
            hdr.frame_cksum = commit_cksum;
        }
        // Index entries past the last commit are uncommitted leftovers.
        self.index.truncate(hdr.mx_frame)?;

        debug!(mx_frame = hdr.mx_frame, n_page = hdr.n_page, "WAL recovered");
        self.index.write_header(&hdr)?;
        self.file.shm_barrier();
        self.index.write_ckpt_info(&WalCkptInfo::default())?;
        self.hdr = hdr;
        Ok(())
    }

    // ── Reader protocol ─────────────────────────────────────────────

    /// Begin a read transaction: publish a read mark and pin a snapshot.
    ///
    /// Transient contention and torn header reads are retried with an
    /// escalating delay up to [`WAL_RETRY_LIMIT`], after which the locking
    /// protocol is considered violated.
    pub fn begin_read(&mut self, cx: &Cx) -> Result<()> {
        if self.read_lock.is_some() {
            return Err(PetraError::misuse("read transaction already open"));
        }
        for attempt in 0..WAL_RETRY_LIMIT {
            cx.checkpoint()?;
            if attempt > 0 {
                // Early retries spin; later ones back off increasingly to
                // let the conflicting writer or recoverer finish.
                if attempt > 5 {
                    std::thread::sleep(Duration::from_micros(u64::from(attempt) * 50));
                }
            }
            match self.try_begin_read(cx) {
                Ok(()) => return Ok(()),
                Err(PetraError::Busy | PetraError::Protocol { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(PetraError::Protocol {
            detail: "reader retry limit exceeded".to_owned(),
        })
    }

    fn try_begin_read(&mut self, cx: &Cx) -> Result<()> {
        let hdr = self.index.read_header()?;
        let info = self.index.read_ckpt_info()?;

        if hdr.mx_frame == 0 || info.n_backfill == hdr.mx_frame {
            // Nothing unbackfilled in the WAL: read mark 0, database file
            // only. A writer that restarts the WAL drains this slot too.
            self.lock_shared(cx, READ_LOCK_BASE)?;
            self.file.shm_barrier();
            if self.index.read_header()? != hdr {
                self.unlock_shared(cx, READ_LOCK_BASE)?;
                return Err(PetraError::Protocol {
                    detail: "snapshot changed during read-lock".to_owned(),
                });
            }
            self.hdr = hdr;
            self.read_lock = Some(0);
            self.min_frame = hdr.mx_frame + 1;
            return Ok(());
        }

        // Prefer the largest existing mark not exceeding mx_frame.
        let mut best_slot = None;
        let mut best_mark = 0;
        for (slot, &mark) in info.read_marks.iter().enumerate().skip(1) {
            if mark != READ_MARK_NOT_USED && mark <= hdr.mx_frame && mark >= best_mark {
                best_mark = mark;
                best_slot = Some(slot);
            }
        }

        if best_mark < hdr.mx_frame {
            // Try to advance some slot to mx_frame so this snapshot is
            // protected from checkpoints.
            for slot in 1..READ_MARK_COUNT {
                #[allow(clippy::cast_possible_truncation)]
                let lock_slot = READ_LOCK_BASE + slot as u32;
                if self.lock_exclusive(cx, lock_slot, 1).is_ok() {
                    self.index.set_read_mark(slot, hdr.mx_frame)?;
                    self.unlock_exclusive(cx, lock_slot, 1)?;
                    best_mark = hdr.mx_frame;
                    best_slot = Some(slot);
                    break;
                }
            }
        }

        let Some(slot) = best_slot else {
            return Err(PetraError::Busy);
        };

        #[allow(clippy::cast_possible_truncation)]
        let lock_slot = READ_LOCK_BASE + slot as u32;
        self.lock_shared(cx, lock_slot)?;

        // Barrier, then confirm nothing moved while we were deciding: the
        // mark must still cover our snapshot and the header must be the
        // one we based the decision on.
        self.file.shm_barrier();
        let info2 = self.index.read_ckpt_info()?;
        if self.index.read_header()? != hdr || info2.read_marks[slot] < best_mark {
            self.unlock_shared(cx, lock_slot)?;
            return Err(PetraError::Protocol {
                detail: "snapshot changed during read-lock".to_owned(),
            });
        }

        self.hdr = hdr;
        self.read_lock = Some(slot);
        self.min_frame = info2.n_backfill + 1;
        trace!(slot, mx_frame = hdr.mx_frame, min_frame = self.min_frame, "read snapshot pinned");
        Ok(())
    }

    /// End the current read transaction.
    pub fn end_read(&mut self, cx: &Cx) -> Result<()> {
        if let Some(slot) = self.read_lock.take() {
            #[allow(clippy::cast_possible_truncation)]
            self.unlock_shared(cx, READ_LOCK_BASE + slot as u32)?;
        }
        Ok(())
    }

    /// The snapshot's database size in pages, 0 when the WAL holds nothing
    /// for this snapshot.
    #[must_use]
    pub fn snapshot_db_size(&self) -> u32 {
        if self.hdr.mx_frame == 0 {
            0
        } else {
            self.hdr.n_page
        }
    }

    /// The snapshot's change counter, which moves on every commit. The
    /// pager compares it across read transactions to decide whether its
    /// cache is still valid.
    #[must_use]
    pub fn snapshot_change_counter(&self) -> u32 {
        self.hdr.change_counter
    }

    /// Newest frame for `page` visible to this snapshot, if any.
    pub fn find_frame(&self, page: u32) -> Result<Option<u32>> {
        if self.read_lock.is_none() {
            return Err(PetraError::misuse("find_frame outside a read transaction"));
        }
        let max_frame = if let Some(w) = &self.writer {
            w.cur_frame
        } else {
            self.hdr.mx_frame
        };
        if max_frame == 0 {
            return Ok(None);
        }
        // Our own uncommitted frames are always visible to us.
        if let Some(w) = &self.writer {
            if let Some(&frame) = w.pages.get(&page) {
                return Ok(Some(frame));
            }
        }
        self.index.lookup(page, self.min_frame, max_frame)
    }

    /// Read the page content of `frame` into `buf` (one page).
    pub fn read_frame(&mut self, cx: &Cx, frame: u32, buf: &mut [u8]) -> Result<()> {
        let offset = frame_offset(frame, self.page_size.get()) + WAL_FRAME_HEADER_SIZE as u64;
        let n = self.file.read(cx, buf, offset)?;
        if n < buf.len() {
            return Err(PetraError::ShortRead {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    // ── Writer protocol ─────────────────────────────────────────────

    /// Acquire the single writer lock and verify the read snapshot is
    /// still the WAL head; a stale snapshot yields `Busy` (the caller must
    /// refresh its read transaction and retry).
    pub fn begin_write(&mut self, cx: &Cx) -> Result<()> {
        if self.read_lock.is_none() {
            return Err(PetraError::misuse("begin_write outside a read transaction"));
        }
        if self.writer.is_some() {
            return Err(PetraError::misuse("write transaction already open"));
        }
        self.lock_exclusive(cx, WRITE_LOCK, 1)?;
        self.file.shm_barrier();
        let published = self.index.read_header()?;
        if published != self.hdr {
            self.unlock_exclusive(cx, WRITE_LOCK, 1)?;
            return Err(PetraError::Busy);
        }
        self.writer = Some(WriterTxn {
            start_frame: self.hdr.mx_frame,
            cur_frame: self.hdr.mx_frame,
            base_cksum: self.hdr.frame_cksum,
            cksums: Vec::new(),
            pages: HashMap::new(),
        });
        Ok(())
    }

    /// Discard uncommitted frames and release the writer lock.
    pub fn rollback_write(&mut self, cx: &Cx) -> Result<()> {
        if self.writer.take().is_some() {
            self.index.truncate(self.hdr.mx_frame)?;
            self.unlock_exclusive(cx, WRITE_LOCK, 1)?;
        }
        Ok(())
    }

    /// Release the writer lock after a successful commit.
    pub fn end_write(&mut self, cx: &Cx) -> Result<()> {
        if self.writer.take().is_some() {
            self.unlock_exclusive(cx, WRITE_LOCK, 1)?;
        }
        Ok(())
    }

    /// Restart the WAL from frame 0 when every frame is already in the
    /// database file and no reader depends on the WAL.
    fn maybe_restart_log(&mut self, cx: &Cx) -> Result<()> {
        if self.hdr.mx_frame == 0 || self.read_lock != Some(0) {
            return Ok(());
        }
        let info = self.index.read_ckpt_info()?;
        if info.n_backfill != self.hdr.mx_frame {
            return Ok(());
        }
        // All content is backfilled. Drain the non-zero reader slots; any
        // active reader there makes the restart impossible for now.
        #[allow(clippy::cast_possible_truncation)]
        let n_slots = (READ_MARK_COUNT - 1) as u32;
        if self.lock_exclusive(cx, READ_LOCK_BASE + 1, n_slots).is_err() {
            return Ok(());
        }
        let salt2 = self.next_random();
        let old = self.hdr;
        self.hdr = WalIndexHdr {
            change_counter: old.change_counter.wrapping_add(1),
            is_init: true,
            big_end_cksum: old.big_end_cksum,
            page_size: old.page_size,
            mx_frame: 0,
            n_page: old.n_page,
            frame_cksum: WalChecksum::default(),
            salt1: WalSalts {
                salt1: old.salt1,
                salt2: old.salt2,
            }
            .bump_salt1(),
            salt2,
        };
        self.index.truncate(0)?;
        self.index.write_header(&self.hdr)?;
        self.file.shm_barrier();
        self.index.write_ckpt_info(&WalCkptInfo::default())?;
        self.unlock_exclusive(cx, READ_LOCK_BASE + 1, n_slots)?;
        if let Some(w) = &mut self.writer {
            w.start_frame = 0;
            w.cur_frame = 0;
            w.base_cksum = WalChecksum::default();
            w.cksums.clear();
            w.pages.clear();
        }
        debug!("WAL restarted");
        Ok(())
    }

    fn cksum_before(&self, frame: u32) -> Result<WalChecksum> {
        let w = self.writer.as_ref().ok_or_else(|| {
            PetraError::misuse("writer state missing")
        })?;
        if frame == w.start_frame + 1 {
            Ok(w.base_cksum)
        } else {
            let idx = (frame - w.start_frame - 2) as usize;
            w.cksums.get(idx).copied().ok_or_else(|| {
                PetraError::internal("checksum chain gap")
            })
        }
    }

    fn record_cksum(&mut self, frame: u32, cksum: WalChecksum) -> Result<()> {
        let w = self.writer.as_mut().ok_or_else(|| {
            PetraError::misuse("writer state missing")
        })?;
        let idx = (frame - w.start_frame - 1) as usize;
        if idx == w.cksums.len() {
            w.cksums.push(cksum);
        } else {
            w.cksums[idx] = cksum;
        }
        Ok(())
    }

    fn write_one_frame(
        &mut self,
        cx: &Cx,
        frame: u32,
        page: u32,
        db_size: u32,
        content: &[u8],
    ) -> Result<WalChecksum> {
        let big_endian = self.hdr.big_end_cksum;
        let prior = self.cksum_before(frame)?;
        let mut fh = WalFrameHeader {
            page_number: page,
            db_size,
            salts: WalSalts {
                salt1: self.hdr.salt1,
                salt2: self.hdr.salt2,
            },
            checksum: WalChecksum::default(),
        };
        let encoded = fh.encode();
        let prefix: [u8; 8] = encoded[..8].try_into().map_err(|_| {
            PetraError::internal("frame prefix slice length")
        })?;
        let cksum = compute_frame_checksum(prior, &prefix, content, big_endian);
        fh.checksum = cksum;

        let offset = frame_offset(frame, self.page_size.get());
        self.file.write(cx, &fh.encode(), offset)?;
        self.file
            .write(cx, content, offset + WAL_FRAME_HEADER_SIZE as u64)?;
        self.record_cksum(frame, cksum)?;
        Ok(cksum)
    }

    /// Repair the checksum chain from `from_frame` to the transaction head
    /// after an in-place rewrite invalidated it.
    fn recompute_chain(&mut self, cx: &Cx, from_frame: u32) -> Result<()> {
        let cur = self
            .writer
            .as_ref()
            .map(|w| w.cur_frame)
            .ok_or_else(|| PetraError::misuse("writer state missing"))?;
        let page_size = self.page_size.as_usize();
        let mut buf = vec![0u8; page_size];
        for frame in from_frame..=cur {
            let offset = frame_offset(frame, self.page_size.get());
            let mut header_bytes = [0u8; WAL_FRAME_HEADER_SIZE];
            self.file.read(cx, &mut header_bytes, offset)?;
            let fh = WalFrameHeader::decode(&header_bytes)?;
            let n = self
                .file
                .read(cx, &mut buf, offset + WAL_FRAME_HEADER_SIZE as u64)?;
            if n < page_size {
                return Err(PetraError::ShortRead {
                    expected: page_size,
                    actual: n,
                });
            }
            self.write_one_frame(cx, frame, fh.page_number, fh.db_size, &buf)?;
        }
        Ok(())
    }

    /// Append `pages` to the WAL. A non-zero `db_size` marks the batch as
    /// a commit: the last frame carries it, the header is republished, and
    /// the WAL is synced per `sync_flags` beforehand.
    ///
    /// A page already written by this transaction is rewritten in place and
    /// the checksum chain after it recomputed.
    pub fn write_frames(
        &mut self,
        cx: &Cx,
        pages: &[(u32, &[u8])],
        db_size: u32,
        sync_flags: Option<SyncFlags>,
    ) -> Result<()> {
        if self.writer.is_none() {
            return Err(PetraError::misuse("write_frames outside a write transaction"));
        }
        if pages.is_empty() {
            return Ok(());
        }
        let page_size = self.page_size.as_usize();
        for (_, content) in pages {
            if content.len() != page_size {
                return Err(PetraError::misuse("frame content is not one page"));
            }
        }

        self.maybe_restart_log(cx)?;

        // Starting an empty WAL: write a fresh file header first.
        let start_empty = self
            .writer
            .as_ref()
            .is_some_and(|w| w.cur_frame == 0);
        if start_empty {
            if self.hdr.salt1 == 0 && self.hdr.salt2 == 0 {
                self.hdr.salt1 = self.next_random();
                self.hdr.salt2 = self.next_random();
            }
            // Continue the checkpoint sequence from the header being
            // replaced, when one exists.
            let checkpoint_seq = {
                let mut old = [0u8; WAL_HEADER_SIZE];
                if self.file.read(cx, &mut old, 0)? == WAL_HEADER_SIZE {
                    WalHeader::decode(&old)
                        .map(|h| h.checkpoint_seq.wrapping_add(1))
                        .unwrap_or(0)
                } else {
                    0
                }
            };
            let wal_hdr = WalHeader {
                magic: native_magic(),
                format_version: WAL_FORMAT_VERSION,
                page_size: self.page_size.get(),
                checkpoint_seq,
                salts: WalSalts {
                    salt1: self.hdr.salt1,
                    salt2: self.hdr.salt2,
                },
                checksum: WalChecksum::default(),
            };
            let bytes = wal_hdr.encode();
            self.file.write(cx, &bytes, 0)?;
            let decoded = WalHeader::decode(&bytes)?;
            self.hdr.big_end_cksum = decoded.big_endian_checksum();
            if let Some(w) = &mut self.writer {
                w.base_cksum = decoded.checksum;
            }
        }

        let commit_at = pages.len() - 1;
        let mut lowest_rewrite: Option<u32> = None;
        for (i, (page, content)) in pages.iter().enumerate() {
            cx.checkpoint()?;
            let frame_db_size = if db_size > 0 && i == commit_at {
                db_size
            } else {
                0
            };
            let existing = self
                .writer
                .as_ref()
                .and_then(|w| w.pages.get(page).copied())
                // A rewrite target must stay a non-commit frame.
                .filter(|_| frame_db_size == 0);
            if let Some(frame) = existing {
                self.write_one_frame(cx, frame, *page, 0, content)?;
                lowest_rewrite = Some(lowest_rewrite.map_or(frame, |f| f.min(frame)));
            } else {
                let frame = self
                    .writer
                    .as_ref()
                    .map(|w| w.cur_frame + 1)
                    .ok_or_else(|| PetraError::misuse("writer state missing"))?;
                // Rewrites queued earlier must be chained through before a
                // new frame extends the chain.
                if let Some(from) = lowest_rewrite.take() {
                    self.recompute_chain(cx, from)?;
                }
                self.map_segment(cx, segment_for_frame(frame))?;
                self.write_one_frame(cx, frame, *page, frame_db_size, content)?;
                self.index.append(frame, *page)?;
                if let Some(w) = &mut self.writer {
                    w.cur_frame = frame;
                    w.pages.insert(*page, frame);
                }
            }
        }
        if let Some(from) = lowest_rewrite {
            self.recompute_chain(cx, from)?;
        }

        if db_size > 0 {
            if let Some(flags) = sync_flags {
                self.file.sync(cx, flags)?;
            }
            let (cur, cksum) = {
                let w = self
                    .writer
                    .as_ref()
                    .ok_or_else(|| PetraError::misuse("writer state missing"))?;
                let cksum = if w.cksums.is_empty() {
                    w.base_cksum
                } else {
                    w.cksums[w.cksums.len() - 1]
                };
                (w.cur_frame, cksum)
            };
            self.hdr.mx_frame = cur;
            self.hdr.n_page = db_size;
            self.hdr.frame_cksum = cksum;
            self.hdr.change_counter = self.hdr.change_counter.wrapping_add(1);
            self.file.shm_barrier();
            self.index.write_header(&self.hdr)?;
            self.file.shm_barrier();
            debug!(mx_frame = cur, n_page = db_size, "WAL commit published");
        }
        Ok(())
    }

    // ── Shared with the checkpointer ────────────────────────────────

    pub(crate) fn index(&self) -> &WalIndex {
        &self.index
    }

    pub(crate) fn header(&self) -> &WalIndexHdr {
        &self.hdr
    }

    pub(crate) fn set_header(&mut self, hdr: WalIndexHdr) {
        self.hdr = hdr;
    }

    pub(crate) fn refresh_header(&mut self) -> Result<()> {
        self.hdr = self.index.read_header()?;
        Ok(())
    }

    pub(crate) fn file_mut(&mut self) -> &mut F {
        &mut self.file
    }

    pub(crate) fn fresh_salt(&mut self) -> u32 {
        self.next_random()
    }

    pub(crate) fn lock_ckpt(&mut self, cx: &Cx) -> Result<()> {
        self.lock_exclusive(cx, CKPT_LOCK, 1)
    }

    pub(crate) fn unlock_ckpt(&mut self, cx: &Cx) -> Result<()> {
        self.unlock_exclusive(cx, CKPT_LOCK, 1)
    }

    pub(crate) fn lock_readers_exclusive(&mut self, cx: &Cx, from_slot: u32, n: u32) -> Result<()> {
        self.lock_exclusive(cx, READ_LOCK_BASE + from_slot, n)
    }

    pub(crate) fn unlock_readers_exclusive(
        &mut self,
        cx: &Cx,
        from_slot: u32,
        n: u32,
    ) -> Result<()> {
        self.unlock_exclusive(cx, READ_LOCK_BASE + from_slot, n)
    }

    /// Close the WAL connection, dropping shm mappings. `delete_shm` is set
    /// by the last connection so the index does not outlive the WAL.
    pub fn close(&mut self, cx: &Cx, delete_shm: bool) -> Result<()> {
        self.index.clear_segments();
        self.file.shm_unmap(cx, delete_shm)?;
        self.file.close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petra_vfs::MemoryVfs;

    fn page(fill: u8, size: usize) -> Vec<u8> {
        vec![fill; size]
    }

    fn open_wal(vfs: &MemoryVfs) -> Wal<petra_vfs::memory::MemoryFile> {
        let cx = Cx::new();
        Wal::open(&cx, vfs, Path::new("test.db"), PageSize::DEFAULT).unwrap()
    }

    fn commit_pages(
        wal: &mut Wal<petra_vfs::memory::MemoryFile>,
        pages: &[(u32, &[u8])],
        db_size: u32,
    ) {
        let cx = Cx::new();
        wal.begin_read(&cx).unwrap();
        wal.begin_write(&cx).unwrap();
        wal.write_frames(&cx, pages, db_size, Some(SyncFlags::NORMAL))
            .unwrap();
        wal.end_write(&cx).unwrap();
        wal.end_read(&cx).unwrap();
    }

    #[test]
    fn wal_path_suffix() {
        assert_eq!(
            wal_path(Path::new("/tmp/a.db")),
            PathBuf::from("/tmp/a.db-wal")
        );
    }

    #[test]
    fn empty_wal_reads_from_db_only() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = open_wal(&vfs);
        wal.begin_read(&cx).unwrap();
        assert_eq!(wal.find_frame(1).unwrap(), None);
        assert_eq!(wal.snapshot_db_size(), 0);
        wal.end_read(&cx).unwrap();
    }

    #[test]
    fn newest_frame_wins_for_rewritten_page() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = open_wal(&vfs);
        let ps = PageSize::DEFAULT.as_usize();
        let (a, b, c) = (page(1, ps), page(2, ps), page(3, ps));

        // Pages 5, 7, then 5 again, committed in separate batches of one
        // transaction each ending with a commit frame.
        wal.begin_read(&cx).unwrap();
        wal.begin_write(&cx).unwrap();
        wal.write_frames(&cx, &[(5, &a)], 0, None).unwrap();
        wal.write_frames(&cx, &[(7, &b)], 0, None).unwrap();
        // Same page again: this batch is a fresh frame because the commit
        // frame cannot be an in-place rewrite.
        wal.write_frames(&cx, &[(5, &c)], 10, Some(SyncFlags::NORMAL))
            .unwrap();
        wal.end_write(&cx).unwrap();
        wal.end_read(&cx).unwrap();

        wal.begin_read(&cx).unwrap();
        assert_eq!(wal.find_frame(5).unwrap(), Some(3));
        assert_eq!(wal.find_frame(7).unwrap(), Some(2));
        assert_eq!(wal.snapshot_db_size(), 10);

        let mut buf = vec![0u8; ps];
        wal.read_frame(&cx, 3, &mut buf).unwrap();
        assert_eq!(buf, c);
        wal.end_read(&cx).unwrap();
    }

    #[test]
    fn in_transaction_rewrite_overwrites_in_place() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = open_wal(&vfs);
        let ps = PageSize::DEFAULT.as_usize();
        let (v1, v2, other) = (page(1, ps), page(2, ps), page(9, ps));

        wal.begin_read(&cx).unwrap();
        wal.begin_write(&cx).unwrap();
        wal.write_frames(&cx, &[(5, &v1), (6, &other)], 0, None).unwrap();
        // Page 5 dirtied again mid-transaction: frame 1 is rewritten, no
        // new frame appended, and the chain through frame 2 stays valid.
        wal.write_frames(&cx, &[(5, &v2)], 0, None).unwrap();
        wal.write_frames(&cx, &[(7, &other)], 8, Some(SyncFlags::NORMAL))
            .unwrap();
        wal.end_write(&cx).unwrap();
        wal.end_read(&cx).unwrap();

        wal.begin_read(&cx).unwrap();
        assert_eq!(wal.find_frame(5).unwrap(), Some(1));
        let mut buf = vec![0u8; ps];
        wal.read_frame(&cx, 1, &mut buf).unwrap();
        assert_eq!(buf, v2);
        wal.end_read(&cx).unwrap();

        // A second connection recovers the same content from the file,
        // proving the rewritten chain still validates.
        drop(wal);
        let mut other_conn = open_wal(&vfs);
        other_conn.recover(&cx).unwrap();
        other_conn.begin_read(&cx).unwrap();
        assert_eq!(other_conn.header().mx_frame, 3);
        assert_eq!(other_conn.find_frame(5).unwrap(), Some(1));
        other_conn.end_read(&cx).unwrap();
    }

    #[test]
    fn recovery_keeps_only_committed_prefix() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let ps = PageSize::DEFAULT.as_usize();
        let mut wal = open_wal(&vfs);
        commit_pages(&mut wal, &[(1, &page(1, ps)), (2, &page(2, ps))], 2);

        // Uncommitted tail: two more frames, no commit marker.
        wal.begin_read(&cx).unwrap();
        wal.begin_write(&cx).unwrap();
        wal.write_frames(&cx, &[(3, &page(3, ps))], 0, None).unwrap();
        // Simulate a crash: drop without commit or rollback.
        drop(wal);

        let mut fresh = open_wal(&vfs);
        fresh.recover(&cx).unwrap();
        fresh.begin_read(&cx).unwrap();
        assert_eq!(fresh.header().mx_frame, 2);
        assert_eq!(fresh.find_frame(3).unwrap(), None);
        assert_eq!(fresh.find_frame(2).unwrap(), Some(2));
        fresh.end_read(&cx).unwrap();
    }

    #[test]
    fn corrupting_a_frame_invalidates_it_and_all_after() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let ps = PageSize::DEFAULT.as_usize();
        let mut wal = open_wal(&vfs);
        // Three committed transactions, one frame each.
        commit_pages(&mut wal, &[(1, &page(1, ps))], 4);
        commit_pages(&mut wal, &[(2, &page(2, ps))], 4);
        commit_pages(&mut wal, &[(3, &page(3, ps))], 4);
        drop(wal);

        // Flip one byte inside frame 2's content.
        let (mut raw, _) = vfs
            .open(
                &cx,
                Some(Path::new("test.db-wal")),
                VfsOpenFlags::READWRITE | VfsOpenFlags::WAL,
            )
            .unwrap();
        let offset = frame_offset(2, 4096) + WAL_FRAME_HEADER_SIZE as u64 + 10;
        raw.write(&cx, &[0xFF], offset).unwrap();
        raw.close(&cx).unwrap();

        let mut fresh = open_wal(&vfs);
        fresh.recover(&cx).unwrap();
        fresh.begin_read(&cx).unwrap();
        // Frame 1 survives; frames 2 and 3 are rejected.
        assert_eq!(fresh.header().mx_frame, 1);
        assert_eq!(fresh.find_frame(1).unwrap(), Some(1));
        assert_eq!(fresh.find_frame(2).unwrap(), None);
        assert_eq!(fresh.find_frame(3).unwrap(), None);
        fresh.end_read(&cx).unwrap();
    }

    #[test]
    fn snapshot_isolation_across_connections() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let ps = PageSize::DEFAULT.as_usize();
        let mut writer = open_wal(&vfs);
        commit_pages(&mut writer, &[(1, &page(1, ps))], 1);

        let mut reader_a = open_wal(&vfs);
        reader_a.begin_read(&cx).unwrap();
        let a_mx = reader_a.header().mx_frame;

        commit_pages(&mut writer, &[(2, &page(2, ps))], 2);

        let mut reader_b = open_wal(&vfs);
        reader_b.begin_read(&cx).unwrap();

        assert!(a_mx < reader_b.header().mx_frame);
        // A never sees the page committed after its snapshot.
        assert_eq!(reader_a.find_frame(2).unwrap(), None);
        assert_eq!(reader_b.find_frame(2).unwrap(), Some(2));

        reader_a.end_read(&cx).unwrap();
        reader_b.end_read(&cx).unwrap();
    }

    #[test]
    fn stale_snapshot_writer_gets_busy() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let ps = PageSize::DEFAULT.as_usize();
        let mut a = open_wal(&vfs);
        let mut b = open_wal(&vfs);
        commit_pages(&mut a, &[(1, &page(1, ps))], 1);

        b.begin_read(&cx).unwrap();
        // A commits while B's snapshot is open.
        commit_pages(&mut a, &[(1, &page(2, ps))], 1);
        assert!(matches!(b.begin_write(&cx), Err(PetraError::Busy)));
        b.end_read(&cx).unwrap();
    }

    #[test]
    fn second_writer_is_excluded() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut a = open_wal(&vfs);
        let mut b = open_wal(&vfs);
        a.begin_read(&cx).unwrap();
        a.begin_write(&cx).unwrap();
        b.begin_read(&cx).unwrap();
        assert!(matches!(b.begin_write(&cx), Err(PetraError::Busy)));
        a.rollback_write(&cx).unwrap();
        a.end_read(&cx).unwrap();
        b.end_write(&cx).unwrap();
        b.end_read(&cx).unwrap();
    }

    #[test]
    fn rollback_discards_uncommitted_frames() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let ps = PageSize::DEFAULT.as_usize();
        let mut wal = open_wal(&vfs);
        commit_pages(&mut wal, &[(1, &page(1, ps))], 1);

        wal.begin_read(&cx).unwrap();
        wal.begin_write(&cx).unwrap();
        wal.write_frames(&cx, &[(2, &page(2, ps))], 0, None).unwrap();
        assert_eq!(wal.find_frame(2).unwrap(), Some(2));
        wal.rollback_write(&cx).unwrap();
        wal.end_read(&cx).unwrap();

        wal.begin_read(&cx).unwrap();
        assert_eq!(wal.find_frame(2).unwrap(), None);
        assert_eq!(wal.find_frame(1).unwrap(), Some(1));
        wal.end_read(&cx).unwrap();
    }

    /// The full protocol against real files: one VFS instance, two
    /// connections sharing its shm table.
    #[cfg(unix)]
    #[test]
    fn round_trip_on_disk() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("disk.db");
        let vfs = petra_vfs::UnixVfs::new();

        let mut writer = Wal::open(&cx, &vfs, &db_path, PageSize::DEFAULT).unwrap();
        let ps = PageSize::DEFAULT.as_usize();
        let content = page(0x5A, ps);
        writer.begin_read(&cx).unwrap();
        writer.begin_write(&cx).unwrap();
        writer
            .write_frames(
                &cx,
                &[(1, content.as_slice()), (2, content.as_slice())],
                2,
                Some(SyncFlags::NORMAL),
            )
            .unwrap();
        writer.end_write(&cx).unwrap();
        writer.end_read(&cx).unwrap();

        let mut reader = Wal::open(&cx, &vfs, &db_path, PageSize::DEFAULT).unwrap();
        reader.begin_read(&cx).unwrap();
        assert_eq!(reader.snapshot_db_size(), 2);
        let frame = reader.find_frame(2).unwrap().unwrap();
        let mut buf = vec![0u8; ps];
        reader.read_frame(&cx, frame, &mut buf).unwrap();
        assert_eq!(buf, content);
        reader.end_read(&cx).unwrap();

        writer.close(&cx, false).unwrap();
        reader.close(&cx, true).unwrap();
    }
}
