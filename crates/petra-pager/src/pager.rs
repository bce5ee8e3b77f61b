//! The pager: page cache ownership, transaction state machine, rollback
//! journal and WAL orchestration for one open database file.
//!
//! State machine (WAL connections commit straight out of `WriterCacheMod`
//! and never touch the two db-file-modified states):
//! ```text
//! Open -> Reader -> WriterLocked -> WriterCacheMod -> WriterDbMod
//!   ^       ^                                              |
//!   |       +--------- commit / rollback ---- WriterFinished
//!   +--- Error (poisoned until the transaction is torn down)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace, warn};

use petra_error::{ErrorCode, PetraError, Result};
use petra_types::cx::Cx;
use petra_types::encoding::{get_u32, put_u32};
use petra_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use petra_types::header::{CHANGE_COUNTER_OFFSET, DATABASE_HEADER_SIZE, DatabaseHeader};
use petra_types::{CheckpointMode, JournalMode, LockLevel, PageSize, PagerState, SynchronousMode};
use petra_vfs::{Vfs, VfsFile};
use petra_wal::checkpoint::{CheckpointResult, CheckpointTarget};
use petra_wal::wal::Wal;

use crate::bitvec::PageBitvec;
use crate::journal::{
    JOURNAL_HEADER_SIZE, JournalHeader, RECORD_COUNT_FROM_SIZE, decode_record,
    decode_super_journal, encode_record, encode_super_journal,
};
use crate::page_cache::PageCache;

/// Suffix appended to the database path to name the rollback journal.
pub const JOURNAL_SUFFIX: &str = "-journal";

/// Derive the rollback-journal path for a database path.
#[must_use]
pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(JOURNAL_SUFFIX);
    PathBuf::from(name)
}

/// What to do when a file lock is contended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Surface `Busy` immediately.
    Fail,
    /// Retry up to `max_attempts` times, sleeping `delay` between tries.
    Retry { max_attempts: u32, delay: Duration },
}

/// Pager configuration fixed at open time.
#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub page_size: PageSize,
    pub journal_mode: JournalMode,
    pub synchronous: SynchronousMode,
    /// Soft page-cache limit; dirty pages are never evicted.
    pub cache_pages: usize,
    pub busy: BusyPolicy,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: PageSize::DEFAULT,
            journal_mode: JournalMode::default(),
            synchronous: SynchronousMode::default(),
            cache_pages: 2000,
            busy: BusyPolicy::Fail,
        }
    }
}

struct JournalState<F> {
    file: F,
    /// Next write offset.
    offset: u64,
    /// Offset of the current segment header.
    header_offset: u64,
    /// Offset of the first record after the header padding.
    first_record_offset: u64,
    record_count: u32,
    seed: u32,
}

struct Savepoint {
    orig_db_size: u32,
    /// Main-journal offset at open; replay starts here (or at the first
    /// record if the journal opened later).
    journal_offset: u64,
    sub_records: u32,
    in_savepoint: PageBitvec,
}

/// One pager per open database file.
pub struct Pager<V: Vfs> {
    vfs: V,
    db_path: PathBuf,
    journal_file_path: PathBuf,
    db_file: V::File,
    config: PagerConfig,
    state: PagerState,
    lock: LockLevel,
    cache: PageCache,
    /// Current image size in pages.
    db_size: u32,
    /// Image size when the write transaction began.
    db_orig_size: u32,
    /// Actual size of the database file on disk, in pages.
    db_file_size: u32,
    in_journal: Option<PageBitvec>,
    journal: Option<JournalState<V::File>>,
    sub_journal: Option<V::File>,
    n_sub_records: u32,
    savepoints: Vec<Savepoint>,
    wal: Option<Wal<V::File>>,
    error_code: Option<ErrorCode>,
    /// Change counter observed at the last cache validation.
    known_change_counter: Option<u32>,
    rng_state: u64,
}

impl<V: Vfs> Pager<V> {
    /// Open a pager on `path`, creating the database file if absent. An
    /// existing non-empty file dictates the page size.
    pub fn open(cx: &Cx, vfs: V, path: &Path, config: PagerConfig) -> Result<Self> {
        let db_path = vfs.full_pathname(cx, path)?;
        let (db_file, _) = vfs.open(
            cx,
            Some(&db_path),
            VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE | VfsOpenFlags::CREATE,
        )?;

        let file_bytes = db_file.file_size(cx)?;
        let mut pager = Self::assemble(cx, vfs, db_path, db_file, config)?;
        if file_bytes >= DATABASE_HEADER_SIZE as u64 {
            let mut header_bytes = [0u8; DATABASE_HEADER_SIZE];
            pager.db_file.read(cx, &mut header_bytes, 0)?;
            let header = DatabaseHeader::decode(&header_bytes)?;
            pager.config.page_size = header.page_size;
            pager.cache.set_page_size(header.page_size);
            pager.db_file_size =
                u32::try_from(file_bytes / u64::from(header.page_size.get())).unwrap_or(u32::MAX);
            pager.db_size = pager.db_file_size;
        }
        Ok(pager)
    }

    fn assemble(
        cx: &Cx,
        vfs: V,
        db_path: PathBuf,
        db_file: V::File,
        config: PagerConfig,
    ) -> Result<Self> {
        let mut seed = [0u8; 8];
        vfs.randomness(cx, &mut seed);
        Ok(Self {
            journal_file_path: journal_path(&db_path),
            db_path,
            db_file,
            cache: PageCache::new(config.page_size, config.cache_pages),
            config,
            vfs,
            state: PagerState::Open,
            lock: LockLevel::None,
            db_size: 0,
            db_orig_size: 0,
            db_file_size: 0,
            in_journal: None,
            journal: None,
            sub_journal: None,
            n_sub_records: 0,
            savepoints: Vec::new(),
            wal: None,
            error_code: None,
            known_change_counter: None,
            rng_state: u64::from_le_bytes(seed) | 1,
        })
    }

    #[must_use]
    pub fn state(&self) -> PagerState {
        self.state
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.config.page_size
    }

    /// Current image size in pages.
    #[must_use]
    pub fn db_size(&self) -> u32 {
        self.db_size
    }

    #[must_use]
    pub fn journal_mode(&self) -> JournalMode {
        self.config.journal_mode
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

    fn stored_error(code: ErrorCode) -> PetraError {
        match code {
            ErrorCode::Full => PetraError::Full,
            ErrorCode::Corrupt => PetraError::DatabaseCorrupt {
                detail: "pager previously hit corruption".to_owned(),
            },
            ErrorCode::IoErr => PetraError::Io(std::io::Error::other(
                "pager in error state after an I/O failure",
            )),
            other => PetraError::internal(format!("pager in error state (code {})", other as i32)),
        }
    }

    fn check_usable(&self) -> Result<()> {
        match self.error_code {
            Some(code) => Err(Self::stored_error(code)),
            None => Ok(()),
        }
    }

    /// Push the pager into the poisoned state after a mid-transaction
    /// failure; transient lock errors pass through untouched.
    fn enter_error(&mut self, err: PetraError) -> PetraError {
        if err.is_transient() || matches!(err, PetraError::Interrupted) {
            return err;
        }
        warn!(code = ?err.error_code(), "pager entering error state");
        self.state = PagerState::Error;
        self.error_code = Some(err.error_code());
        err
    }

    fn acquire_lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        match self.config.busy {
            BusyPolicy::Fail => {
                self.db_file.lock(cx, level)?;
            }
            BusyPolicy::Retry {
                max_attempts,
                delay,
            } => {
                let mut attempts = 0;
                loop {
                    cx.checkpoint()?;
                    match self.db_file.lock(cx, level) {
                        Ok(()) => break,
                        Err(err) if err.is_transient() && attempts < max_attempts => {
                            attempts += 1;
                            std::thread::sleep(delay);
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        self.lock = level;
        Ok(())
    }

    fn unlock_to(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        self.db_file.unlock(cx, level)?;
        self.lock = level;
        Ok(())
    }

    // ── Read transactions ───────────────────────────────────────────

    /// Begin a read transaction: take a shared lock, deal with any hot
    /// journal, and validate the cache against the change counter.
    pub fn begin_read(&mut self, cx: &Cx) -> Result<()> {
        self.check_usable()?;
        match self.state {
            PagerState::Open => {}
            PagerState::Reader => return Ok(()),
            _ => return Err(PetraError::misuse("begin_read inside a write transaction")),
        }

        if self.config.journal_mode.is_wal() {
            self.begin_read_wal(cx)
        } else {
            self.begin_read_rollback(cx)
        }
    }

    fn begin_read_rollback(&mut self, cx: &Cx) -> Result<()> {
        self.acquire_lock(cx, LockLevel::Shared)?;
        if let Err(err) = self.handle_hot_journal(cx) {
            let _ = self.unlock_to(cx, LockLevel::None);
            return Err(err);
        }

        let file_bytes = self.db_file.file_size(cx)?;
        self.db_file_size =
            u32::try_from(file_bytes / u64::from(self.config.page_size.get())).unwrap_or(u32::MAX);
        self.db_size = self.db_file_size;

        self.validate_cache(cx)?;
        self.state = PagerState::Reader;
        Ok(())
    }

    fn begin_read_wal(&mut self, cx: &Cx) -> Result<()> {
        self.acquire_lock(cx, LockLevel::Shared)?;
        if self.wal.is_none() {
            let wal = Wal::open(cx, &self.vfs, &self.db_path, self.config.page_size)?;
            self.wal = Some(wal);
        }
        let wal = self
            .wal
            .as_mut()
            .ok_or_else(|| PetraError::internal("wal missing"))?;
        wal.begin_read(cx)?;

        let counter = wal.snapshot_change_counter();
        if self.known_change_counter != Some(counter) {
            self.cache.clear();
            self.known_change_counter = Some(counter);
        }

        let wal_size = wal.snapshot_db_size();
        if wal_size > 0 {
            self.db_size = wal_size;
        } else {
            let file_bytes = self.db_file.file_size(cx)?;
            self.db_size = u32::try_from(file_bytes / u64::from(self.config.page_size.get()))
                .unwrap_or(u32::MAX);
        }
        self.db_file_size = self.db_size;
        self.state = PagerState::Reader;
        Ok(())
    }

    /// Compare the on-disk change counter with the one the cache was
    /// validated against; another writer's commit invalidates the cache.
    fn validate_cache(&mut self, cx: &Cx) -> Result<()> {
        if self.db_file_size == 0 {
            self.known_change_counter = None;
            return Ok(());
        }
        let mut bytes = [0u8; 4];
        self.db_file.read(cx, &mut bytes, CHANGE_COUNTER_OFFSET as u64)?;
        let counter = u32::from_be_bytes(bytes);
        if self.known_change_counter != Some(counter) {
            trace!(counter, "change counter moved, discarding cache");
            self.cache.clear();
            self.known_change_counter = Some(counter);
        }
        Ok(())
    }

    /// End the read transaction and drop back to `Open`. Also the recovery
    /// path out of the `Error` state.
    pub fn end_read(&mut self, cx: &Cx) -> Result<()> {
        match self.state {
            PagerState::Reader | PagerState::Open => {}
            PagerState::Error => {
                self.cache.clear();
                self.error_code = None;
                self.in_journal = None;
                self.journal = None;
                self.savepoints.clear();
                self.n_sub_records = 0;
            }
            _ => return Err(PetraError::misuse("end_read inside a write transaction")),
        }
        if let Some(wal) = self.wal.as_mut() {
            wal.end_read(cx)?;
        }
        if self.lock != LockLevel::None {
            self.unlock_to(cx, LockLevel::None)?;
        }
        self.state = PagerState::Open;
        Ok(())
    }

    // ── Page access ─────────────────────────────────────────────────

    /// Read page `pgno` through the cache. Inside a write transaction a
    /// page beyond the current image reads as zeroes (it is about to be
    /// created); outside one it is out of range.
    pub fn read_page(&mut self, cx: &Cx, pgno: u32) -> Result<&[u8]> {
        self.check_usable()?;
        if pgno == 0 {
            return Err(PetraError::OutOfRange {
                what: "page number".to_owned(),
                value: "0".to_owned(),
            });
        }
        if matches!(self.state, PagerState::Open | PagerState::Error) {
            return Err(PetraError::misuse("read_page outside a transaction"));
        }
        if self.cache.get(pgno).is_none() {
            let data = self.load_page(cx, pgno)?;
            self.cache.insert(pgno, data);
        }
        Ok(self
            .cache
            .get(pgno)
            .map(|p| p.data.as_slice())
            .unwrap_or_default())
    }

    fn load_page(&mut self, cx: &Cx, pgno: u32) -> Result<Vec<u8>> {
        let page_size = self.config.page_size.as_usize();
        if pgno > self.db_size {
            if self.state.is_writer() {
                return Ok(vec![0; page_size]);
            }
            return Err(PetraError::OutOfRange {
                what: "page number".to_owned(),
                value: pgno.to_string(),
            });
        }
        if let Some(wal) = self.wal.as_mut() {
            if let Some(frame) = wal.find_frame(pgno)? {
                let mut buf = vec![0; page_size];
                wal.read_frame(cx, frame, &mut buf)?;
                return Ok(buf);
            }
        }
        let mut buf = vec![0; page_size];
        let offset = u64::from(pgno - 1) * page_size as u64;
        // Short reads zero-fill: a page inside the image but past the file
        // end (grown in the WAL, not yet backfilled) reads as zeroes.
        self.db_file.read(cx, &mut buf, offset)?;
        Ok(buf)
    }

    // ── Write transactions ──────────────────────────────────────────

    /// Begin a write transaction (`Reader` → `WriterLocked`).
    pub fn begin_write(&mut self, cx: &Cx) -> Result<()> {
        self.check_usable()?;
        match self.state {
            PagerState::Reader => {}
            s if s.is_writer() => return Ok(()),
            _ => return Err(PetraError::misuse("begin_write outside a read transaction")),
        }

        if let Some(wal) = self.wal.as_mut() {
            wal.begin_write(cx)?;
        } else {
            self.acquire_lock(cx, LockLevel::Reserved)?;
        }
        self.state = PagerState::WriterLocked;
        self.db_orig_size = self.db_size;
        self.in_journal = Some(PageBitvec::with_capacity(self.db_size));
        Ok(())
    }

    /// Write one full page image. The first write of the transaction opens
    /// the journal; the first write of each previously-existing page
    /// appends its pre-image.
    pub fn write_page(&mut self, cx: &Cx, pgno: u32, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        if !self.state.is_writer() {
            return Err(PetraError::misuse("write_page outside a write transaction"));
        }
        if data.len() != self.config.page_size.as_usize() {
            return Err(PetraError::misuse("page image has the wrong size"));
        }
        if pgno == 0 {
            return Err(PetraError::OutOfRange {
                what: "page number".to_owned(),
                value: "0".to_owned(),
            });
        }

        if self.state == PagerState::WriterLocked {
            self.open_journal(cx)?;
            self.state = PagerState::WriterCacheMod;
        }

        self.journal_page(cx, pgno)?;
        self.sub_journal_page(cx, pgno)?;

        let entry = self.cache.insert(pgno, data.to_vec());
        entry.dirty = true;
        if pgno > self.db_orig_size {
            // No pre-image exists to roll back to; the journal must hit
            // disk before this page may reach the database file.
            entry.need_sync = true;
        }
        if pgno > self.db_size {
            self.db_size = pgno;
        }
        Ok(())
    }

    /// Shrink the image to `pages` (the b-tree freed the tail).
    pub fn truncate_image(&mut self, pages: u32) -> Result<()> {
        if !self.state.is_writer() {
            return Err(PetraError::misuse("truncate_image outside a write transaction"));
        }
        self.db_size = pages;
        Ok(())
    }

    fn open_journal(&mut self, cx: &Cx) -> Result<()> {
        if self.wal.is_some()
            || self.config.journal_mode == JournalMode::Off
            || self.journal.is_some()
        {
            return Ok(());
        }
        let mut flags = VfsOpenFlags::MAIN_JOURNAL | VfsOpenFlags::READWRITE | VfsOpenFlags::CREATE;
        if self.config.journal_mode == JournalMode::Memory {
            flags |= VfsOpenFlags::DELETE_ON_CLOSE;
        }
        let (mut file, _) = self.vfs.open(cx, Some(&self.journal_file_path), flags)?;
        // A leftover PERSIST journal may still hold old bytes.
        file.truncate(cx, 0)?;

        let sector_size = file.sector_size().max(512);
        let seed = self.next_random();
        let header = JournalHeader {
            record_count: RECORD_COUNT_FROM_SIZE,
            checksum_seed: seed,
            orig_page_count: self.db_orig_size,
            sector_size,
            page_size: self.config.page_size.get(),
        };
        let encoded = header.encode();
        file.write(cx, &encoded, 0)?;
        let first_record = encoded.len() as u64;
        self.journal = Some(JournalState {
            file,
            offset: first_record,
            header_offset: 0,
            first_record_offset: first_record,
            record_count: 0,
            seed,
        });
        debug!(seed, orig = self.db_orig_size, "journal opened");
        Ok(())
    }

    /// Append the pre-image of `pgno` if it exists in the original image
    /// and has not been journaled this transaction.
    fn journal_page(&mut self, cx: &Cx, pgno: u32) -> Result<()> {
        if self.journal.is_none() || pgno > self.db_orig_size {
            return Ok(());
        }
        let already = self
            .in_journal
            .as_ref()
            .is_some_and(|bv| bv.contains(pgno));
        if already {
            return Ok(());
        }
        let pre_image = self.read_page(cx, pgno)?.to_vec();
        let journal = self
            .journal
            .as_mut()
            .ok_or_else(|| PetraError::internal("journal missing"))?;
        let record = encode_record(pgno, &pre_image, journal.seed);
        journal.file.write(cx, &record, journal.offset)?;
        journal.offset += record.len() as u64;
        journal.record_count += 1;
        if let Some(bv) = self.in_journal.as_mut() {
            bv.set(pgno);
        }
        Ok(())
    }

    /// Record the current content of `pgno` in the sub-journal for any
    /// open savepoint that has not seen it yet.
    fn sub_journal_page(&mut self, cx: &Cx, pgno: u32) -> Result<()> {
        if self.savepoints.is_empty() {
            return Ok(());
        }
        let needed = self
            .savepoints
            .iter()
            .any(|sp| !sp.in_savepoint.contains(pgno));
        if needed {
            let content = if pgno <= self.db_size {
                self.read_page(cx, pgno)?.to_vec()
            } else {
                vec![0; self.config.page_size.as_usize()]
            };
            if self.sub_journal.is_none() {
                let (file, _) = self.vfs.open(
                    cx,
                    None,
                    VfsOpenFlags::TEMP_DB
                        | VfsOpenFlags::READWRITE
                        | VfsOpenFlags::CREATE
                        | VfsOpenFlags::DELETE_ON_CLOSE,
                )?;
                self.sub_journal = Some(file);
            }
            let sub = self
                .sub_journal
                .as_mut()
                .ok_or_else(|| PetraError::internal("sub-journal missing"))?;
            let record_size = 4 + self.config.page_size.as_usize();
            let mut record = vec![0u8; record_size];
            put_u32(&mut record, 0, pgno);
            record[4..].copy_from_slice(&content);
            let offset = u64::from(self.n_sub_records) * record_size as u64;
            sub.write(cx, &record, offset)?;
            self.n_sub_records += 1;
        }
        for sp in &mut self.savepoints {
            sp.in_savepoint.set(pgno);
        }
        Ok(())
    }

    // ── Commit and rollback ─────────────────────────────────────────

    /// Increment the change counter on page 1 so other connections drop
    /// their caches.
    fn bump_change_counter(&mut self, cx: &Cx) -> Result<()> {
        if self.db_size == 0 {
            return Ok(());
        }
        let mut page1 = self.read_page(cx, 1)?.to_vec();
        let counter = get_u32(&page1, CHANGE_COUNTER_OFFSET).wrapping_add(1);
        put_u32(&mut page1, CHANGE_COUNTER_OFFSET, counter);
        // version-valid-for mirrors the counter.
        put_u32(&mut page1, 92, counter);
        self.write_page(cx, 1, &page1)?;
        self.known_change_counter = Some(counter);
        Ok(())
    }

    /// Commit the current write transaction. `super_journal` names the
    /// coordinating journal of a multi-database commit, if any.
    pub fn commit(&mut self, cx: &Cx) -> Result<()> {
        self.commit_with_super_journal(cx, None)
    }

    pub fn commit_with_super_journal(
        &mut self,
        cx: &Cx,
        super_journal: Option<&Path>,
    ) -> Result<()> {
        self.check_usable()?;
        match self.state {
            PagerState::Reader => return Ok(()),
            PagerState::WriterLocked => {
                // Nothing was written.
                return self.end_write_txn(cx);
            }
            s if s.is_writer() => {}
            _ => return Err(PetraError::misuse("commit outside a write transaction")),
        }

        let result = if self.wal.is_some() {
            self.commit_wal(cx)
        } else {
            self.commit_journal(cx, super_journal)
        };
        match result {
            Ok(()) => self.end_write_txn(cx),
            Err(err) => Err(self.enter_error(err)),
        }
    }

    fn commit_wal(&mut self, cx: &Cx) -> Result<()> {
        self.bump_change_counter(cx)?;
        let dirty = self.cache.dirty_pages();
        let mut frames: Vec<(u32, &[u8])> = Vec::with_capacity(dirty.len());
        for pgno in &dirty {
            let entry = self
                .cache
                .get(*pgno)
                .ok_or_else(|| PetraError::internal("dirty page missing from cache"))?;
            frames.push((*pgno, entry.data.as_slice()));
        }
        let sync_flags = match self.config.synchronous {
            SynchronousMode::Off => None,
            SynchronousMode::Normal => Some(SyncFlags::NORMAL),
            SynchronousMode::Full => Some(SyncFlags::FULL),
        };
        let db_size = self.db_size;
        let wal = self
            .wal
            .as_mut()
            .ok_or_else(|| PetraError::internal("wal missing"))?;
        wal.write_frames(cx, &frames, db_size, sync_flags)?;
        // Track the counter the commit just published so the next
        // begin_read keeps the cache.
        self.known_change_counter = Some(wal.snapshot_change_counter());
        Ok(())
    }

    fn commit_journal(&mut self, cx: &Cx, super_journal: Option<&Path>) -> Result<()> {
        self.bump_change_counter(cx)?;

        // Phase one: make the journal durable with its true record count.
        // Skippable only when there is nothing to protect: no pre-image
        // records and no appended pages counting on the journal header to
        // roll the file growth back.
        let journal_sync_needed = self
            .journal
            .as_ref()
            .is_some_and(|j| j.record_count > 0 || self.cache.any_need_sync());
        if let Some(journal) = self.journal.as_mut().filter(|_| journal_sync_needed) {
            if let Some(path) = super_journal {
                let trailer =
                    encode_super_journal(&path.to_string_lossy(), self.config.page_size.get());
                journal.file.write(cx, &trailer, journal.offset)?;
                journal.offset += trailer.len() as u64;
            }
            match self.config.synchronous {
                SynchronousMode::Off => {
                    let mut count = [0u8; 4];
                    put_u32(&mut count, 0, journal.record_count);
                    journal.file.write(cx, &count, journal.header_offset + 8)?;
                }
                SynchronousMode::Normal => {
                    let mut count = [0u8; 4];
                    put_u32(&mut count, 0, journal.record_count);
                    journal.file.write(cx, &count, journal.header_offset + 8)?;
                    journal.file.sync(cx, SyncFlags::NORMAL)?;
                }
                SynchronousMode::Full => {
                    // Content first, then the count, so the count is never
                    // ahead of what is durable.
                    journal.file.sync(cx, SyncFlags::NORMAL)?;
                    let mut count = [0u8; 4];
                    put_u32(&mut count, 0, journal.record_count);
                    journal.file.write(cx, &count, journal.header_offset + 8)?;
                    journal.file.sync(cx, SyncFlags::NORMAL)?;
                }
            }
        }

        // Phase two: exclusive lock, flush the dirty set into the file.
        self.acquire_lock(cx, LockLevel::Exclusive)?;
        self.state = PagerState::WriterDbMod;

        let page_size = self.config.page_size.as_usize();
        for pgno in self.cache.dirty_pages() {
            cx.checkpoint()?;
            let data = self
                .cache
                .get(pgno)
                .map(|p| p.data.clone())
                .ok_or_else(|| PetraError::internal("dirty page missing from cache"))?;
            let offset = u64::from(pgno - 1) * page_size as u64;
            self.db_file.write(cx, &data, offset).map_err(|_| {
                PetraError::IoWrite { page: pgno }
            })?;
            self.db_file_size = self.db_file_size.max(pgno);
        }
        if self.db_file_size > self.db_size {
            self.db_file
                .truncate(cx, u64::from(self.db_size) * page_size as u64)?;
            self.db_file_size = self.db_size;
        }
        self.state = PagerState::WriterFinished;

        if self.config.synchronous != SynchronousMode::Off {
            let flags = if self.config.synchronous == SynchronousMode::Full {
                SyncFlags::FULL
            } else {
                SyncFlags::NORMAL
            };
            self.db_file.sync(cx, flags)?;
        }

        // The commit point: finalizing the journal makes the transaction
        // irrevocable.
        self.finalize_journal(cx)?;
        Ok(())
    }

    /// Delete, truncate or zero the journal according to the journal mode.
    fn finalize_journal(&mut self, cx: &Cx) -> Result<()> {
        let Some(mut journal) = self.journal.take() else {
            return Ok(());
        };
        match self.config.journal_mode {
            JournalMode::Persist => {
                let zeros = vec![0u8; JOURNAL_HEADER_SIZE];
                journal.file.write(cx, &zeros, 0)?;
                journal.file.sync(cx, SyncFlags::NORMAL)?;
                journal.file.close(cx)?;
            }
            JournalMode::Truncate => {
                journal.file.truncate(cx, 0)?;
                journal.file.sync(cx, SyncFlags::NORMAL)?;
                journal.file.close(cx)?;
            }
            JournalMode::Memory => {
                journal.file.close(cx)?;
            }
            _ => {
                journal.file.close(cx)?;
                self.vfs.delete(cx, &self.journal_file_path, true)?;
            }
        }
        Ok(())
    }

    /// Common epilogue for commit and the no-op write paths: back to
    /// `Reader` holding a shared lock.
    fn end_write_txn(&mut self, cx: &Cx) -> Result<()> {
        if let Some(wal) = self.wal.as_mut() {
            wal.end_write(cx)?;
        }
        if let Some(journal) = self.journal.take() {
            // WriterLocked with an open journal cannot happen, but be
            // thorough: a journal that never got records is just deleted.
            drop(journal);
            self.vfs.delete(cx, &self.journal_file_path, false)?;
        }
        self.cache.clear_flags();
        self.cache.truncate(self.db_size);
        self.in_journal = None;
        self.savepoints.clear();
        self.reset_sub_journal(cx)?;
        self.db_orig_size = self.db_size;
        if self.wal.is_none() && self.lock > LockLevel::Shared {
            self.unlock_to(cx, LockLevel::Shared)?;
        }
        self.state = PagerState::Reader;
        Ok(())
    }

    fn reset_sub_journal(&mut self, cx: &Cx) -> Result<()> {
        if let Some(sub) = self.sub_journal.as_mut() {
            sub.truncate(cx, 0)?;
        }
        self.n_sub_records = 0;
        Ok(())
    }

    /// Abort the current write transaction, restoring the pre-transaction
    /// image.
    pub fn rollback(&mut self, cx: &Cx) -> Result<()> {
        self.check_usable()?;
        if !self.state.is_writer() {
            return Ok(());
        }

        let result = (|| -> Result<()> {
            if let Some(wal) = self.wal.as_mut() {
                wal.rollback_write(cx)?;
                self.cache.drop_dirty();
                self.db_size = self.db_orig_size;
                return Ok(());
            }
            if matches!(
                self.state,
                PagerState::WriterDbMod | PagerState::WriterFinished
            ) {
                // The database file was touched: replay the journal into
                // it before anything else.
                self.playback_own_journal(cx)?;
            }
            self.cache.drop_dirty();
            self.db_size = self.db_orig_size;
            Ok(())
        })();

        match result {
            Ok(()) => {
                if self.journal.is_some() {
                    self.finalize_journal(cx)?;
                }
                self.end_write_txn(cx)
            }
            Err(err) => Err(self.enter_error(err)),
        }
    }

    /// Replay this connection's own journal after a failed or aborted
    /// commit that already modified the database file.
    fn playback_own_journal(&mut self, cx: &Cx) -> Result<()> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        let size = journal.offset;
        let mut image = vec![0u8; usize::try_from(size).map_err(|_| PetraError::Full)?];
        journal.file.read(cx, &mut image, 0)?;
        let page_size = self.config.page_size.as_usize();
        let orig = self.db_orig_size;
        replay_journal_image(cx, &image, page_size, Some(orig), &mut self.db_file)?;
        self.db_file
            .truncate(cx, u64::from(orig) * page_size as u64)?;
        self.db_file_size = orig;
        if self.config.synchronous != SynchronousMode::Off {
            self.db_file.sync(cx, SyncFlags::NORMAL)?;
        }
        Ok(())
    }

    // ── Hot journal recovery ────────────────────────────────────────

    /// Detect and replay a hot journal left behind by a crashed writer.
    /// Called with a shared lock held.
    fn handle_hot_journal(&mut self, cx: &Cx) -> Result<()> {
        if !self
            .vfs
            .access(cx, &self.journal_file_path, AccessFlags::EXISTS)?
        {
            return Ok(());
        }
        let (mut jf, _) = self.vfs.open(
            cx,
            Some(&self.journal_file_path),
            VfsOpenFlags::MAIN_JOURNAL | VfsOpenFlags::READWRITE,
        )?;
        let size = jf.file_size(cx)?;
        if size == 0 {
            jf.close(cx)?;
            return Ok(());
        }
        if self.db_file.check_reserved_lock(cx)? {
            // A live writer owns that journal.
            jf.close(cx)?;
            return Ok(());
        }

        // Hot. Exclusive access, replay, then delete.
        self.acquire_lock(cx, LockLevel::Exclusive)?;
        let mut image = vec![0u8; usize::try_from(size).map_err(|_| PetraError::Full)?];
        jf.read(cx, &mut image, 0)?;
        jf.sync(cx, SyncFlags::NORMAL)?;

        // A journal whose super-journal is gone was already committed
        // everywhere; it is not hot after all.
        let committed_elsewhere = decode_super_journal(&image).is_some_and(|super_path| {
            !self
                .vfs
                .access(cx, &super_path, AccessFlags::EXISTS)
                .unwrap_or(true)
        });
        if !committed_elsewhere {
            let page_size = self.config.page_size.as_usize();
            let orig = replay_journal_image(cx, &image, page_size, None, &mut self.db_file)?;
            if let Some(orig) = orig {
                self.db_file
                    .truncate(cx, u64::from(orig) * page_size as u64)?;
            }
            if self.config.synchronous != SynchronousMode::Off {
                self.db_file.sync(cx, SyncFlags::NORMAL)?;
            }
            self.cache.clear();
            debug!("hot journal replayed");
        }
        jf.close(cx)?;
        self.vfs.delete(cx, &self.journal_file_path, true)?;
        self.unlock_to(cx, LockLevel::Shared)?;
        Ok(())
    }

    // ── Savepoints ──────────────────────────────────────────────────

    /// Open a savepoint; returns its index for `release`/`rollback_to`.
    pub fn open_savepoint(&mut self) -> Result<usize> {
        if !self.state.is_writer() {
            return Err(PetraError::misuse("savepoint outside a write transaction"));
        }
        let sp = Savepoint {
            orig_db_size: self.db_size,
            journal_offset: self.journal.as_ref().map_or(0, |j| j.offset),
            sub_records: self.n_sub_records,
            in_savepoint: PageBitvec::with_capacity(self.db_size),
        };
        self.savepoints.push(sp);
        Ok(self.savepoints.len() - 1)
    }

    /// Release savepoint `index` and everything nested inside it.
    pub fn release_savepoint(&mut self, cx: &Cx, index: usize) -> Result<()> {
        if index >= self.savepoints.len() {
            return Err(PetraError::misuse("no such savepoint"));
        }
        self.savepoints.truncate(index);
        if self.savepoints.is_empty() {
            self.reset_sub_journal(cx)?;
        }
        Ok(())
    }

    /// Roll back to savepoint `index`, which stays open.
    pub fn rollback_to_savepoint(&mut self, cx: &Cx, index: usize) -> Result<()> {
        self.check_usable()?;
        if index >= self.savepoints.len() {
            return Err(PetraError::misuse("no such savepoint"));
        }
        self.savepoints.truncate(index + 1);

        let target_size = self.savepoints[index].orig_db_size;
        let start_offset = self.savepoints[index].journal_offset;
        let start_sub = self.savepoints[index].sub_records;
        let mut done = PageBitvec::with_capacity(self.db_size);
        let page_size = self.config.page_size.as_usize();

        // (a) Main-journal records written since the savepoint opened hold
        // the images the savepoint saw.
        if let Some(journal) = self.journal.as_mut() {
            let start = start_offset.max(journal.first_record_offset);
            let record_size = (8 + page_size) as u64;
            let mut offset = start;
            let mut restored: Vec<(u32, Vec<u8>)> = Vec::new();
            let mut buf = vec![0u8; 8 + page_size];
            while offset + record_size <= journal.offset {
                cx.checkpoint()?;
                journal.file.read(cx, &mut buf, offset)?;
                let record = decode_record(&buf, page_size, journal.seed)?;
                offset += record_size;
                if record.page_number <= target_size && !done.contains(record.page_number) {
                    done.set(record.page_number);
                    restored.push((record.page_number, record.content));
                }
            }
            for (pgno, content) in restored {
                let entry = self.cache.insert(pgno, content);
                entry.dirty = true;
            }
        }

        // (b) Sub-journal records from the savepoint onward.
        if let Some(sub) = self.sub_journal.as_mut() {
            let record_size = 4 + page_size;
            let mut buf = vec![0u8; record_size];
            let mut restored: Vec<(u32, Vec<u8>)> = Vec::new();
            for i in start_sub..self.n_sub_records {
                cx.checkpoint()?;
                let offset = u64::from(i) * record_size as u64;
                sub.read(cx, &mut buf, offset)?;
                let pgno = get_u32(&buf, 0);
                if pgno != 0 && pgno <= target_size && !done.contains(pgno) {
                    done.set(pgno);
                    restored.push((pgno, buf[4..].to_vec()));
                }
            }
            for (pgno, content) in restored {
                let entry = self.cache.insert(pgno, content);
                entry.dirty = true;
            }
        }

        self.db_size = target_size;
        self.cache.truncate(target_size);
        self.n_sub_records = start_sub;
        self.savepoints[index].in_savepoint.clear();
        Ok(())
    }

    // ── Checkpointing ───────────────────────────────────────────────

    /// Run a WAL checkpoint through this connection.
    pub fn checkpoint(&mut self, cx: &Cx, mode: CheckpointMode) -> Result<CheckpointResult> {
        self.check_usable()?;
        if self.state.is_writer() {
            return Err(PetraError::misuse("checkpoint inside a write transaction"));
        }
        let page_size = self.config.page_size;
        let synchronous = self.config.synchronous;
        let Some(wal) = self.wal.as_mut() else {
            return Err(PetraError::misuse("checkpoint without WAL"));
        };
        let mut target = DbFileTarget {
            file: &mut self.db_file,
            page_size,
            synchronous,
            max_page_written: 0,
        };
        let result = wal.checkpoint(cx, mode, &mut target)?;
        self.db_file_size = self.db_file_size.max(target.max_page_written);
        Ok(result)
    }

    /// Close the pager, releasing locks and files. Outstanding write
    /// transactions are rolled back first.
    pub fn close(&mut self, cx: &Cx) -> Result<()> {
        if self.state.is_writer() {
            let _ = self.rollback(cx);
        }
        let _ = self.end_read(cx);
        if let Some(mut wal) = self.wal.take() {
            wal.close(cx, false)?;
        }
        if let Some(mut sub) = self.sub_journal.take() {
            let _ = sub.close(cx);
        }
        self.db_file.close(cx)
    }
}

/// Replay every valid record of a journal image into `db_file`.
///
/// Segments are replayed in file order; a bad header magic or record
/// checksum ends the replay (the tail was torn by a crash) rather than
/// failing it. Returns the original page count from the first header, or
/// `orig_hint` when provided.
fn replay_journal_image<F: VfsFile>(
    cx: &Cx,
    image: &[u8],
    page_size: usize,
    orig_hint: Option<u32>,
    db_file: &mut F,
) -> Result<Option<u32>> {
    let mut offset = 0usize;
    let mut orig = orig_hint;
    'segments: while offset + JOURNAL_HEADER_SIZE <= image.len() {
        let Ok(header) = JournalHeader::decode(&image[offset..]) else {
            break;
        };
        if header.page_size as usize != page_size {
            break;
        }
        let sector = (header.sector_size as usize).max(JOURNAL_HEADER_SIZE);
        if orig.is_none() {
            orig = Some(header.orig_page_count);
        }
        offset += sector;
        let record_size = 8 + page_size;
        let record_count = if header.record_count == RECORD_COUNT_FROM_SIZE {
            ((image.len() - offset.min(image.len())) / record_size) as u32
        } else {
            header.record_count
        };
        for _ in 0..record_count {
            cx.checkpoint()?;
            if offset + record_size > image.len() {
                break 'segments;
            }
            let Ok(record) = decode_record(&image[offset..], page_size, header.checksum_seed)
            else {
                break 'segments;
            };
            offset += record_size;
            let position = u64::from(record.page_number - 1) * page_size as u64;
            db_file.write(cx, &record.content, position)?;
        }
        // Next segment header starts on a sector boundary.
        offset = offset.div_ceil(sector) * sector;
    }
    Ok(orig)
}

/// Backfill target writing into the main database file.
struct DbFileTarget<'a, F: VfsFile> {
    file: &'a mut F,
    page_size: PageSize,
    synchronous: SynchronousMode,
    max_page_written: u32,
}

impl<F: VfsFile> CheckpointTarget for DbFileTarget<'_, F> {
    fn write_page(&mut self, cx: &Cx, page: u32, content: &[u8]) -> Result<()> {
        let offset = u64::from(page - 1) * u64::from(self.page_size.get());
        self.file.write(cx, content, offset)?;
        self.max_page_written = self.max_page_written.max(page);
        Ok(())
    }

    fn truncate_db(&mut self, cx: &Cx, n_pages: u32) -> Result<()> {
        let size = u64::from(n_pages) * u64::from(self.page_size.get());
        if self.file.file_size(cx)? > size {
            self.file.truncate(cx, size)?;
        }
        Ok(())
    }

    fn sync_db(&mut self, cx: &Cx) -> Result<()> {
        if self.synchronous != SynchronousMode::Off {
            self.file.sync(cx, SyncFlags::NORMAL)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petra_vfs::MemoryVfs;

    const PS: PageSize = PageSize::MIN;

    fn config(journal_mode: JournalMode) -> PagerConfig {
        PagerConfig {
            page_size: PS,
            journal_mode,
            ..PagerConfig::default()
        }
    }

    fn open(vfs: &MemoryVfs, mode: JournalMode) -> Pager<MemoryVfs> {
        let cx = Cx::new();
        Pager::open(&cx, vfs.clone(), Path::new("/test.db"), config(mode)).unwrap()
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PS.as_usize()]
    }

    /// A page 1 image carrying a valid database header.
    fn header_page() -> Vec<u8> {
        let mut p = page(0);
        let hdr = DatabaseHeader {
            page_size: PS,
            ..DatabaseHeader::default()
        };
        let mut bytes = [0u8; DATABASE_HEADER_SIZE];
        hdr.encode(&mut bytes);
        p[..DATABASE_HEADER_SIZE].copy_from_slice(&bytes);
        p
    }

    /// Commit pages 1..=n with distinct fills, page 1 a valid header.
    fn seed_db(pager: &mut Pager<MemoryVfs>, n: u32) {
        let cx = Cx::new();
        pager.begin_read(&cx).unwrap();
        pager.begin_write(&cx).unwrap();
        pager.write_page(&cx, 1, &header_page()).unwrap();
        for pgno in 2..=n {
            pager.write_page(&cx, pgno, &page(pgno as u8)).unwrap();
        }
        pager.commit(&cx).unwrap();
    }

    #[test]
    fn commit_persists_across_reopen() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut a = open(&vfs, JournalMode::Delete);
        seed_db(&mut a, 5);
        a.close(&cx).unwrap();

        let mut b = open(&vfs, JournalMode::Delete);
        b.begin_read(&cx).unwrap();
        assert_eq!(b.db_size(), 5);
        assert_eq!(b.read_page(&cx, 3).unwrap(), page(3).as_slice());
        assert_eq!(b.read_page(&cx, 5).unwrap(), page(5).as_slice());
    }

    #[test]
    fn journal_is_gone_after_commit() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 3);
        assert!(!vfs
            .access(&cx, Path::new("/test.db-journal"), AccessFlags::EXISTS)
            .unwrap());
    }

    #[test]
    fn rollback_restores_cached_image() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 3);

        pager.begin_write(&cx).unwrap();
        pager.write_page(&cx, 2, &page(0xEE)).unwrap();
        pager.write_page(&cx, 4, &page(0xEF)).unwrap();
        assert_eq!(pager.db_size(), 4);
        pager.rollback(&cx).unwrap();

        assert_eq!(pager.db_size(), 3);
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(2).as_slice());
        assert!(pager.read_page(&cx, 4).is_err());
    }

    #[test]
    fn commit_bumps_change_counter() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 2);
        let before = get_u32(pager.read_page(&cx, 1).unwrap(), CHANGE_COUNTER_OFFSET);

        pager.begin_write(&cx).unwrap();
        pager.write_page(&cx, 2, &page(0x22)).unwrap();
        pager.commit(&cx).unwrap();
        let after = get_u32(pager.read_page(&cx, 1).unwrap(), CHANGE_COUNTER_OFFSET);
        assert_eq!(after, before + 1);
    }

    #[test]
    fn commit_without_changes_is_a_noop() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 2);
        let before = get_u32(pager.read_page(&cx, 1).unwrap(), CHANGE_COUNTER_OFFSET);

        pager.begin_write(&cx).unwrap();
        pager.commit(&cx).unwrap();
        assert_eq!(pager.state(), PagerState::Reader);
        let after = get_u32(pager.read_page(&cx, 1).unwrap(), CHANGE_COUNTER_OFFSET);
        assert_eq!(after, before);
    }

    #[test]
    fn truncate_image_shrinks_the_file() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 6);

        pager.begin_write(&cx).unwrap();
        pager.write_page(&cx, 2, &page(0x22)).unwrap();
        pager.truncate_image(4).unwrap();
        pager.commit(&cx).unwrap();

        pager.end_read(&cx).unwrap();
        pager.begin_read(&cx).unwrap();
        assert_eq!(pager.db_size(), 4);
        assert!(pager.read_page(&cx, 5).is_err());
    }

    #[test]
    fn reads_in_writer_state_see_uncommitted_pages() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 2);

        pager.begin_write(&cx).unwrap();
        pager.write_page(&cx, 2, &page(0x44)).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(0x44).as_slice());
        // A page beyond the image reads as zeroes for the writer.
        assert_eq!(pager.read_page(&cx, 9).unwrap(), page(0).as_slice());
        pager.rollback(&cx).unwrap();
    }

    #[test]
    fn second_writer_gets_busy() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut a = open(&vfs, JournalMode::Delete);
        seed_db(&mut a, 2);

        let mut b = open(&vfs, JournalMode::Delete);
        b.begin_read(&cx).unwrap();

        a.begin_write(&cx).unwrap();
        assert!(matches!(b.begin_write(&cx), Err(PetraError::Busy)));
        a.rollback(&cx).unwrap();
        b.begin_write(&cx).unwrap();
    }

    #[test]
    fn misuse_out_of_sequence() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        assert!(matches!(
            pager.read_page(&cx, 1),
            Err(PetraError::Misuse { .. })
        ));
        assert!(matches!(
            pager.begin_write(&cx),
            Err(PetraError::Misuse { .. })
        ));
        pager.begin_read(&cx).unwrap();
        assert!(matches!(
            pager.write_page(&cx, 1, &page(0)),
            Err(PetraError::Misuse { .. })
        ));
        assert!(pager.open_savepoint().is_err());
    }

    // ── Hot journal recovery ────────────────────────────────────────

    /// Write raw bytes to `path` through the VFS.
    fn write_raw(vfs: &MemoryVfs, path: &str, bytes: &[u8]) {
        let cx = Cx::new();
        let (mut f, _) = vfs
            .open(
                &cx,
                Some(Path::new(path)),
                VfsOpenFlags::MAIN_JOURNAL | VfsOpenFlags::READWRITE | VfsOpenFlags::CREATE,
            )
            .unwrap();
        f.write(&cx, bytes, 0).unwrap();
        f.close(&cx).unwrap();
    }

    fn read_raw(vfs: &MemoryVfs, path: &str, offset: u64, len: usize) -> Vec<u8> {
        let cx = Cx::new();
        let (mut f, _) = vfs
            .open(
                &cx,
                Some(Path::new(path)),
                VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE,
            )
            .unwrap();
        let mut buf = vec![0u8; len];
        f.read(&cx, &mut buf, offset).unwrap();
        buf
    }

    /// A crashed writer left new content in the database file and its
    /// journal on disk: the next reader must roll the file back.
    #[test]
    fn hot_journal_restores_original_content() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 5);
        pager.close(&cx).unwrap();

        // Simulate the crash: page 5 clobbered, journal holding the
        // pre-image with the sentinel count still in its header.
        let seed = 0xABCD;
        let mut journal = JournalHeader {
            record_count: RECORD_COUNT_FROM_SIZE,
            checksum_seed: seed,
            orig_page_count: 5,
            sector_size: 512,
            page_size: PS.get(),
        }
        .encode();
        journal.extend_from_slice(&encode_record(5, &page(5), seed));
        write_raw(&vfs, "/test.db-journal", &journal);

        let (mut db, _) = vfs
            .open(
                &cx,
                Some(Path::new("/test.db")),
                VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE,
            )
            .unwrap();
        db.write(&cx, &page(0x66), 4 * u64::from(PS.get())).unwrap();
        db.close(&cx).unwrap();

        let mut reader = open(&vfs, JournalMode::Delete);
        reader.begin_read(&cx).unwrap();
        assert_eq!(reader.read_page(&cx, 5).unwrap(), page(5).as_slice());
        assert!(!vfs
            .access(&cx, Path::new("/test.db-journal"), AccessFlags::EXISTS)
            .unwrap());
    }

    /// Replay stops at the first torn record and keeps the valid prefix.
    #[test]
    fn hot_journal_partial_prefix_replay() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 4);
        pager.close(&cx).unwrap();

        let seed = 0x1111;
        let mut journal = JournalHeader {
            record_count: RECORD_COUNT_FROM_SIZE,
            checksum_seed: seed,
            orig_page_count: 4,
            sector_size: 512,
            page_size: PS.get(),
        }
        .encode();
        journal.extend_from_slice(&encode_record(3, &page(3), seed));
        // Second record torn: only half of it reached disk.
        let torn = encode_record(4, &page(4), seed);
        journal.extend_from_slice(&torn[..torn.len() / 2]);
        write_raw(&vfs, "/test.db-journal", &journal);

        let (mut db, _) = vfs
            .open(
                &cx,
                Some(Path::new("/test.db")),
                VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE,
            )
            .unwrap();
        db.write(&cx, &page(0x77), 2 * u64::from(PS.get())).unwrap();
        db.write(&cx, &page(0x78), 3 * u64::from(PS.get())).unwrap();
        db.close(&cx).unwrap();

        let mut reader = open(&vfs, JournalMode::Delete);
        reader.begin_read(&cx).unwrap();
        // The intact record was replayed.
        assert_eq!(reader.read_page(&cx, 3).unwrap(), page(3).as_slice());
        // The torn record was not; page 4 keeps the crashed writer's bytes.
        assert_eq!(reader.read_page(&cx, 4).unwrap(), page(0x78).as_slice());
    }

    /// An empty journal file is not hot.
    #[test]
    fn empty_journal_is_ignored() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 2);
        pager.close(&cx).unwrap();

        write_raw(&vfs, "/test.db-journal", &[]);
        let mut reader = open(&vfs, JournalMode::Delete);
        reader.begin_read(&cx).unwrap();
        assert_eq!(reader.read_page(&cx, 2).unwrap(), page(2).as_slice());
    }

    /// A journal whose super-journal no longer exists was committed
    /// everywhere and must not be replayed.
    #[test]
    fn journal_with_missing_super_journal_is_not_hot() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 3);
        pager.close(&cx).unwrap();

        let seed = 0x2222;
        let mut journal = JournalHeader {
            record_count: 1,
            checksum_seed: seed,
            orig_page_count: 3,
            sector_size: 512,
            page_size: PS.get(),
        }
        .encode();
        journal.extend_from_slice(&encode_record(3, &page(0x55), seed));
        journal.extend_from_slice(&encode_super_journal("/gone.super", PS.get()));
        write_raw(&vfs, "/test.db-journal", &journal);

        let mut reader = open(&vfs, JournalMode::Delete);
        reader.begin_read(&cx).unwrap();
        // Page 3 keeps its committed content; the stale pre-image is not
        // applied.
        assert_eq!(reader.read_page(&cx, 3).unwrap(), page(3).as_slice());
    }

    #[test]
    fn persist_mode_zeroes_the_journal_header() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Persist);
        seed_db(&mut pager, 2);

        assert!(vfs
            .access(&cx, Path::new("/test.db-journal"), AccessFlags::EXISTS)
            .unwrap());
        let head = read_raw(&vfs, "/test.db-journal", 0, JOURNAL_HEADER_SIZE);
        assert!(head.iter().all(|&b| b == 0));

        // The zeroed journal is not hot on the next read.
        pager.end_read(&cx).unwrap();
        pager.begin_read(&cx).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(2).as_slice());
    }

    // ── Savepoints ──────────────────────────────────────────────────

    #[test]
    fn savepoint_rollback_restores_and_is_idempotent() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 3);

        pager.begin_write(&cx).unwrap();
        pager.write_page(&cx, 2, &page(0xA1)).unwrap();
        let sp = pager.open_savepoint().unwrap();
        pager.write_page(&cx, 2, &page(0xA2)).unwrap();
        pager.write_page(&cx, 3, &page(0xA3)).unwrap();
        pager.write_page(&cx, 4, &page(0xA4)).unwrap();

        pager.rollback_to_savepoint(&cx, sp).unwrap();
        assert_eq!(pager.db_size(), 3);
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(0xA1).as_slice());
        assert_eq!(pager.read_page(&cx, 3).unwrap(), page(3).as_slice());

        // Modify again and roll back again: the image must be identical.
        pager.write_page(&cx, 2, &page(0xB2)).unwrap();
        pager.write_page(&cx, 4, &page(0xB4)).unwrap();
        pager.rollback_to_savepoint(&cx, sp).unwrap();
        assert_eq!(pager.db_size(), 3);
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(0xA1).as_slice());

        pager.commit(&cx).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(0xA1).as_slice());
        assert_eq!(pager.db_size(), 3);
    }

    #[test]
    fn nested_savepoints_rollback_to_outer() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 2);

        pager.begin_write(&cx).unwrap();
        let outer = pager.open_savepoint().unwrap();
        pager.write_page(&cx, 2, &page(0xC1)).unwrap();
        let inner = pager.open_savepoint().unwrap();
        pager.write_page(&cx, 2, &page(0xC2)).unwrap();

        pager.rollback_to_savepoint(&cx, inner).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(0xC1).as_slice());

        pager.rollback_to_savepoint(&cx, outer).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(2).as_slice());
        // The inner savepoint is gone.
        assert!(pager.rollback_to_savepoint(&cx, inner).is_err());
        pager.rollback(&cx).unwrap();
    }

    #[test]
    fn release_discards_savepoints() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Delete);
        seed_db(&mut pager, 2);

        pager.begin_write(&cx).unwrap();
        let sp = pager.open_savepoint().unwrap();
        pager.write_page(&cx, 2, &page(0xD1)).unwrap();
        pager.release_savepoint(&cx, sp).unwrap();
        assert!(pager.rollback_to_savepoint(&cx, sp).is_err());
        // The change survives the release.
        pager.commit(&cx).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(0xD1).as_slice());
    }

    #[test]
    fn savepoint_rollback_in_wal_mode() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Wal);
        seed_db(&mut pager, 3);

        pager.begin_write(&cx).unwrap();
        let sp = pager.open_savepoint().unwrap();
        pager.write_page(&cx, 2, &page(0xE2)).unwrap();
        pager.rollback_to_savepoint(&cx, sp).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(2).as_slice());
        pager.commit(&cx).unwrap();

        pager.end_read(&cx).unwrap();
        pager.begin_read(&cx).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(2).as_slice());
    }

    // ── WAL mode ────────────────────────────────────────────────────

    #[test]
    fn wal_commit_visible_to_other_connection() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut writer = open(&vfs, JournalMode::Wal);
        seed_db(&mut writer, 3);

        let mut reader = open(&vfs, JournalMode::Wal);
        reader.begin_read(&cx).unwrap();
        assert_eq!(reader.db_size(), 3);
        assert_eq!(reader.read_page(&cx, 2).unwrap(), page(2).as_slice());

        writer.begin_write(&cx).unwrap();
        writer.write_page(&cx, 2, &page(0xF2)).unwrap();
        writer.commit(&cx).unwrap();

        // The open snapshot still sees the old content.
        assert_eq!(reader.read_page(&cx, 2).unwrap(), page(2).as_slice());
        // A fresh read transaction sees the commit.
        reader.end_read(&cx).unwrap();
        reader.begin_read(&cx).unwrap();
        assert_eq!(reader.read_page(&cx, 2).unwrap(), page(0xF2).as_slice());
    }

    #[test]
    fn wal_rollback_discards_frames() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Wal);
        seed_db(&mut pager, 2);

        pager.begin_write(&cx).unwrap();
        pager.write_page(&cx, 2, &page(0x99)).unwrap();
        pager.rollback(&cx).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(2).as_slice());

        pager.end_read(&cx).unwrap();
        pager.begin_read(&cx).unwrap();
        assert_eq!(pager.read_page(&cx, 2).unwrap(), page(2).as_slice());
    }

    #[test]
    fn wal_checkpoint_truncate_moves_content_to_db_file() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Wal);
        seed_db(&mut pager, 4);
        pager.end_read(&cx).unwrap();

        let result = pager.checkpoint(&cx, CheckpointMode::Truncate).unwrap();
        assert_eq!(result.log_frames, result.backfilled);

        // The database file now holds every page.
        let raw = read_raw(&vfs, "/test.db", 3 * u64::from(PS.get()), PS.as_usize());
        assert_eq!(raw, page(4));

        pager.begin_read(&cx).unwrap();
        assert_eq!(pager.read_page(&cx, 4).unwrap(), page(4).as_slice());
    }

    #[test]
    fn checkpoint_rejected_inside_write_txn() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open(&vfs, JournalMode::Wal);
        seed_db(&mut pager, 2);
        pager.begin_write(&cx).unwrap();
        assert!(matches!(
            pager.checkpoint(&cx, CheckpointMode::Passive),
            Err(PetraError::Misuse { .. })
        ));
        pager.rollback(&cx).unwrap();
    }
}
