//! Checkpoint: copying WAL frames back into the database file.
//!
//! The checkpointer runs on its own connection. It may only backfill up to
//! the lowest read mark of any active reader, and it needs exclusive use of
//! reader slot 0 (whose readers see the database file alone) for the whole
//! copy. PASSIVE mode turns contention into partial progress; FULL,
//! RESTART and TRUNCATE report it as `Busy`.

use std::collections::HashMap;

use tracing::debug;

use petra_error::{PetraError, Result};
use petra_types::CheckpointMode;
use petra_types::cx::Cx;
use petra_types::flags::SyncFlags;
use petra_vfs::VfsFile;

use crate::checksum::{WAL_FRAME_HEADER_SIZE, WalChecksum, WalFrameHeader, frame_offset};
use crate::wal::Wal;
use crate::wal_index::{READ_MARK_COUNT, READ_MARK_NOT_USED, WalCkptInfo, WalIndexHdr};

/// Where backfilled pages go. Implemented by the pager over the database
/// file; tests substitute an in-memory target.
pub trait CheckpointTarget {
    /// Write one page image at its position in the database file.
    fn write_page(&mut self, cx: &Cx, page: u32, content: &[u8]) -> Result<()>;

    /// Truncate the database file to `n_pages` pages.
    fn truncate_db(&mut self, cx: &Cx, n_pages: u32) -> Result<()>;

    /// Sync the database file.
    fn sync_db(&mut self, cx: &Cx) -> Result<()>;
}

/// Outcome of a checkpoint attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    /// Total frames in the WAL at the time of the checkpoint.
    pub log_frames: u32,
    /// Frames backfilled into the database file so far (cumulative).
    pub backfilled: u32,
}

impl<F: VfsFile> Wal<F> {
    /// Run a checkpoint in `mode`, copying frames into `target`.
    pub fn checkpoint(
        &mut self,
        cx: &Cx,
        mode: CheckpointMode,
        target: &mut dyn CheckpointTarget,
    ) -> Result<CheckpointResult> {
        self.lock_ckpt(cx)?;
        let result = self.checkpoint_locked(cx, mode, target);
        let unlock = self.unlock_ckpt(cx);
        let result = result?;
        unlock?;
        Ok(result)
    }

    fn checkpoint_locked(
        &mut self,
        cx: &Cx,
        mode: CheckpointMode,
        target: &mut dyn CheckpointTarget,
    ) -> Result<CheckpointResult> {
        self.refresh_header()?;
        let hdr = *self.header();
        let mut info = self.index().read_ckpt_info()?;
        let mx = hdr.mx_frame;

        if mx > info.n_backfill {
            match self.backfill(cx, target, &hdr, &mut info) {
                Ok(()) => {}
                Err(PetraError::Busy) if mode == CheckpointMode::Passive => {
                    // Partial progress is fine for PASSIVE.
                }
                Err(err) => return Err(err),
            }
        }

        if matches!(mode, CheckpointMode::Restart | CheckpointMode::Truncate) {
            self.reset_log(cx, mode, &hdr, &info)?;
        }

        Ok(CheckpointResult {
            log_frames: mx,
            backfilled: info.n_backfill,
        })
    }

    /// Copy frames `n_backfill+1 ..= mx_safe` into the target, newest frame
    /// per page, ascending page order.
    fn backfill(
        &mut self,
        cx: &Cx,
        target: &mut dyn CheckpointTarget,
        hdr: &WalIndexHdr,
        info: &mut WalCkptInfo,
    ) -> Result<()> {
        let mx = hdr.mx_frame;

        // Slot-0 readers see the database file alone; the file must not
        // move under them.
        if self.lock_readers_exclusive(cx, 0, 1).is_err() {
            return Err(PetraError::Busy);
        }
        let result = (|| -> Result<()> {
            // Each busy reader bounds how far we may backfill; each idle
            // slot is cleared so it no longer constrains anyone.
            let mut mx_safe = mx;
            for slot in 1..READ_MARK_COUNT {
                let mark = info.read_marks[slot];
                if mark == READ_MARK_NOT_USED || mark >= mx_safe {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation)]
                let slot_u32 = slot as u32;
                if self.lock_readers_exclusive(cx, slot_u32, 1).is_ok() {
                    self.index().set_read_mark(slot, READ_MARK_NOT_USED)?;
                    self.unlock_readers_exclusive(cx, slot_u32, 1)?;
                } else {
                    mx_safe = mark;
                }
            }

            if mx_safe <= info.n_backfill {
                return if mx_safe < mx {
                    Err(PetraError::Busy)
                } else {
                    Ok(())
                };
            }

            info.n_backfill_attempted = mx_safe;
            self.index().write_ckpt_info(info)?;
            self.file_mut().shm_barrier();

            // Newest frame per page within the backfill range.
            let mut newest: HashMap<u32, u32> = HashMap::new();
            for frame in info.n_backfill + 1..=mx_safe {
                cx.checkpoint()?;
                let mut header_bytes = [0u8; WAL_FRAME_HEADER_SIZE];
                self.file_mut()
                    .read(cx, &mut header_bytes, frame_offset(frame, hdr.page_size))?;
                let fh = WalFrameHeader::decode(&header_bytes)?;
                newest.insert(fh.page_number, frame);
            }
            let mut pages: Vec<(u32, u32)> = newest.into_iter().collect();
            pages.sort_unstable();

            let mut content = vec![0u8; hdr.page_size as usize];
            for (page, frame) in pages {
                cx.checkpoint()?;
                self.read_frame(cx, frame, &mut content)?;
                target.write_page(cx, page, &content)?;
            }

            if mx_safe == mx {
                target.truncate_db(cx, hdr.n_page)?;
            }
            target.sync_db(cx)?;

            info.n_backfill = mx_safe;
            self.index().write_ckpt_info(info)?;
            self.file_mut().shm_barrier();
            debug!(backfilled = mx_safe, of = mx, "checkpoint backfill done");

            if mx_safe < mx {
                Err(PetraError::Busy)
            } else {
                Ok(())
            }
        })();
        let unlock = self.unlock_readers_exclusive(cx, 0, 1);
        unlock?;
        result
    }

    /// RESTART/TRUNCATE epilogue: drain every reader off the WAL and reset
    /// the index header to an empty log with fresh salts.
    fn reset_log(
        &mut self,
        cx: &Cx,
        mode: CheckpointMode,
        hdr: &WalIndexHdr,
        info: &WalCkptInfo,
    ) -> Result<()> {
        if info.n_backfill < hdr.mx_frame {
            return Err(PetraError::Busy);
        }
        #[allow(clippy::cast_possible_truncation)]
        let n_marks = (READ_MARK_COUNT - 1) as u32;
        // Readers on slot 0 and on the marks both block a reset.
        self.lock_readers_exclusive(cx, 0, 1)?;
        let result = (|| -> Result<()> {
            if self.lock_readers_exclusive(cx, 1, n_marks).is_err() {
                return Err(PetraError::Busy);
            }
            let salt2 = self.fresh_salt();
            let new_hdr = WalIndexHdr {
                change_counter: hdr.change_counter.wrapping_add(1),
                is_init: true,
                big_end_cksum: hdr.big_end_cksum,
                page_size: hdr.page_size,
                mx_frame: 0,
                n_page: hdr.n_page,
                frame_cksum: WalChecksum::default(),
                salt1: hdr.salt1.wrapping_add(1),
                salt2,
            };
            self.index().truncate(0)?;
            self.index().write_header(&new_hdr)?;
            self.file_mut().shm_barrier();
            self.index().write_ckpt_info(&WalCkptInfo::default())?;
            self.set_header(new_hdr);

            if mode == CheckpointMode::Truncate {
                self.file_mut().truncate(cx, 0)?;
                self.file_mut().sync(cx, SyncFlags::NORMAL)?;
            }
            self.unlock_readers_exclusive(cx, 1, n_marks)?;
            debug!(?mode, "WAL reset");
            Ok(())
        })();
        let unlock = self.unlock_readers_exclusive(cx, 0, 1);
        result?;
        unlock
    }
}
