//! Wal-index: the shared-memory structure mapping page numbers to frames.
//!
//! The index lives in 32 KiB shm segments. Every segment holds a page-number
//! array (`u32[4096]`) followed by an open-addressing hash table
//! (`u16[8192]`, value = 1-based entry index within the segment, 0 = empty).
//! The first segment reserves its leading 136 bytes for two redundant copies
//! of the 48-byte index header plus the 40-byte checkpoint-info block, so it
//! holds only 4062 frame entries.
//!
//! All wal-index fields are native-endian: the structure is rebuilt from the
//! WAL file on recovery and never travels between machines.

use petra_error::{PetraError, Result};
use petra_vfs::ShmRegion;

use crate::checksum::WalChecksum;

/// Hash multiplier.
pub const HASH_MULTIPLIER: u32 = 383;
/// Hash slots per segment.
pub const HASH_SLOTS: usize = 8192;
/// Slot mask (table size is a power of two).
pub const HASH_MASK: u32 = 8191;
/// Page-number entries per segment.
pub const PAGE_ENTRIES: usize = 4096;
/// Shm segment size in bytes.
pub const SEGMENT_BYTES: usize = 32 * 1024;
/// Byte offset of the hash table within a segment.
const HASH_TABLE_OFFSET: usize = PAGE_ENTRIES * 4;

/// Bytes reserved at the front of the first segment for headers.
pub const HEADER_RESERVED_BYTES: usize = 136;
/// Frame entries available in the first segment.
pub const FIRST_SEGMENT_ENTRIES: usize = PAGE_ENTRIES - HEADER_RESERVED_BYTES / 4;

/// Size of one `WalIndexHdr` copy.
pub const INDEX_HDR_BYTES: usize = 48;
/// Byte offset of the checkpoint-info block (after the two header copies).
pub const CKPT_INFO_OFFSET: usize = 2 * INDEX_HDR_BYTES;
/// Size of the checkpoint-info block.
pub const CKPT_INFO_BYTES: usize = 40;

/// Number of reader marks.
pub const READ_MARK_COUNT: usize = 5;
/// Read-mark value meaning "slot unused".
pub const READ_MARK_NOT_USED: u32 = 0xFFFF_FFFF;

/// Shm lock slot held by the single writer.
pub const WRITE_LOCK: u32 = 0;
/// Shm lock slot held by the checkpointer.
pub const CKPT_LOCK: u32 = 1;
/// Shm lock slot held during recovery.
pub const RECOVER_LOCK: u32 = 2;
/// First reader lock slot; slot `READ_LOCK_BASE + i` guards read mark `i`.
pub const READ_LOCK_BASE: u32 = 3;

fn get_ne_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn put_ne_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn get_ne_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

fn put_ne_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
}

/// Cumulative checksum over native-order words, used for the index header's
/// self-checksum.
fn native_checksum(data: &[u8]) -> WalChecksum {
    let mut c = WalChecksum::default();
    for chunk in data.chunks_exact(8) {
        let w1 = get_ne_u32(chunk, 0);
        let w2 = get_ne_u32(chunk, 4);
        c.s1 = c.s1.wrapping_add(w1).wrapping_add(c.s2);
        c.s2 = c.s2.wrapping_add(w2).wrapping_add(c.s1);
    }
    c
}

/// The 48-byte wal-index header. Two copies live at the front of the first
/// segment; a reader accepts them only when both copies agree and the
/// self-checksum matches, which detects a torn concurrent update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalIndexHdr {
    /// Counter bumped on every header publish; readers use it to detect
    /// snapshot changes.
    pub change_counter: u32,
    pub is_init: bool,
    pub big_end_cksum: bool,
    pub page_size: u32,
    /// Highest valid frame in the WAL; 0 means the WAL is empty.
    pub mx_frame: u32,
    /// Database size in pages as of `mx_frame`.
    pub n_page: u32,
    /// Running frame checksum at `mx_frame`.
    pub frame_cksum: WalChecksum,
    /// Salt pair currently in the WAL header.
    pub salt1: u32,
    pub salt2: u32,
}

/// Wal-index format version, stored in the header.
pub const INDEX_VERSION: u32 = 3_007_000;

impl WalIndexHdr {
    fn encode(&self) -> [u8; INDEX_HDR_BYTES] {
        let mut buf = [0u8; INDEX_HDR_BYTES];
        put_ne_u32(&mut buf, 0, INDEX_VERSION);
        put_ne_u32(&mut buf, 8, self.change_counter);
        buf[12] = u8::from(self.is_init);
        buf[13] = u8::from(self.big_end_cksum);
        #[allow(clippy::cast_possible_truncation)]
        put_ne_u16(&mut buf, 14, (self.page_size & 0xFFFF) as u16);
        put_ne_u32(&mut buf, 16, self.mx_frame);
        put_ne_u32(&mut buf, 20, self.n_page);
        put_ne_u32(&mut buf, 24, self.frame_cksum.s1);
        put_ne_u32(&mut buf, 28, self.frame_cksum.s2);
        put_ne_u32(&mut buf, 32, self.salt1);
        put_ne_u32(&mut buf, 36, self.salt2);
        let cksum = native_checksum(&buf[..40]);
        put_ne_u32(&mut buf, 40, cksum.s1);
        put_ne_u32(&mut buf, 44, cksum.s2);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if get_ne_u32(buf, 0) != INDEX_VERSION {
            return Err(PetraError::WalCorrupt {
                detail: "wal-index version mismatch".to_owned(),
            });
        }
        let stored = WalChecksum {
            s1: get_ne_u32(buf, 40),
            s2: get_ne_u32(buf, 44),
        };
        if native_checksum(&buf[..40]) != stored {
            return Err(PetraError::Protocol {
                detail: "wal-index header checksum mismatch".to_owned(),
            });
        }
        let raw_page_size = u32::from(get_ne_u16(buf, 14));
        Ok(Self {
            change_counter: get_ne_u32(buf, 8),
            is_init: buf[12] != 0,
            big_end_cksum: buf[13] != 0,
            page_size: if raw_page_size == 1 {
                65536
            } else {
                raw_page_size
            },
            mx_frame: get_ne_u32(buf, 16),
            n_page: get_ne_u32(buf, 20),
            frame_cksum: WalChecksum {
                s1: get_ne_u32(buf, 24),
                s2: get_ne_u32(buf, 28),
            },
            salt1: get_ne_u32(buf, 32),
            salt2: get_ne_u32(buf, 36),
        })
    }
}

/// The checkpoint-info block at byte 96 of the first segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalCkptInfo {
    /// Frames already copied into the database file.
    pub n_backfill: u32,
    /// Per-reader published snapshot bounds.
    pub read_marks: [u32; READ_MARK_COUNT],
    /// High-water mark of backfill attempts, for crash diagnosis.
    pub n_backfill_attempted: u32,
}

impl Default for WalCkptInfo {
    fn default() -> Self {
        let mut read_marks = [READ_MARK_NOT_USED; READ_MARK_COUNT];
        read_marks[0] = 0;
        Self {
            n_backfill: 0,
            read_marks,
            n_backfill_attempted: 0,
        }
    }
}

impl WalCkptInfo {
    fn encode(&self) -> [u8; CKPT_INFO_BYTES] {
        let mut buf = [0u8; CKPT_INFO_BYTES];
        put_ne_u32(&mut buf, 0, self.n_backfill);
        for (i, mark) in self.read_marks.iter().enumerate() {
            put_ne_u32(&mut buf, 4 + i * 4, *mark);
        }
        // Bytes 24..32 are the on-disk shadow of the lock slots; always
        // zero here since locking goes through the VFS.
        put_ne_u32(&mut buf, 32, self.n_backfill_attempted);
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let mut read_marks = [0u32; READ_MARK_COUNT];
        for (i, mark) in read_marks.iter_mut().enumerate() {
            *mark = get_ne_u32(buf, 4 + i * 4);
        }
        Self {
            n_backfill: get_ne_u32(buf, 0),
            read_marks,
            n_backfill_attempted: get_ne_u32(buf, 32),
        }
    }
}

/// Location of one frame's entry in the segmented index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameSlot {
    segment: usize,
    /// 1-based entry index within the segment.
    entry: usize,
}

fn locate(frame: u32) -> FrameSlot {
    let frame = frame as usize;
    if frame <= FIRST_SEGMENT_ENTRIES {
        FrameSlot {
            segment: 0,
            entry: frame,
        }
    } else {
        let rest = frame - FIRST_SEGMENT_ENTRIES - 1;
        FrameSlot {
            segment: 1 + rest / PAGE_ENTRIES,
            entry: rest % PAGE_ENTRIES + 1,
        }
    }
}

/// First frame stored in `segment` (1-based frame numbering).
fn segment_first_frame(segment: usize) -> u32 {
    if segment == 0 {
        1
    } else {
        #[allow(clippy::cast_possible_truncation)]
        {
            (FIRST_SEGMENT_ENTRIES + (segment - 1) * PAGE_ENTRIES + 1) as u32
        }
    }
}

/// Number of frame entries `segment` can hold.
fn segment_capacity(segment: usize) -> usize {
    if segment == 0 {
        FIRST_SEGMENT_ENTRIES
    } else {
        PAGE_ENTRIES
    }
}

/// Byte offset of entry `entry` (1-based) in `segment`'s page array.
fn entry_offset(segment: usize, entry: usize) -> usize {
    if segment == 0 {
        HEADER_RESERVED_BYTES + (entry - 1) * 4
    } else {
        (entry - 1) * 4
    }
}

/// Segment index needed to store `frame`.
pub fn segment_for_frame(frame: u32) -> usize {
    locate(frame).segment
}

/// Hash-table and header operations over the mapped shm segments.
///
/// The caller maps segments through `VfsFile::shm_map` and hands them in;
/// this type never does I/O. Mutations require the appropriate shm lock
/// slot, which is the caller's responsibility.
#[derive(Debug, Default)]
pub struct WalIndex {
    segments: Vec<ShmRegion>,
}

impl WalIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mapped segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Adopt a newly mapped segment. Segments must arrive in order.
    pub fn push_segment(&mut self, region: ShmRegion) -> Result<()> {
        if region.len() < SEGMENT_BYTES {
            return Err(PetraError::Protocol {
                detail: format!("shm segment too small: {} bytes", region.len()),
            });
        }
        self.segments.push(region);
        Ok(())
    }

    /// Drop all mapped segments (connection closing or index reset).
    pub fn clear_segments(&mut self) {
        self.segments.clear();
    }

    fn first_segment(&self) -> Result<&ShmRegion> {
        self.segments.first().ok_or_else(|| PetraError::Protocol {
            detail: "wal-index not mapped".to_owned(),
        })
    }

    /// Read the header, requiring the two copies to agree.
    ///
    /// A disagreement means a writer is mid-publish; the caller retries
    /// after a barrier rather than treating it as corruption.
    pub fn read_header(&self) -> Result<WalIndexHdr> {
        let seg = self.first_segment()?;
        let guard = seg.lock();
        let copy1 = WalIndexHdr::decode(&guard[..INDEX_HDR_BYTES])?;
        let copy2 = WalIndexHdr::decode(&guard[INDEX_HDR_BYTES..2 * INDEX_HDR_BYTES])?;
        drop(guard);
        if copy1 != copy2 {
            return Err(PetraError::Protocol {
                detail: "wal-index header copies disagree".to_owned(),
            });
        }
        if !copy1.is_init {
            return Err(PetraError::Protocol {
                detail: "wal-index header not initialized".to_owned(),
            });
        }
        Ok(copy1)
    }

    /// Publish a new header: second copy first, then the first copy, so a
    /// concurrent reader sees either the old pair or the new pair (or a
    /// mismatch it retries on).
    pub fn write_header(&self, hdr: &WalIndexHdr) -> Result<()> {
        let seg = self.first_segment()?;
        let bytes = hdr.encode();
        let mut guard = seg.lock();
        guard[INDEX_HDR_BYTES..2 * INDEX_HDR_BYTES].copy_from_slice(&bytes);
        guard[..INDEX_HDR_BYTES].copy_from_slice(&bytes);
        Ok(())
    }

    pub fn read_ckpt_info(&self) -> Result<WalCkptInfo> {
        let seg = self.first_segment()?;
        let guard = seg.lock();
        Ok(WalCkptInfo::decode(
            &guard[CKPT_INFO_OFFSET..CKPT_INFO_OFFSET + CKPT_INFO_BYTES],
        ))
    }

    pub fn write_ckpt_info(&self, info: &WalCkptInfo) -> Result<()> {
        let seg = self.first_segment()?;
        let bytes = info.encode();
        seg.write_at(CKPT_INFO_OFFSET, &bytes);
        Ok(())
    }

    /// Update a single read mark.
    pub fn set_read_mark(&self, slot: usize, value: u32) -> Result<()> {
        let seg = self.first_segment()?;
        let mut guard = seg.lock();
        put_ne_u32(&mut guard, CKPT_INFO_OFFSET + 4 + slot * 4, value);
        Ok(())
    }

    /// Record a frame in the index. The segment covering `frame` must
    /// already be mapped.
    pub fn append(&self, frame: u32, page: u32) -> Result<()> {
        let slot = locate(frame);
        let seg = self.segments.get(slot.segment).ok_or_else(|| {
            PetraError::Protocol {
                detail: format!("shm segment {} not mapped", slot.segment),
            }
        })?;
        let mut guard = seg.lock();

        // When this is the first entry of its segment, start from a clean
        // table: a WAL reset leaves stale entries behind.
        if slot.entry == 1 {
            let base = entry_offset(slot.segment, 1);
            let cap = segment_capacity(slot.segment);
            guard[base..base + cap * 4].fill(0);
            guard[HASH_TABLE_OFFSET..HASH_TABLE_OFFSET + HASH_SLOTS * 2].fill(0);
        }

        put_ne_u32(&mut guard, entry_offset(slot.segment, slot.entry), page);

        let mut key = (page.wrapping_mul(HASH_MULTIPLIER)) & HASH_MASK;
        loop {
            let off = HASH_TABLE_OFFSET + key as usize * 2;
            if get_ne_u16(&guard, off) == 0 {
                #[allow(clippy::cast_possible_truncation)]
                put_ne_u16(&mut guard, off, slot.entry as u16);
                return Ok(());
            }
            key = (key + 1) & HASH_MASK;
        }
    }

    /// Find the newest frame for `page` in `min_frame..=max_frame`.
    ///
    /// Segments are scanned newest-first; within a segment the probe chain
    /// is followed to the end so the largest qualifying frame wins.
    pub fn lookup(&self, page: u32, min_frame: u32, max_frame: u32) -> Result<Option<u32>> {
        if max_frame == 0 {
            return Ok(None);
        }
        let last_segment = locate(max_frame).segment;
        for segment in (0..=last_segment).rev() {
            let Some(seg) = self.segments.get(segment) else {
                return Err(PetraError::Protocol {
                    detail: format!("shm segment {segment} not mapped"),
                });
            };
            let first = segment_first_frame(segment);
            if first > max_frame {
                continue;
            }
            let guard = seg.lock();
            let mut best: Option<u32> = None;
            let mut key = (page.wrapping_mul(HASH_MULTIPLIER)) & HASH_MASK;
            loop {
                let entry = get_ne_u16(&guard, HASH_TABLE_OFFSET + key as usize * 2);
                if entry == 0 {
                    break;
                }
                let entry = entry as usize;
                let frame = first + (entry as u32) - 1;
                if frame >= min_frame
                    && frame <= max_frame
                    && get_ne_u32(&guard, entry_offset(segment, entry)) == page
                    && best.is_none_or(|b| frame > b)
                {
                    best = Some(frame);
                }
                key = (key + 1) & HASH_MASK;
            }
            drop(guard);
            if best.is_some() {
                return Ok(best);
            }
            // No hit in this segment; older segments only hold older
            // frames, keep scanning.
        }
        Ok(None)
    }

    /// Remove index entries for frames above `new_mx` (uncommitted frames
    /// being rolled back, or a full WAL reset when `new_mx` is 0).
    pub fn truncate(&self, new_mx: u32) -> Result<()> {
        for (segment, seg) in self.segments.iter().enumerate() {
            let first = segment_first_frame(segment);
            let cap = segment_capacity(segment);
            #[allow(clippy::cast_possible_truncation)]
            let last = first + cap as u32 - 1;
            if last <= new_mx {
                continue;
            }
            let mut guard = seg.lock();
            // Zero page-array entries past the cut.
            let keep = new_mx.saturating_sub(first - 1).min(cap as u32) as usize;
            let base = entry_offset(segment, 1);
            guard[base + keep * 4..base + cap * 4].fill(0);
            // Drop hash slots pointing past the cut.
            for slot in 0..HASH_SLOTS {
                let off = HASH_TABLE_OFFSET + slot * 2;
                let entry = get_ne_u16(&guard, off) as usize;
                if entry > keep {
                    put_ne_u16(&mut guard, off, 0);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_index(segments: usize) -> WalIndex {
        let mut index = WalIndex::new();
        for _ in 0..segments {
            index.push_segment(ShmRegion::new(SEGMENT_BYTES)).unwrap();
        }
        index
    }

    #[test]
    fn frame_locations() {
        assert_eq!(locate(1), FrameSlot { segment: 0, entry: 1 });
        assert_eq!(
            locate(FIRST_SEGMENT_ENTRIES as u32),
            FrameSlot {
                segment: 0,
                entry: FIRST_SEGMENT_ENTRIES
            }
        );
        assert_eq!(
            locate(FIRST_SEGMENT_ENTRIES as u32 + 1),
            FrameSlot { segment: 1, entry: 1 }
        );
        assert_eq!(
            locate((FIRST_SEGMENT_ENTRIES + PAGE_ENTRIES) as u32 + 1),
            FrameSlot { segment: 2, entry: 1 }
        );
    }

    #[test]
    fn header_roundtrip_through_shm() {
        let index = mapped_index(1);
        let hdr = WalIndexHdr {
            change_counter: 3,
            is_init: true,
            big_end_cksum: false,
            page_size: 4096,
            mx_frame: 17,
            n_page: 9,
            frame_cksum: WalChecksum { s1: 1, s2: 2 },
            salt1: 0xAA,
            salt2: 0xBB,
        };
        index.write_header(&hdr).unwrap();
        assert_eq!(index.read_header().unwrap(), hdr);
    }

    #[test]
    fn torn_header_is_a_protocol_error() {
        let index = mapped_index(1);
        let mut hdr = WalIndexHdr {
            is_init: true,
            page_size: 4096,
            ..WalIndexHdr::default()
        };
        index.write_header(&hdr).unwrap();
        // Clobber only the first copy, as a torn write would.
        hdr.mx_frame = 99;
        let bytes = hdr.encode();
        index.segments[0].write_at(0, &bytes);
        assert!(matches!(
            index.read_header(),
            Err(PetraError::Protocol { .. })
        ));
    }

    #[test]
    fn ckpt_info_roundtrip() {
        let index = mapped_index(1);
        let mut info = WalCkptInfo::default();
        info.n_backfill = 12;
        info.read_marks[2] = 40;
        info.n_backfill_attempted = 14;
        index.write_ckpt_info(&info).unwrap();
        assert_eq!(index.read_ckpt_info().unwrap(), info);

        index.set_read_mark(1, 55).unwrap();
        assert_eq!(index.read_ckpt_info().unwrap().read_marks[1], 55);
    }

    #[test]
    fn lookup_finds_newest_frame() {
        let index = mapped_index(1);
        index.append(1, 5).unwrap();
        index.append(2, 7).unwrap();
        index.append(3, 5).unwrap();

        assert_eq!(index.lookup(5, 1, 3).unwrap(), Some(3));
        assert_eq!(index.lookup(7, 1, 3).unwrap(), Some(2));
        assert_eq!(index.lookup(9, 1, 3).unwrap(), None);
    }

    #[test]
    fn lookup_respects_snapshot_bounds() {
        let index = mapped_index(1);
        index.append(1, 5).unwrap();
        index.append(2, 5).unwrap();
        index.append(3, 5).unwrap();

        // An older reader whose snapshot ends at frame 1 must not see the
        // later versions.
        assert_eq!(index.lookup(5, 1, 1).unwrap(), Some(1));
        // A reader whose min_frame excludes backfilled frames skips them.
        assert_eq!(index.lookup(5, 3, 3).unwrap(), Some(3));
        assert_eq!(index.lookup(5, 4, 3).unwrap(), None);
    }

    #[test]
    fn colliding_pages_both_found() {
        let index = mapped_index(1);
        // 383-multiplier collisions: any two pages 8192 apart in hash space.
        let p1 = 10u32;
        let p2 = p1 + HASH_SLOTS as u32 * HASH_MULTIPLIER; // same slot
        index.append(1, p1).unwrap();
        index.append(2, p2).unwrap();
        assert_eq!(index.lookup(p1, 1, 2).unwrap(), Some(1));
        assert_eq!(index.lookup(p2, 1, 2).unwrap(), Some(2));
    }

    #[test]
    fn truncate_drops_rolled_back_frames() {
        let index = mapped_index(1);
        index.append(1, 5).unwrap();
        index.append(2, 7).unwrap();
        index.append(3, 5).unwrap();

        index.truncate(1).unwrap();
        assert_eq!(index.lookup(5, 1, 3).unwrap(), Some(1));
        assert_eq!(index.lookup(7, 1, 3).unwrap(), None);
    }

    #[test]
    fn frames_spanning_segments() {
        let index = mapped_index(2);
        let last_in_first = FIRST_SEGMENT_ENTRIES as u32;
        for frame in 1..=last_in_first {
            index.append(frame, frame % 97 + 1).unwrap();
        }
        index.append(last_in_first + 1, 5000).unwrap();
        index.append(last_in_first + 2, 5000).unwrap();

        assert_eq!(
            index.lookup(5000, 1, last_in_first + 2).unwrap(),
            Some(last_in_first + 2)
        );
        // A page only present in the first segment is still reachable;
        // the newest of its frames wins.
        let newest_page1_frame = (last_in_first / 97) * 97;
        assert_eq!(
            index.lookup(1, 1, last_in_first + 2).unwrap(),
            Some(newest_page1_frame)
        );
    }
}
