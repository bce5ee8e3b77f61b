//! WAL file format: header and frame codecs plus the cumulative checksum.
//!
//! Layouts:
//! ```text
//! WAL header (32 bytes)            Frame header (24 bytes)
//!   0   4  magic                     0   4  page number
//!   4   4  format version            4   4  db size after commit, or 0
//!   8   4  page size                 8   4  salt-1
//!  12   4  checkpoint sequence      12   4  salt-2
//!  16   4  salt-1                   16   4  checksum-1
//!  20   4  salt-2                   20   4  checksum-2
//!  24   4  checksum-1
//!  28   4  checksum-2
//! ```
//! The checksum is a running pair chained from the WAL header through every
//! frame, so one torn write invalidates everything after it.

use petra_error::{PetraError, Result};
use petra_types::encoding::{get_u32, put_u32};

/// Size of the WAL file header.
pub const WAL_HEADER_SIZE: usize = 32;
/// Size of the per-frame header.
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

/// Magic selecting little-endian checksum byte order.
pub const WAL_MAGIC_LE: u32 = 0x377F_0682;
/// Magic selecting big-endian checksum byte order.
pub const WAL_MAGIC_BE: u32 = 0x377F_0683;
/// WAL format version.
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

/// Cumulative checksum pair.
///
/// Updated over 8-byte chunks as `s1 += w1 + s2; s2 += w2 + s1` with
/// wrapping arithmetic, where `w1`/`w2` are the chunk's two words in the
/// byte order selected by the WAL magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalChecksum {
    pub s1: u32,
    pub s2: u32,
}

impl WalChecksum {
    /// Extend the running checksum over `data`, whose length must be a
    /// multiple of 8.
    #[must_use]
    pub fn advance(mut self, data: &[u8], big_endian: bool) -> Self {
        debug_assert_eq!(data.len() % 8, 0);
        for chunk in data.chunks_exact(8) {
            let (w1, w2) = if big_endian {
                (
                    u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                    u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                )
            } else {
                (
                    u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                    u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                )
            };
            self.s1 = self.s1.wrapping_add(w1).wrapping_add(self.s2);
            self.s2 = self.s2.wrapping_add(w2).wrapping_add(self.s1);
        }
        self
    }
}

/// Salt pair copied from the WAL header into every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalSalts {
    pub salt1: u32,
    pub salt2: u32,
}

impl WalSalts {
    /// Successor salts used when the WAL is restarted: salt1 is treated as
    /// a counter, salt2 is replaced by the caller with fresh randomness.
    #[must_use]
    pub fn bump_salt1(self) -> u32 {
        self.salt1.wrapping_add(1)
    }
}

/// Decoded 32-byte WAL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: u32,
    pub format_version: u32,
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salts: WalSalts,
    pub checksum: WalChecksum,
}

impl WalHeader {
    /// Whether frame checksums use big-endian word order.
    #[must_use]
    pub const fn big_endian_checksum(&self) -> bool {
        self.magic == WAL_MAGIC_BE
    }

    /// Decode and validate a WAL header, including its self-checksum over
    /// bytes 0..24.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < WAL_HEADER_SIZE {
            return Err(PetraError::WalCorrupt {
                detail: format!("header truncated: {} bytes", buf.len()),
            });
        }
        let magic = get_u32(buf, 0);
        if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
            return Err(PetraError::WalCorrupt {
                detail: format!("bad magic {magic:#010x}"),
            });
        }
        let format_version = get_u32(buf, 4);
        if format_version != WAL_FORMAT_VERSION {
            return Err(PetraError::WalCorrupt {
                detail: format!("unsupported format version {format_version}"),
            });
        }
        let hdr = Self {
            magic,
            format_version,
            page_size: get_u32(buf, 8),
            checkpoint_seq: get_u32(buf, 12),
            salts: WalSalts {
                salt1: get_u32(buf, 16),
                salt2: get_u32(buf, 20),
            },
            checksum: WalChecksum {
                s1: get_u32(buf, 24),
                s2: get_u32(buf, 28),
            },
        };
        let computed = WalChecksum::default().advance(&buf[..24], hdr.big_endian_checksum());
        if computed != hdr.checksum {
            return Err(PetraError::WalCorrupt {
                detail: "header checksum mismatch".to_owned(),
            });
        }
        Ok(hdr)
    }

    /// Encode this header, computing the self-checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        put_u32(&mut buf, 0, self.magic);
        put_u32(&mut buf, 4, self.format_version);
        put_u32(&mut buf, 8, self.page_size);
        put_u32(&mut buf, 12, self.checkpoint_seq);
        put_u32(&mut buf, 16, self.salts.salt1);
        put_u32(&mut buf, 20, self.salts.salt2);
        let cksum = WalChecksum::default().advance(&buf[..24], self.big_endian_checksum());
        put_u32(&mut buf, 24, cksum.s1);
        put_u32(&mut buf, 28, cksum.s2);
        buf
    }
}

/// Decoded 24-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFrameHeader {
    /// Database page this frame carries.
    pub page_number: u32,
    /// For commit frames, the database size in pages after the commit;
    /// zero otherwise.
    pub db_size: u32,
    pub salts: WalSalts,
    pub checksum: WalChecksum,
}

impl WalFrameHeader {
    /// Whether this frame ends a transaction.
    #[must_use]
    pub const fn is_commit(&self) -> bool {
        self.db_size > 0
    }

    /// Decode a frame header without validating the checksum chain; use
    /// [`compute_frame_checksum`] for that.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < WAL_FRAME_HEADER_SIZE {
            return Err(PetraError::WalCorrupt {
                detail: format!("frame header truncated: {} bytes", buf.len()),
            });
        }
        Ok(Self {
            page_number: get_u32(buf, 0),
            db_size: get_u32(buf, 4),
            salts: WalSalts {
                salt1: get_u32(buf, 8),
                salt2: get_u32(buf, 12),
            },
            checksum: WalChecksum {
                s1: get_u32(buf, 16),
                s2: get_u32(buf, 20),
            },
        })
    }

    /// Encode this frame header.
    #[must_use]
    pub fn encode(&self) -> [u8; WAL_FRAME_HEADER_SIZE] {
        let mut buf = [0u8; WAL_FRAME_HEADER_SIZE];
        put_u32(&mut buf, 0, self.page_number);
        put_u32(&mut buf, 4, self.db_size);
        put_u32(&mut buf, 8, self.salts.salt1);
        put_u32(&mut buf, 12, self.salts.salt2);
        put_u32(&mut buf, 16, self.checksum.s1);
        put_u32(&mut buf, 20, self.checksum.s2);
        buf
    }
}

/// Extend `prior` over one frame: the first 8 bytes of the frame header
/// (page number and db size) followed by the page content.
#[must_use]
pub fn compute_frame_checksum(
    prior: WalChecksum,
    header_prefix: &[u8; 8],
    page: &[u8],
    big_endian: bool,
) -> WalChecksum {
    prior.advance(header_prefix, big_endian).advance(page, big_endian)
}

/// Byte offset of frame `index` (1-based) in the WAL file.
#[must_use]
pub fn frame_offset(index: u32, page_size: u32) -> u64 {
    let frame_size = WAL_FRAME_HEADER_SIZE as u64 + u64::from(page_size);
    WAL_HEADER_SIZE as u64 + u64::from(index - 1) * frame_size
}
