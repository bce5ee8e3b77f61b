//! Rollback-journal on-disk format.
//!
//! A journal is one or more segments, each starting with a sector-aligned
//! header followed by pre-image records:
//! ```text
//! header (padded to sector size)      record
//!   0   8  magic                        0        4         page number
//!   8   4  record count (or -1)         4        pagesize  page content
//!  12   4  checksum seed                4+psize  4         checksum
//!  16   4  original db page count
//!  20   4  sector size
//!  24   4  page size
//! ```
//! The record checksum is deliberately cheap: the seed plus every 200th
//! byte counted back from the end of the page. A record count of
//! 0xFFFFFFFF means "derive the count from the file size" and is what a
//! crash leaves behind before the true count is patched in during commit.

use std::path::PathBuf;

use petra_error::{PetraError, Result};
use petra_types::encoding::{get_u32, put_u32};

/// Journal magic.
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];

/// Bytes of meaningful header before sector padding.
pub const JOURNAL_HEADER_SIZE: usize = 28;

/// Record-count sentinel: count records from the file size instead.
pub const RECORD_COUNT_FROM_SIZE: u32 = 0xFFFF_FFFF;

/// Decoded journal segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// Records in this segment, or [`RECORD_COUNT_FROM_SIZE`].
    pub record_count: u32,
    /// Random seed for record checksums.
    pub checksum_seed: u32,
    /// Database size in pages before the transaction began.
    pub orig_page_count: u32,
    /// Sector size the header was padded to.
    pub sector_size: u32,
    pub page_size: u32,
}

impl JournalHeader {
    /// Encode the header padded out to `sector_size` bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; (self.sector_size as usize).max(JOURNAL_HEADER_SIZE)];
        buf[..8].copy_from_slice(&JOURNAL_MAGIC);
        put_u32(&mut buf, 8, self.record_count);
        put_u32(&mut buf, 12, self.checksum_seed);
        put_u32(&mut buf, 16, self.orig_page_count);
        put_u32(&mut buf, 20, self.sector_size);
        put_u32(&mut buf, 24, self.page_size);
        buf
    }

    /// Decode a header; a bad magic is reported as journal corruption,
    /// which replay treats as end-of-journal rather than failure.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < JOURNAL_HEADER_SIZE || buf[..8] != JOURNAL_MAGIC {
            return Err(PetraError::JournalCorrupt {
                detail: "bad journal magic".to_owned(),
            });
        }
        Ok(Self {
            record_count: get_u32(buf, 8),
            checksum_seed: get_u32(buf, 12),
            orig_page_count: get_u32(buf, 16),
            sector_size: get_u32(buf, 20),
            page_size: get_u32(buf, 24),
        })
    }

    /// Size in bytes of one record under this header.
    #[must_use]
    pub fn record_size(&self) -> u64 {
        8 + u64::from(self.page_size)
    }
}

/// The cheap per-record checksum: seed plus every 200th byte counted back
/// from the end of the page image.
#[must_use]
pub fn record_checksum(seed: u32, page: &[u8]) -> u32 {
    let mut cksum = seed;
    let mut i = page.len() as isize - 200;
    while i > 0 {
        #[allow(clippy::cast_sign_loss)]
        {
            cksum = cksum.wrapping_add(u32::from(page[i as usize]));
        }
        i -= 200;
    }
    cksum
}

/// Encode one pre-image record.
#[must_use]
pub fn encode_record(page_number: u32, content: &[u8], seed: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + content.len()];
    put_u32(&mut buf, 0, page_number);
    buf[4..4 + content.len()].copy_from_slice(content);
    let cksum = record_checksum(seed, content);
    put_u32(&mut buf, 4 + content.len(), cksum);
    buf
}

/// A record parsed back out of the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub page_number: u32,
    pub content: Vec<u8>,
}

/// Decode and verify one record. A checksum mismatch is corruption, which
/// replay treats as the end of the valid prefix.
pub fn decode_record(buf: &[u8], page_size: usize, seed: u32) -> Result<JournalRecord> {
    if buf.len() < 8 + page_size {
        return Err(PetraError::JournalCorrupt {
            detail: "record truncated".to_owned(),
        });
    }
    let page_number = get_u32(buf, 0);
    if page_number == 0 {
        return Err(PetraError::JournalCorrupt {
            detail: "record page number zero".to_owned(),
        });
    }
    let content = &buf[4..4 + page_size];
    let stored = get_u32(buf, 4 + page_size);
    if record_checksum(seed, content) != stored {
        return Err(PetraError::JournalCorrupt {
            detail: format!("record checksum mismatch for page {page_number}"),
        });
    }
    Ok(JournalRecord {
        page_number,
        content: content.to_vec(),
    })
}

/// The page-number-like tag marking a super-journal trailer, derived from
/// the lock-byte page the way the journal format defines it.
#[must_use]
pub fn super_journal_marker(page_size: u32) -> u32 {
    0x4000_0000 / page_size + 1
}

/// Encode the trailing super-journal block appended after the last record
/// of a multi-database commit:
/// `{marker (4), name bytes, name length (4), name checksum (4), magic (8)}`.
#[must_use]
pub fn encode_super_journal(name: &str, page_size: u32) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut buf = Vec::with_capacity(4 + bytes.len() + 16);
    let mut word = [0u8; 4];
    put_u32(&mut word, 0, super_journal_marker(page_size));
    buf.extend_from_slice(&word);
    buf.extend_from_slice(bytes);
    #[allow(clippy::cast_possible_truncation)]
    put_u32(&mut word, 0, bytes.len() as u32);
    buf.extend_from_slice(&word);
    let cksum = bytes.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
    put_u32(&mut word, 0, cksum);
    buf.extend_from_slice(&word);
    buf.extend_from_slice(&JOURNAL_MAGIC);
    buf
}

/// Extract the super-journal path from the tail of a journal image, if a
/// valid trailer is present.
#[must_use]
pub fn decode_super_journal(journal: &[u8]) -> Option<PathBuf> {
    if journal.len() < 16 + 4 || journal[journal.len() - 8..] != JOURNAL_MAGIC {
        return None;
    }
    let len_offset = journal.len() - 16;
    let name_len = get_u32(journal, len_offset) as usize;
    let cksum = get_u32(journal, len_offset + 4);
    let name_start = len_offset.checked_sub(name_len)?;
    if name_start < 4 {
        return None;
    }
    let name = &journal[name_start..len_offset];
    let computed = name.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
    if computed != cksum {
        return None;
    }
    std::str::from_utf8(name).ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: u32 = 0x1234_5678;

    #[test]
    fn header_roundtrip_with_padding() {
        let hdr = JournalHeader {
            record_count: 3,
            checksum_seed: SEED,
            orig_page_count: 10,
            sector_size: 512,
            page_size: 4096,
        };
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), 512);
        assert_eq!(JournalHeader::decode(&bytes).unwrap(), hdr);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = JournalHeader {
            record_count: 0,
            checksum_seed: 0,
            orig_page_count: 0,
            sector_size: 512,
            page_size: 4096,
        }
        .encode();
        bytes[0] = 0;
        assert!(matches!(
            JournalHeader::decode(&bytes),
            Err(PetraError::JournalCorrupt { .. })
        ));
    }

    #[test]
    fn checksum_samples_every_200th_byte() {
        let mut page = vec![0u8; 1000];
        // Sampled offsets for a 1000-byte page: 800, 600, 400, 200.
        for &i in &[800usize, 600, 400, 200] {
            page[i] = 1;
        }
        assert_eq!(record_checksum(0, &page), 4);
        // Non-sampled bytes do not contribute.
        page[801] = 0xFF;
        assert_eq!(record_checksum(0, &page), 4);
        assert_eq!(record_checksum(7, &page), 11);
    }

    #[test]
    fn record_roundtrip() {
        let content = vec![0xAB; 512];
        let encoded = encode_record(9, &content, SEED);
        let record = decode_record(&encoded, 512, SEED).unwrap();
        assert_eq!(record.page_number, 9);
        assert_eq!(record.content, content);
    }

    #[test]
    fn corrupt_record_is_detected() {
        let content = vec![0xAB; 512];
        let mut encoded = encode_record(9, &content, SEED);
        encoded[4 + 312] ^= 0x01;
        assert!(decode_record(&encoded, 512, SEED).is_err());
        // A wrong seed also fails the record.
        let fresh = encode_record(9, &content, SEED);
        assert!(decode_record(&fresh, 512, SEED + 1).is_err());
    }

    #[test]
    fn super_journal_roundtrip() {
        let trailer = encode_super_journal("/tmp/super.jrnl", 4096);
        let mut journal = vec![0u8; 700];
        journal.extend_from_slice(&trailer);
        assert_eq!(
            decode_super_journal(&journal),
            Some(PathBuf::from("/tmp/super.jrnl"))
        );
    }

    #[test]
    fn super_journal_rejects_bad_checksum() {
        let mut trailer = encode_super_journal("/tmp/super.jrnl", 4096);
        let name_pos = 4 + 3;
        trailer[name_pos] ^= 0xFF;
        let mut journal = vec![0u8; 100];
        journal.extend_from_slice(&trailer);
        assert_eq!(decode_super_journal(&journal), None);
    }

    #[test]
    fn plain_journal_has_no_super_trailer() {
        let journal = vec![0u8; 300];
        assert_eq!(decode_super_journal(&journal), None);
    }
}
