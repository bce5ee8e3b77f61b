//! The 100-byte database file header.
//!
//! Page 1 of every database file begins with this header. The pager cares
//! about a handful of fields: the page size, the reserved-bytes count, the
//! change counter at byte 24 (bumped on every rollback-mode commit so other
//! connections notice the file changed under them), and the page count at
//! byte 28.

use petra_error::{PetraError, Result};

use crate::encoding::{get_i32, get_u16, get_u32, put_i32, put_u16, put_u32};
use crate::PageSize;

/// The magic string at the start of every database file.
pub const DATABASE_HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the database file header in bytes.
pub const DATABASE_HEADER_SIZE: usize = 100;

/// Byte offset of the change counter within page 1.
pub const CHANGE_COUNTER_OFFSET: usize = 24;

/// Version number stamped into headers this library creates.
const CREATOR_VERSION_NUMBER: u32 = 3_046_000;

/// Parsed content of the first 100 bytes of a database file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    /// Page size (offset 16; the raw value 1 encodes 65536).
    pub page_size: PageSize,
    /// File format write version (1 = rollback journal, 2 = WAL).
    pub write_version: u8,
    /// File format read version (1 = rollback journal, 2 = WAL).
    pub read_version: u8,
    /// Reserved bytes at the end of each page (offset 20).
    pub reserved_per_page: u8,
    /// File change counter (offset 24).
    pub change_counter: u32,
    /// Database size in pages (offset 28).
    pub page_count: u32,
    /// First freelist trunk page, or 0 (offset 32).
    pub freelist_trunk: u32,
    /// Number of freelist pages (offset 36).
    pub freelist_count: u32,
    /// Schema cookie (offset 40).
    pub schema_cookie: u32,
    /// Schema format number (offset 44).
    pub schema_format: u32,
    /// Suggested cache size (offset 48).
    pub default_cache_size: i32,
    /// Text encoding: 1 = UTF-8, 2 = UTF-16le, 3 = UTF-16be (offset 56).
    pub text_encoding: u32,
    /// `PRAGMA user_version` slot (offset 60).
    pub user_version: u32,
    /// `PRAGMA application_id` slot (offset 68).
    pub application_id: u32,
    /// Change counter value at which `page_count` was last known valid
    /// (offset 92).
    pub version_valid_for: u32,
    /// Library version number that last wrote the file (offset 96).
    pub library_version: u32,
}

impl Default for DatabaseHeader {
    fn default() -> Self {
        Self {
            page_size: PageSize::DEFAULT,
            write_version: 1,
            read_version: 1,
            reserved_per_page: 0,
            change_counter: 0,
            page_count: 0,
            freelist_trunk: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            default_cache_size: -2000,
            text_encoding: 1,
            user_version: 0,
            application_id: 0,
            version_valid_for: 0,
            library_version: CREATOR_VERSION_NUMBER,
        }
    }
}

impl DatabaseHeader {
    /// Parse and validate a 100-byte header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DATABASE_HEADER_SIZE {
            return Err(PetraError::ShortRead {
                expected: DATABASE_HEADER_SIZE,
                actual: buf.len(),
            });
        }
        if &buf[..16] != DATABASE_HEADER_MAGIC {
            return Err(PetraError::DatabaseCorrupt {
                detail: "bad header magic".to_owned(),
            });
        }

        let raw_page_size = get_u16(buf, 16);
        let page_size_u32 = if raw_page_size == 1 {
            65_536
        } else {
            u32::from(raw_page_size)
        };
        let page_size = PageSize::new(page_size_u32).ok_or_else(|| PetraError::DatabaseCorrupt {
            detail: format!("invalid page size {raw_page_size}"),
        })?;

        let reserved_per_page = buf[20];
        if page_size.usable(reserved_per_page) < 480 {
            return Err(PetraError::DatabaseCorrupt {
                detail: format!(
                    "usable page size below 480 (page_size={page_size}, reserved={reserved_per_page})"
                ),
            });
        }

        // Payload fractions at 21..24 have exactly one legal value.
        if (buf[21], buf[22], buf[23]) != (64, 32, 32) {
            return Err(PetraError::DatabaseCorrupt {
                detail: "invalid payload fractions".to_owned(),
            });
        }

        Ok(Self {
            page_size,
            write_version: buf[18],
            read_version: buf[19],
            reserved_per_page,
            change_counter: get_u32(buf, CHANGE_COUNTER_OFFSET),
            page_count: get_u32(buf, 28),
            freelist_trunk: get_u32(buf, 32),
            freelist_count: get_u32(buf, 36),
            schema_cookie: get_u32(buf, 40),
            schema_format: get_u32(buf, 44),
            default_cache_size: get_i32(buf, 48),
            text_encoding: get_u32(buf, 56),
            user_version: get_u32(buf, 60),
            application_id: get_u32(buf, 68),
            version_valid_for: get_u32(buf, 92),
            library_version: get_u32(buf, 96),
        })
    }

    /// Serialize this header into the first 100 bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= DATABASE_HEADER_SIZE);
        out[..DATABASE_HEADER_SIZE].fill(0);
        out[..16].copy_from_slice(DATABASE_HEADER_MAGIC);

        let raw_page_size = if self.page_size.get() == 65_536 {
            1u16
        } else {
            self.page_size.get() as u16
        };
        put_u16(out, 16, raw_page_size);
        out[18] = self.write_version;
        out[19] = self.read_version;
        out[20] = self.reserved_per_page;
        out[21] = 64;
        out[22] = 32;
        out[23] = 32;
        put_u32(out, CHANGE_COUNTER_OFFSET, self.change_counter);
        put_u32(out, 28, self.page_count);
        put_u32(out, 32, self.freelist_trunk);
        put_u32(out, 36, self.freelist_count);
        put_u32(out, 40, self.schema_cookie);
        put_u32(out, 44, self.schema_format);
        put_i32(out, 48, self.default_cache_size);
        put_u32(out, 56, self.text_encoding);
        put_u32(out, 60, self.user_version);
        put_u32(out, 68, self.application_id);
        // 72..92 reserved, always zero.
        put_u32(out, 92, self.version_valid_for);
        put_u32(out, 96, self.library_version);
    }

    /// Whether the header's `page_count` field may be stale.
    ///
    /// The two counters diverge when a legacy writer updated the file
    /// without refreshing the size field; the real size must then come from
    /// the file length.
    #[must_use]
    pub const fn page_count_is_stale(&self) -> bool {
        self.version_valid_for != self.change_counter
    }
}
