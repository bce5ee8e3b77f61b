//! Read-only decoding of b-tree page headers.
//!
//! The pager and WAL treat page contents as opaque; this module exists for
//! the consumers that do look inside, chiefly the diagnostic page walker.
//! A b-tree page starts with an 8-byte header (12 on interior pages, which
//! append a right-most child pointer), followed by the cell pointer array.
//! On page 1 the b-tree header begins after the 100-byte file header.

use petra_error::{PetraError, Result};

use crate::encoding::{get_u16, get_u32};
use crate::{DATABASE_HEADER_SIZE, PageNumber, PageSize};

/// B-tree page types, as encoded in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BTreePageType {
    /// Interior index page.
    InteriorIndex = 0x02,
    /// Interior table page.
    InteriorTable = 0x05,
    /// Leaf index page.
    LeafIndex = 0x0A,
    /// Leaf table page.
    LeafTable = 0x0D,
}

impl BTreePageType {
    /// Parse the page-type byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x02 => Some(Self::InteriorIndex),
            0x05 => Some(Self::InteriorTable),
            0x0A => Some(Self::LeafIndex),
            0x0D => Some(Self::LeafTable),
            _ => None,
        }
    }

    /// Whether this page has no children.
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        matches!(self, Self::LeafIndex | Self::LeafTable)
    }

    /// Whether this page has children.
    #[must_use]
    pub const fn is_interior(self) -> bool {
        !self.is_leaf()
    }

    /// Whether this page belongs to a rowid table b-tree.
    #[must_use]
    pub const fn is_table(self) -> bool {
        matches!(self, Self::InteriorTable | Self::LeafTable)
    }

    /// Short name used by the diagnostic walker's output rows.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        if self.is_leaf() { "leaf" } else { "internal" }
    }
}

/// A freeblock inside a b-tree page's cell content area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Freeblock {
    /// Byte offset of this freeblock within the page.
    pub offset: u16,
    /// Offset of the next freeblock, or 0.
    pub next: u16,
    /// Total size of this freeblock in bytes (at least 4).
    pub size: u16,
}

/// Parsed b-tree page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreePageHeader {
    /// Where the header starts within the page: 0, or 100 on page 1.
    pub header_offset: usize,
    /// Page type byte.
    pub page_type: BTreePageType,
    /// First freeblock offset, or 0.
    pub first_freeblock: u16,
    /// Number of cells on the page.
    pub cell_count: u16,
    /// Start of the cell content area; the raw value 0 decodes to 65536.
    pub cell_content_start: u32,
    /// Fragmented free bytes within the cell content area.
    pub fragmented_free_bytes: u8,
    /// Right-most child, present only on interior pages.
    pub right_most_child: Option<PageNumber>,
}

impl BTreePageHeader {
    /// Header size in bytes: 8 for leaf pages, 12 for interior.
    #[must_use]
    pub const fn header_size(&self) -> usize {
        if self.page_type.is_leaf() { 8 } else { 12 }
    }

    /// Parse the header of a raw page buffer.
    pub fn decode(page: &[u8], page_size: PageSize, is_page1: bool) -> Result<Self> {
        if page.len() != page_size.as_usize() {
            return Err(PetraError::ShortRead {
                expected: page_size.as_usize(),
                actual: page.len(),
            });
        }

        let off = if is_page1 { DATABASE_HEADER_SIZE } else { 0 };
        let type_byte = page[off];
        let page_type =
            BTreePageType::from_byte(type_byte).ok_or_else(|| PetraError::DatabaseCorrupt {
                detail: format!("unknown b-tree page type {type_byte:#04x}"),
            })?;

        let raw_content_start = get_u16(page, off + 5);
        let cell_content_start = if raw_content_start == 0 {
            65_536
        } else {
            u32::from(raw_content_start)
        };
        if cell_content_start > page_size.get() {
            return Err(PetraError::DatabaseCorrupt {
                detail: format!("cell content start {cell_content_start} past end of page"),
            });
        }

        let right_most_child = if page_type.is_interior() {
            let raw = get_u32(page, off + 8);
            Some(
                PageNumber::new(raw).ok_or_else(|| PetraError::DatabaseCorrupt {
                    detail: "interior page with zero right-most child".to_owned(),
                })?,
            )
        } else {
            None
        };

        let hdr = Self {
            header_offset: off,
            page_type,
            first_freeblock: get_u16(page, off + 1),
            cell_count: get_u16(page, off + 3),
            cell_content_start,
            fragmented_free_bytes: page[off + 7],
            right_most_child,
        };

        let ptr_end = off + hdr.header_size() + usize::from(hdr.cell_count) * 2;
        if ptr_end > page_size.as_usize() {
            return Err(PetraError::DatabaseCorrupt {
                detail: format!("cell pointer array past end of page ({ptr_end})"),
            });
        }
        Ok(hdr)
    }

    /// The cell pointer array: one byte offset per cell.
    pub fn cell_pointers(&self, page: &[u8]) -> Result<Vec<u16>> {
        let base = self.header_offset + self.header_size();
        let mut out = Vec::with_capacity(usize::from(self.cell_count));
        for i in 0..usize::from(self.cell_count) {
            let ptr = get_u16(page, base + i * 2);
            if usize::from(ptr) >= page.len() {
                return Err(PetraError::DatabaseCorrupt {
                    detail: format!("cell pointer {i} out of range ({ptr})"),
                });
            }
            out.push(ptr);
        }
        Ok(out)
    }

    /// Walk the freeblock chain, rejecting loops and out-of-range links.
    pub fn freeblocks(&self, page: &[u8]) -> Result<Vec<Freeblock>> {
        let mut blocks = Vec::new();
        let mut offset = self.first_freeblock;
        while offset != 0 {
            let off = usize::from(offset);
            if off + 4 > page.len() {
                return Err(PetraError::DatabaseCorrupt {
                    detail: format!("freeblock at {offset} out of range"),
                });
            }
            let next = get_u16(page, off);
            let size = get_u16(page, off + 2);
            if size < 4 || off + usize::from(size) > page.len() {
                return Err(PetraError::DatabaseCorrupt {
                    detail: format!("freeblock at {offset} with invalid size {size}"),
                });
            }
            // Forward-only chain ordering rules out loops.
            if next != 0 && next <= offset {
                return Err(PetraError::DatabaseCorrupt {
                    detail: format!("freeblock chain not ascending at {offset}"),
                });
            }
            blocks.push(Freeblock { offset, next, size });
            offset = next;
        }
        Ok(blocks)
    }
}
