//! Diagnostic b-tree page walker.
//!
//! Produces one row per page of a b-tree, dbstat-style: page type, cell
//! count, payload bytes stored locally, unused bytes, and the position of
//! the page in the file. Overflow chains get a row per overflow page. The
//! walker reads through the pager, so it sees whatever snapshot the current
//! read transaction sees.

use petra_error::{PetraError, Result};
use petra_types::btree::{BTreePageHeader, BTreePageType};
use petra_types::cx::Cx;
use petra_types::encoding::{get_u32, get_varint};
use petra_vfs::Vfs;

use crate::bitvec::PageBitvec;
use crate::pager::Pager;

/// One output row of the walker: the statistics of a single page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStatRow {
    /// Name of the b-tree being walked, as given by the caller.
    pub name: String,
    /// Position of the page in the tree, `/` for the root and one
    /// three-hex-digit segment per descent (`+nnnnnn` for overflow pages).
    pub path: String,
    pub pageno: u32,
    /// `"internal"`, `"leaf"` or `"overflow"`.
    pub pagetype: &'static str,
    /// Cells on the page; 0 for overflow pages.
    pub ncell: u32,
    /// Payload bytes stored on this page.
    pub payload: u64,
    /// Unused bytes: the gap between the cell pointer array and the cell
    /// content area, plus fragments and freeblocks.
    pub unused: u64,
    /// Largest total cell payload, counting overflow.
    pub mx_payload: u64,
    /// Byte offset of the page within the database file.
    pub pgoffset: u64,
    pub pgsize: u32,
}

/// Aggregate totals over all pages of one b-tree, the walker's summary
/// mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeStat {
    pub name: String,
    /// Pages in the tree, overflow pages included.
    pub pages: u32,
    pub ncell: u64,
    pub payload: u64,
    pub unused: u64,
    pub mx_payload: u64,
    /// Total bytes occupied by the tree's pages.
    pub bytes: u64,
}

/// Collapse walker rows into one aggregate per b-tree name, keeping the
/// order in which names first appear.
#[must_use]
pub fn aggregate_stats(rows: &[PageStatRow]) -> Vec<BTreeStat> {
    let mut stats: Vec<BTreeStat> = Vec::new();
    for row in rows {
        let idx = match stats.iter().position(|s| s.name == row.name) {
            Some(idx) => idx,
            None => {
                stats.push(BTreeStat {
                    name: row.name.clone(),
                    pages: 0,
                    ncell: 0,
                    payload: 0,
                    unused: 0,
                    mx_payload: 0,
                    bytes: 0,
                });
                stats.len() - 1
            }
        };
        let stat = &mut stats[idx];
        stat.pages += 1;
        stat.ncell += u64::from(row.ncell);
        stat.payload += row.payload;
        stat.unused += row.unused;
        stat.mx_payload = stat.mx_payload.max(row.mx_payload);
        stat.bytes += u64::from(row.pgsize);
    }
    stats
}

/// The largest payload stored entirely on a page of this type.
fn max_local(page_type: BTreePageType, usable: u32) -> u32 {
    if page_type == BTreePageType::LeafTable {
        usable - 35
    } else {
        (usable - 12) * 64 / 255 - 23
    }
}

/// The smallest local part once a payload spills to overflow pages.
fn min_local(usable: u32) -> u32 {
    (usable - 12) * 32 / 255 - 23
}

/// How many payload bytes stay on the b-tree page. Matches the storage
/// format's spill rule exactly, including the modulo step that tries to
/// end the overflow chain on a page boundary.
fn local_payload(payload: u64, page_type: BTreePageType, usable: u32) -> u64 {
    let max = u64::from(max_local(page_type, usable));
    if payload <= max {
        return payload;
    }
    let min = u64::from(min_local(usable));
    let surplus = min + (payload - min) % u64::from(usable - 4);
    if surplus > max { min } else { surplus }
}

/// A cell as far as the walker cares: total payload, where the local part
/// ends, and the child/overflow pointers.
struct CellInfo {
    payload: u64,
    local: u64,
    child: Option<u32>,
    first_overflow: Option<u32>,
}

fn parse_cell(
    page: &[u8],
    ptr: usize,
    page_type: BTreePageType,
    usable: u32,
) -> Result<CellInfo> {
    let corrupt = |what: &str| PetraError::DatabaseCorrupt {
        detail: format!("{what} in cell at offset {ptr}"),
    };
    let mut at = ptr;
    let child = if page_type.is_interior() {
        if at + 4 > page.len() {
            return Err(corrupt("truncated child pointer"));
        }
        let child = get_u32(page, at);
        at += 4;
        Some(child)
    } else {
        None
    };

    // Interior table cells carry a rowid but no payload.
    if page_type == BTreePageType::InteriorTable {
        get_varint(&page[at..]).ok_or_else(|| corrupt("bad rowid varint"))?;
        return Ok(CellInfo {
            payload: 0,
            local: 0,
            child,
            first_overflow: None,
        });
    }

    let (payload, n) = get_varint(&page[at..]).ok_or_else(|| corrupt("bad payload varint"))?;
    at += n;
    if page_type == BTreePageType::LeafTable {
        let (_, n) = get_varint(&page[at..]).ok_or_else(|| corrupt("bad rowid varint"))?;
        at += n;
    }

    let local = local_payload(payload, page_type, usable);
    let first_overflow = if local < payload {
        let ptr_at = at + usize::try_from(local).map_err(|_| corrupt("oversized payload"))?;
        if ptr_at + 4 > page.len() {
            return Err(corrupt("truncated overflow pointer"));
        }
        Some(get_u32(page, ptr_at))
    } else {
        None
    };
    Ok(CellInfo {
        payload,
        local,
        child,
        first_overflow,
    })
}

/// Walk the b-tree rooted at `root`, appending one row per visited page.
///
/// `reserved` is the per-page reserved byte count from the database header;
/// rows appear in depth-first order, each page's overflow chains directly
/// after it. A read transaction must be open on the pager.
pub fn walk_btree<V: Vfs>(
    cx: &Cx,
    pager: &mut Pager<V>,
    name: &str,
    root: u32,
    reserved: u8,
) -> Result<Vec<PageStatRow>> {
    let mut rows = Vec::new();
    let mut visited = PageBitvec::with_capacity(pager.db_size());
    visit(cx, pager, name, root, "/", reserved, &mut visited, &mut rows)?;
    Ok(rows)
}

#[allow(clippy::too_many_arguments)]
fn visit<V: Vfs>(
    cx: &Cx,
    pager: &mut Pager<V>,
    name: &str,
    pgno: u32,
    path: &str,
    reserved: u8,
    visited: &mut PageBitvec,
    rows: &mut Vec<PageStatRow>,
) -> Result<()> {
    cx.checkpoint()?;
    if visited.contains(pgno) {
        return Err(PetraError::DatabaseCorrupt {
            detail: format!("page {pgno} appears twice in the b-tree"),
        });
    }
    visited.set(pgno);

    let page_size = pager.page_size();
    let usable = page_size.usable(reserved);
    let page = pager.read_page(cx, pgno)?.to_vec();
    let hdr = BTreePageHeader::decode(&page, page_size, pgno == 1)?;
    let pointers = hdr.cell_pointers(&page)?;

    let mut local_total = 0u64;
    let mut mx_payload = 0u64;
    let mut cells = Vec::with_capacity(pointers.len());
    for ptr in &pointers {
        let cell = parse_cell(&page, usize::from(*ptr), hdr.page_type, usable)?;
        local_total += cell.local;
        mx_payload = mx_payload.max(cell.payload);
        cells.push(cell);
    }

    let ptr_array_end = hdr.header_offset + hdr.header_size() + pointers.len() * 2;
    let gap = u64::from(hdr.cell_content_start).saturating_sub(ptr_array_end as u64);
    let freeblock_bytes: u64 = hdr
        .freeblocks(&page)?
        .iter()
        .map(|fb| u64::from(fb.size))
        .sum();
    let unused = gap + u64::from(hdr.fragmented_free_bytes) + freeblock_bytes;

    rows.push(PageStatRow {
        name: name.to_owned(),
        path: path.to_owned(),
        pageno: pgno,
        pagetype: hdr.page_type.display_name(),
        ncell: u32::from(hdr.cell_count),
        payload: local_total,
        unused,
        mx_payload,
        pgoffset: u64::from(pgno - 1) * u64::from(page_size.get()),
        pgsize: page_size.get(),
    });

    // Overflow chains, one row per overflow page, in cell order.
    for (i, cell) in cells.iter().enumerate() {
        let Some(first) = cell.first_overflow else {
            continue;
        };
        walk_overflow(
            cx, pager, name, path, i, first, cell.payload - cell.local, reserved, visited, rows,
        )?;
    }

    // Children in cell order, the right-most child last.
    for (i, cell) in cells.iter().enumerate() {
        if let Some(child) = cell.child {
            let child_path = format!("{path}{i:03x}/");
            visit(cx, pager, name, child, &child_path, reserved, visited, rows)?;
        }
    }
    if let Some(right) = hdr.right_most_child {
        let child_path = format!("{path}{:03x}/", cells.len());
        visit(cx, pager, name, right.get(), &child_path, reserved, visited, rows)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn walk_overflow<V: Vfs>(
    cx: &Cx,
    pager: &mut Pager<V>,
    name: &str,
    parent_path: &str,
    cell_index: usize,
    first: u32,
    mut remaining: u64,
    reserved: u8,
    visited: &mut PageBitvec,
    rows: &mut Vec<PageStatRow>,
) -> Result<()> {
    let page_size = pager.page_size();
    let usable = u64::from(page_size.usable(reserved));
    let per_page = usable - 4;

    let mut pgno = first;
    let mut index = 0u32;
    while pgno != 0 && remaining > 0 {
        cx.checkpoint()?;
        if visited.contains(pgno) {
            return Err(PetraError::DatabaseCorrupt {
                detail: format!("overflow page {pgno} appears twice"),
            });
        }
        visited.set(pgno);

        let stored = remaining.min(per_page);
        let page = pager.read_page(cx, pgno)?;
        let next = get_u32(page, 0);
        rows.push(PageStatRow {
            name: name.to_owned(),
            path: format!("{parent_path}{cell_index:03x}+{index:06x}"),
            pageno: pgno,
            pagetype: "overflow",
            ncell: 0,
            payload: stored,
            unused: per_page - stored,
            mx_payload: 0,
            pgoffset: u64::from(pgno - 1) * u64::from(page_size.get()),
            pgsize: page_size.get(),
        });
        remaining -= stored;
        pgno = next;
        index += 1;
    }
    if remaining > 0 {
        return Err(PetraError::DatabaseCorrupt {
            detail: format!(
                "overflow chain for cell {cell_index} ended with {remaining} bytes missing"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use petra_types::encoding::{put_u16, put_u32, put_varint};
    use petra_types::header::DatabaseHeader;
    use petra_types::{JournalMode, PageSize};
    use petra_vfs::MemoryVfs;

    use crate::pager::{Pager, PagerConfig};

    use std::path::Path;

    const PS: PageSize = PageSize::MIN;
    const USABLE: u32 = 512;

    fn config() -> PagerConfig {
        PagerConfig {
            page_size: PS,
            journal_mode: JournalMode::Delete,
            ..PagerConfig::default()
        }
    }

    /// A leaf-table cell: payload length, rowid, local payload, overflow
    /// pointer when the payload spills.
    fn leaf_cell(payload_len: u64, rowid: u64, fill: u8, overflow: u32) -> Vec<u8> {
        let local = local_payload(payload_len, BTreePageType::LeafTable, USABLE);
        let mut buf = vec![0u8; 18];
        let mut at = put_varint(&mut buf, payload_len);
        at += put_varint(&mut buf[at..], rowid);
        buf.truncate(at);
        buf.extend(std::iter::repeat(fill).take(usize::try_from(local).unwrap()));
        if local < payload_len {
            buf.extend_from_slice(&overflow.to_be_bytes());
        }
        buf
    }

    /// An interior-table cell: child pointer plus rowid.
    fn interior_cell(child: u32, rowid: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 13];
        put_u32(&mut buf, 0, child);
        let n = put_varint(&mut buf[4..], rowid);
        buf.truncate(4 + n);
        buf
    }

    /// Assemble a b-tree page with the cells packed at the end.
    fn build_page(
        page_type: BTreePageType,
        cells: &[Vec<u8>],
        right_child: u32,
        is_page1: bool,
    ) -> Vec<u8> {
        let mut page = vec![0u8; PS.as_usize()];
        let off = if is_page1 { 100 } else { 0 };
        page[off] = page_type as u8;
        put_u16(&mut page, off + 3, u16::try_from(cells.len()).unwrap());
        let hdr_size = if page_type.is_interior() { 12 } else { 8 };
        if page_type.is_interior() {
            put_u32(&mut page, off + 8, right_child);
        }
        let mut content = PS.as_usize();
        let mut pointers = Vec::new();
        for cell in cells {
            content -= cell.len();
            page[content..content + cell.len()].copy_from_slice(cell);
            pointers.push(u16::try_from(content).unwrap());
        }
        put_u16(&mut page, off + 5, u16::try_from(content).unwrap());
        for (i, ptr) in pointers.iter().enumerate() {
            put_u16(&mut page, off + hdr_size + i * 2, *ptr);
        }
        page
    }

    /// Page 1: database header followed by an empty table leaf.
    fn page_one() -> Vec<u8> {
        let mut page = build_page(BTreePageType::LeafTable, &[], 0, true);
        let hdr = DatabaseHeader {
            page_size: PS,
            ..DatabaseHeader::default()
        };
        let mut file_header = [0u8; 100];
        hdr.encode(&mut file_header);
        page[..100].copy_from_slice(&file_header);
        page
    }

    fn open_db(pages: &[(u32, Vec<u8>)]) -> Pager<MemoryVfs> {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = Pager::open(&cx, vfs, Path::new("/walk.db"), config()).unwrap();
        pager.begin_read(&cx).unwrap();
        pager.begin_write(&cx).unwrap();
        pager.write_page(&cx, 1, &page_one()).unwrap();
        for (pgno, content) in pages {
            pager.write_page(&cx, *pgno, content).unwrap();
        }
        pager.commit(&cx).unwrap();
        pager
    }

    #[test]
    fn local_payload_spill_rule() {
        // usable 512: leaf-table max local 477, min local 39.
        assert_eq!(max_local(BTreePageType::LeafTable, USABLE), 477);
        assert_eq!(min_local(USABLE), 39);
        assert_eq!(local_payload(477, BTreePageType::LeafTable, USABLE), 477);
        // 600 spills: 39 + (600 - 39) % 508 = 92.
        assert_eq!(local_payload(600, BTreePageType::LeafTable, USABLE), 92);
        // Surplus past max falls back to the minimum.
        let payload = 39 + 508 + 478;
        assert_eq!(
            local_payload(payload, BTreePageType::LeafTable, USABLE),
            39
        );
    }

    #[test]
    fn single_leaf_root() {
        let cells = vec![leaf_cell(20, 1, 0xAA, 0), leaf_cell(30, 2, 0xBB, 0)];
        let root = build_page(BTreePageType::LeafTable, &cells, 0, false);
        let mut pager = open_db(&[(2, root)]);
        let cx = Cx::new();

        let rows = walk_btree(&cx, &mut pager, "t", 2, 0).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.name, "t");
        assert_eq!(row.path, "/");
        assert_eq!(row.pageno, 2);
        assert_eq!(row.pagetype, "leaf");
        assert_eq!(row.ncell, 2);
        assert_eq!(row.payload, 50);
        assert_eq!(row.mx_payload, 30);
        assert_eq!(row.pgoffset, 512);
        assert_eq!(row.pgsize, 512);
        // Cells are 22 and 32 bytes; unused = content_start - ptr array end.
        let expected_unused = u64::from(512u16 - 22 - 32) - (8 + 4);
        assert_eq!(row.unused, expected_unused);
    }

    #[test]
    fn interior_with_two_leaves() {
        let leaf_a = build_page(BTreePageType::LeafTable, &[leaf_cell(10, 1, 0x01, 0)], 0, false);
        let leaf_b = build_page(BTreePageType::LeafTable, &[leaf_cell(10, 5, 0x02, 0)], 0, false);
        let root = build_page(
            BTreePageType::InteriorTable,
            &[interior_cell(3, 4)],
            4,
            false,
        );
        let mut pager = open_db(&[(2, root), (3, leaf_a), (4, leaf_b)]);
        let cx = Cx::new();

        let rows = walk_btree(&cx, &mut pager, "t", 2, 0).unwrap();
        let summary: Vec<(&str, u32, &str)> = rows
            .iter()
            .map(|r| (r.path.as_str(), r.pageno, r.pagetype))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("/", 2, "internal"),
                ("/000/", 3, "leaf"),
                ("/001/", 4, "leaf"),
            ]
        );
        // Interior table cells carry no payload.
        assert_eq!(rows[0].payload, 0);
        assert_eq!(rows[0].mx_payload, 0);
    }

    #[test]
    fn overflow_chain_rows() {
        // Payload 600 leaves 92 bytes local and 508 on one overflow page.
        let root = build_page(
            BTreePageType::LeafTable,
            &[leaf_cell(600, 1, 0xCC, 3)],
            0,
            false,
        );
        let mut overflow = vec![0xCCu8; PS.as_usize()];
        overflow[..4].fill(0); // no next page
        let mut pager = open_db(&[(2, root), (3, overflow)]);
        let cx = Cx::new();

        let rows = walk_btree(&cx, &mut pager, "t", 2, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payload, 92);
        assert_eq!(rows[0].mx_payload, 600);
        let ovfl = &rows[1];
        assert_eq!(ovfl.path, "/000+000000");
        assert_eq!(ovfl.pageno, 3);
        assert_eq!(ovfl.pagetype, "overflow");
        assert_eq!(ovfl.ncell, 0);
        assert_eq!(ovfl.payload, 508);
        assert_eq!(ovfl.unused, 0);
    }

    #[test]
    fn aggregate_sums_rows_per_tree() {
        let root = build_page(
            BTreePageType::LeafTable,
            &[leaf_cell(600, 1, 0xCC, 3)],
            0,
            false,
        );
        let mut overflow = vec![0xCCu8; PS.as_usize()];
        overflow[..4].fill(0);
        let mut pager = open_db(&[(2, root), (3, overflow)]);
        let cx = Cx::new();

        let rows = walk_btree(&cx, &mut pager, "t", 2, 0).unwrap();
        let stats = aggregate_stats(&rows);
        assert_eq!(stats.len(), 1);
        let stat = &stats[0];
        assert_eq!(stat.name, "t");
        assert_eq!(stat.pages, 2);
        assert_eq!(stat.ncell, 1);
        assert_eq!(stat.payload, 92 + 508);
        assert_eq!(stat.mx_payload, 600);
        assert_eq!(stat.bytes, 2 * 512);
    }

    #[test]
    fn truncated_overflow_chain_is_corruption() {
        // The chain should carry 508 bytes but ends immediately.
        let root = build_page(
            BTreePageType::LeafTable,
            &[leaf_cell(600, 1, 0xCC, 0)],
            0,
            false,
        );
        let mut pager = open_db(&[(2, root)]);
        let cx = Cx::new();
        assert!(matches!(
            walk_btree(&cx, &mut pager, "t", 2, 0),
            Err(PetraError::DatabaseCorrupt { .. })
        ));
    }

    #[test]
    fn cyclic_tree_is_corruption() {
        // Root's right-most child points back at the root.
        let root = build_page(BTreePageType::InteriorTable, &[], 2, false);
        let mut pager = open_db(&[(2, root)]);
        let cx = Cx::new();
        assert!(matches!(
            walk_btree(&cx, &mut pager, "t", 2, 0),
            Err(PetraError::DatabaseCorrupt { .. })
        ));
    }
}
