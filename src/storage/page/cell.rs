//! Cell encodings and the local/overflow payload split.
//!
//! | page type      | layout                                                       |
//! |----------------|--------------------------------------------------------------|
//! | table leaf     | varint payload size, varint rowid, local payload, [overflow] |
//! | table interior | u32 left child, varint rowid                                 |
//! | index leaf     | varint payload size, local payload, [overflow]               |
//! | index interior | u32 left child, varint payload size, local payload, [ovfl]   |

use std::ops::Range;

use bytes::{Buf, BufMut};

use crate::common::{LodeError, PageNumber, Result, RowId};

use super::btree_page::PageType;
use super::varint::{put_varint, read_varint};

/// Largest payload stored entirely inside a cell on a page of this type.
pub fn max_local(usable: usize, page_type: PageType) -> usize {
    match page_type {
        PageType::TableLeaf => usable - 35,
        _ => (usable - 12) * 64 / 255 - 23,
    }
}

/// Smallest number of payload bytes kept on the page once a payload spills.
pub fn min_local(usable: usize) -> usize {
    (usable - 12) * 32 / 255 - 23
}

/// Number of payload bytes stored on the page for a payload of `payload_len`.
pub fn local_payload_size(payload_len: u64, usable: usize, page_type: PageType) -> usize {
    let max = max_local(usable, page_type);
    if payload_len <= max as u64 {
        return payload_len as usize;
    }
    let min = min_local(usable);
    let surplus = min + ((payload_len - min as u64) % (usable as u64 - 4)) as usize;
    if surplus <= max {
        surplus
    } else {
        min
    }
}

/// Decoded view of one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellInfo {
    pub left_child: Option<PageNumber>,
    pub rowid: Option<RowId>,
    /// Total payload length, including bytes held on overflow pages
    pub payload_len: u64,
    /// Position of the on-page payload bytes within the cell
    pub local: Range<usize>,
    pub overflow: Option<PageNumber>,
    /// Total encoded size of the cell
    pub size: usize,
}

impl CellInfo {
    pub fn has_overflow(&self) -> bool {
        self.overflow.is_some()
    }
}

/// Parses the cell at the front of `buf`. `buf` may extend past the cell; the
/// returned `size` says where it ends.
pub fn parse_cell(page_type: PageType, buf: &[u8], usable: usize) -> Result<CellInfo> {
    let mut pos = 0;
    let left_child = if page_type.is_leaf() {
        None
    } else {
        let mut raw = buf
            .get(..4)
            .ok_or_else(|| LodeError::corrupt("interior cell shorter than child pointer"))?;
        pos = 4;
        Some(PageNumber::new(raw.get_u32()))
    };

    if page_type == PageType::TableInterior {
        let (rowid, n) = read_varint(&buf[pos..])?;
        return Ok(CellInfo {
            left_child,
            rowid: Some(rowid as i64),
            payload_len: 0,
            local: 0..0,
            overflow: None,
            size: pos + n,
        });
    }

    let (payload_len, n) = read_varint(&buf[pos..])?;
    pos += n;
    let rowid = if page_type == PageType::TableLeaf {
        let (rowid, n) = read_varint(&buf[pos..])?;
        pos += n;
        Some(rowid as i64)
    } else {
        None
    };

    let local_len = local_payload_size(payload_len, usable, page_type);
    let local = pos..pos + local_len;
    pos += local_len;
    let overflow = if (local_len as u64) < payload_len {
        let mut raw = buf
            .get(pos..pos + 4)
            .ok_or_else(|| LodeError::corrupt("cell overflow pointer runs past page"))?;
        pos += 4;
        let pgno = raw.get_u32();
        if pgno == 0 {
            return Err(LodeError::corrupt("cell spills with a null overflow page"));
        }
        Some(PageNumber::new(pgno))
    } else {
        None
    };
    if pos > buf.len() {
        return Err(LodeError::corrupt("cell payload runs past page"));
    }

    Ok(CellInfo {
        left_child,
        rowid,
        payload_len,
        local,
        overflow,
        size: pos,
    })
}

/// Builds a table leaf cell. `local` holds the on-page payload prefix.
pub fn table_leaf_cell(
    rowid: RowId,
    payload_len: u64,
    local: &[u8],
    overflow: Option<PageNumber>,
) -> Vec<u8> {
    let mut cell = Vec::with_capacity(local.len() + 22);
    put_varint(&mut cell, payload_len);
    put_varint(&mut cell, rowid as u64);
    cell.put_slice(local);
    if let Some(pgno) = overflow {
        cell.put_u32(pgno.as_u32());
    }
    cell
}

/// Builds a table interior (divider) cell.
pub fn table_interior_cell(left_child: PageNumber, rowid: RowId) -> Vec<u8> {
    let mut cell = Vec::with_capacity(13);
    cell.put_u32(left_child.as_u32());
    put_varint(&mut cell, rowid as u64);
    cell
}

/// Builds an index cell; interior cells carry a left child pointer.
pub fn index_cell(
    left_child: Option<PageNumber>,
    payload_len: u64,
    local: &[u8],
    overflow: Option<PageNumber>,
) -> Vec<u8> {
    let mut cell = Vec::with_capacity(local.len() + 17);
    if let Some(pgno) = left_child {
        cell.put_u32(pgno.as_u32());
    }
    put_varint(&mut cell, payload_len);
    cell.put_slice(local);
    if let Some(pgno) = overflow {
        cell.put_u32(pgno.as_u32());
    }
    cell
}

/// Rewrites the left child pointer of an interior cell in place.
pub fn set_left_child(cell: &mut [u8], child: PageNumber) {
    cell[..4].copy_from_slice(&child.as_u32().to_be_bytes());
}
