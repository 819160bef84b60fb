use bytes::{Buf, BufMut};

use crate::common::{LodeError, PageNumber, Result, DB_HEADER_SIZE};

use super::cell::{parse_cell, set_left_child, CellInfo};

/// Flag byte at the start of every B-tree page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    IndexInterior = 0x02,
    TableInterior = 0x05,
    IndexLeaf = 0x0a,
    TableLeaf = 0x0d,
}

impl PageType {
    pub fn from_flag(flag: u8) -> Result<Self> {
        match flag {
            0x02 => Ok(PageType::IndexInterior),
            0x05 => Ok(PageType::TableInterior),
            0x0a => Ok(PageType::IndexLeaf),
            0x0d => Ok(PageType::TableLeaf),
            other => Err(LodeError::corrupt(format!(
                "invalid b-tree page type {other:#04x}"
            ))),
        }
    }

    pub fn flag(self) -> u8 {
        self as u8
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, PageType::IndexLeaf | PageType::TableLeaf)
    }

    pub fn is_table(self) -> bool {
        matches!(self, PageType::TableInterior | PageType::TableLeaf)
    }

    /// Size of the page header (before the cell pointer array).
    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            8
        } else {
            12
        }
    }

    /// Leaf page type of the same tree kind.
    pub fn leaf(self) -> Self {
        if self.is_table() {
            PageType::TableLeaf
        } else {
            PageType::IndexLeaf
        }
    }

    /// Interior page type of the same tree kind.
    pub fn interior(self) -> Self {
        if self.is_table() {
            PageType::TableInterior
        } else {
            PageType::IndexInterior
        }
    }
}

/// Offset of the B-tree page header: page 1 starts with the database header.
pub fn header_offset(pgno: PageNumber) -> usize {
    if pgno.as_u32() == 1 {
        DB_HEADER_SIZE
    } else {
        0
    }
}

/// A B-tree page decoded into its cells.
///
/// Pages are read into this form, modified, and re-encoded compactly, so the
/// encoded form never carries freeblocks or fragmented bytes. `cells` may
/// temporarily hold more than fits on a page while a split is being planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreePage {
    pub page_type: PageType,
    /// Right-most child of an interior page
    pub right_child: Option<PageNumber>,
    /// Raw cell bytes in key order
    pub cells: Vec<Vec<u8>>,
}

impl BTreePage {
    /// Creates an empty page of the given type.
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type,
            right_child: None,
            cells: Vec::new(),
        }
    }

    /// Creates an interior page whose only child is `child`.
    pub fn new_interior(page_type: PageType, child: PageNumber) -> Self {
        Self {
            page_type: page_type.interior(),
            right_child: Some(child),
            cells: Vec::new(),
        }
    }

    /// Decodes and validates the page whose header starts at `hdr_offset`.
    pub fn decode(data: &[u8], hdr_offset: usize, usable: usize) -> Result<Self> {
        if data.len() < usable || hdr_offset + 8 > usable {
            return Err(LodeError::corrupt("page buffer smaller than usable size"));
        }

        let mut hdr = &data[hdr_offset..];
        let page_type = PageType::from_flag(hdr.get_u8())?;
        let first_freeblock = hdr.get_u16() as usize;
        let cell_count = hdr.get_u16() as usize;
        let content_start = match hdr.get_u16() {
            0 => 65536,
            n => n as usize,
        };
        let fragmented = hdr.get_u8() as usize;
        let right_child = if page_type.is_leaf() {
            None
        } else {
            let pgno = hdr.get_u32();
            if pgno == 0 {
                return Err(LodeError::corrupt("interior page without right child"));
            }
            Some(PageNumber::new(pgno))
        };

        let ptr_start = hdr_offset + page_type.header_size();
        let ptr_end = ptr_start + 2 * cell_count;
        if ptr_end > content_start || content_start > usable {
            return Err(LodeError::corrupt(format!(
                "cell count {cell_count} inconsistent with content offset {content_start}"
            )));
        }

        let mut cells = Vec::with_capacity(cell_count);
        let mut cell_bytes = 0;
        let mut ptrs = &data[ptr_start..ptr_end];
        for _ in 0..cell_count {
            let offset = ptrs.get_u16() as usize;
            if offset < content_start || offset >= usable {
                return Err(LodeError::corrupt(format!(
                    "cell pointer {offset} outside content area"
                )));
            }
            let info = parse_cell(page_type, &data[offset..usable], usable)?;
            cells.push(data[offset..offset + info.size].to_vec());
            cell_bytes += info.size;
        }

        let mut free_bytes = 0;
        let mut freeblock = first_freeblock;
        while freeblock != 0 {
            if freeblock < content_start || freeblock + 4 > usable {
                return Err(LodeError::corrupt("freeblock outside content area"));
            }
            let mut fb = &data[freeblock..freeblock + 4];
            let next = fb.get_u16() as usize;
            let size = fb.get_u16() as usize;
            if size < 4 || freeblock + size > usable || (next != 0 && next <= freeblock + size) {
                return Err(LodeError::corrupt("malformed freeblock chain"));
            }
            free_bytes += size;
            freeblock = next;
        }

        if cell_bytes + free_bytes + fragmented != usable - content_start {
            return Err(LodeError::corrupt(format!(
                "cell count {cell_count} inconsistent with free-space offsets"
            )));
        }

        Ok(Self {
            page_type,
            right_child,
            cells,
        })
    }

    /// Encodes this page compactly into `data`, cells packed against `usable`.
    pub fn encode(&self, data: &mut [u8], hdr_offset: usize, usable: usize) -> Result<()> {
        let header_size = self.page_type.header_size();
        if hdr_offset + self.byte_size() > usable {
            return Err(LodeError::corrupt(format!(
                "{} bytes of cells do not fit on the page",
                self.byte_size()
            )));
        }

        let mut top = usable;
        let ptr_start = hdr_offset + header_size;
        for (i, cell) in self.cells.iter().enumerate() {
            top -= cell.len();
            data[top..top + cell.len()].copy_from_slice(cell);
            let ptr = ptr_start + 2 * i;
            data[ptr..ptr + 2].copy_from_slice(&(top as u16).to_be_bytes());
        }
        let ptr_end = ptr_start + 2 * self.cells.len();
        data[ptr_end..top].fill(0);

        let mut hdr = &mut data[hdr_offset..ptr_start];
        hdr.put_u8(self.page_type.flag());
        hdr.put_u16(0);
        hdr.put_u16(self.cells.len() as u16);
        hdr.put_u16(if top == 65536 { 0 } else { top as u16 });
        hdr.put_u8(0);
        if let Some(child) = self.right_child {
            hdr.put_u32(child.as_u32());
        }
        Ok(())
    }

    pub fn is_leaf(&self) -> bool {
        self.page_type.is_leaf()
    }

    pub fn is_table(&self) -> bool {
        self.page_type.is_table()
    }

    /// Header, pointer array and cell bytes this page needs.
    pub fn byte_size(&self) -> usize {
        self.page_type.header_size() + self.content_size()
    }

    /// Bytes taken by cells and their pointers.
    pub fn content_size(&self) -> usize {
        self.cells.iter().map(|c| c.len() + 2).sum()
    }

    /// Returns true if the page encodes within `capacity` bytes
    /// (usable size minus the header offset).
    pub fn fits(&self, capacity: usize) -> bool {
        self.byte_size() <= capacity
    }

    /// Number of child pointers of an interior page.
    pub fn child_count(&self) -> usize {
        if self.is_leaf() {
            0
        } else {
            self.cells.len() + 1
        }
    }

    /// Child pointer `idx`: the left child of cell `idx`, or the right child
    /// when `idx` equals the cell count.
    pub fn child_at(&self, idx: usize) -> Result<PageNumber> {
        if idx < self.cells.len() {
            let mut raw = self.cells[idx]
                .get(..4)
                .ok_or_else(|| LodeError::corrupt("interior cell shorter than child pointer"))?;
            Ok(PageNumber::new(raw.get_u32()))
        } else if idx == self.cells.len() {
            self.right_child
                .ok_or_else(|| LodeError::corrupt("interior page without right child"))
        } else {
            Err(LodeError::corrupt(format!("child index {idx} out of range")))
        }
    }

    /// Replaces child pointer `idx`.
    pub fn set_child_at(&mut self, idx: usize, child: PageNumber) {
        if idx < self.cells.len() {
            set_left_child(&mut self.cells[idx], child);
        } else {
            self.right_child = Some(child);
        }
    }

    /// Parses cell `idx`.
    pub fn cell_info(&self, idx: usize, usable: usize) -> Result<CellInfo> {
        let cell = self
            .cells
            .get(idx)
            .ok_or_else(|| LodeError::corrupt(format!("cell index {idx} out of range")))?;
        parse_cell(self.page_type, cell, usable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::cell::{table_interior_cell, table_leaf_cell};

    #[test]
    fn test_page_type_flags() {
        for flag in [0x02u8, 0x05, 0x0a, 0x0d] {
            assert_eq!(PageType::from_flag(flag).unwrap().flag(), flag);
        }
        assert!(PageType::from_flag(0x00).is_err());
        assert!(PageType::TableLeaf.is_leaf());
        assert!(PageType::TableLeaf.is_table());
        assert_eq!(PageType::IndexLeaf.interior(), PageType::IndexInterior);
        assert_eq!(PageType::TableInterior.leaf(), PageType::TableLeaf);
        assert_eq!(PageType::TableInterior.header_size(), 12);
    }

    #[test]
    fn test_encode_decode_leaf() {
        let mut page = BTreePage::new(PageType::TableLeaf);
        for rowid in 1..=3 {
            page.cells.push(table_leaf_cell(rowid, 2, b"hi", None));
        }

        let mut data = vec![0u8; 512];
        page.encode(&mut data, 0, 512).unwrap();
        assert_eq!(data[0], 0x0d);
        assert_eq!(&data[3..5], &[0, 3]);
        // three 4-byte cells packed against the end
        assert_eq!(&data[5..7], &(512u16 - 12).to_be_bytes());
        assert_eq!(&data[500..504], &[2, 3, b'h', b'i']);

        let decoded = BTreePage::decode(&data, 0, 512).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn test_encode_decode_page_one_interior() {
        let mut page = BTreePage::new_interior(PageType::TableLeaf, PageNumber::new(9));
        page.cells.push(table_interior_cell(PageNumber::new(4), 100));

        let mut data = vec![0xAAu8; 1024];
        page.encode(&mut data, DB_HEADER_SIZE, 1024).unwrap();
        // database header bytes are left alone
        assert_eq!(data[0], 0xAA);
        let decoded = BTreePage::decode(&data, header_offset(PageNumber::new(1)), 1024).unwrap();
        assert_eq!(decoded.child_at(0).unwrap(), PageNumber::new(4));
        assert_eq!(decoded.child_at(1).unwrap(), PageNumber::new(9));
        assert!(decoded.child_at(2).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_page() {
        let mut page = BTreePage::new(PageType::TableLeaf);
        page.cells.push(table_leaf_cell(1, 600, &[0u8; 600], None));
        let mut data = vec![0u8; 512];
        assert!(!page.fits(512));
        assert!(page.encode(&mut data, 0, 512).is_err());
    }

    #[test]
    fn test_decode_detects_bad_cell_count() {
        let mut page = BTreePage::new(PageType::TableLeaf);
        page.cells.push(table_leaf_cell(1, 2, b"ok", None));
        let mut data = vec![0u8; 512];
        page.encode(&mut data, 0, 512).unwrap();

        // claim a second cell that was never written
        data[3..5].copy_from_slice(&2u16.to_be_bytes());
        let err = BTreePage::decode(&data, 0, 512).unwrap_err();
        assert!(matches!(err, LodeError::Corrupt(_)));
    }

    #[test]
    fn test_decode_rejects_zeroed_page() {
        let data = vec![0u8; 512];
        assert!(matches!(
            BTreePage::decode(&data, 0, 512),
            Err(LodeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_set_child_at() {
        let mut page = BTreePage::new_interior(PageType::TableLeaf, PageNumber::new(2));
        page.cells.push(table_interior_cell(PageNumber::new(3), 10));
        page.set_child_at(0, PageNumber::new(7));
        page.set_child_at(1, PageNumber::new(8));
        assert_eq!(page.child_at(0).unwrap(), PageNumber::new(7));
        assert_eq!(page.right_child, Some(PageNumber::new(8)));
        assert_eq!(page.child_count(), 2);
    }
}
