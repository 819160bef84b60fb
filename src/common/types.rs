use std::fmt;

/// Page number - 1-based position of a page in the database file.
/// Page number 0 never refers to a page; it marks "no page" in on-disk pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageNumber(pub u32);

impl PageNumber {
    pub fn new(pgno: u32) -> Self {
        Self(pgno)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns true unless this is the reserved page number 0.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Byte offset of this page within a file of `page_size` pages.
    pub fn file_offset(&self, page_size: usize) -> u64 {
        (self.0 as u64 - 1) * page_size as u64
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageNumber({})", self.0)
    }
}

/// Frame identifier type - identifies a slot in the page cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

/// 1-based index of a frame in the write-ahead log. 0 means "no frame".
pub type FrameNumber = u32;

/// Row id - the integer key of table B-trees
pub type RowId = i64;

/// Timestamp type for LRU-K tracking
pub type Timestamp = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_number_offset() {
        assert_eq!(PageNumber::new(1).file_offset(4096), 0);
        assert_eq!(PageNumber::new(3).file_offset(512), 1024);
        assert!(!PageNumber::new(0).is_valid());
        assert!(PageNumber::new(1).is_valid());
    }
}
