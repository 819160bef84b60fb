//! Ordered key/value storage on B-tree pages.
//!
//! Table trees are keyed by rowid and keep payloads in their leaves. Index
//! trees are keyed by byte strings ordered by a [`KeyComparator`]; each leaf
//! entry stores the key followed by its value. Interior pages of both kinds
//! hold divider keys only, so every entry lives in a leaf.

mod balance;
mod cursor;
mod integrity;
mod key_comparator;
mod overflow;
mod tree;

use std::fmt;

pub use cursor::Cursor;
pub use key_comparator::{BytewiseComparator, IntegerComparator, KeyComparator};
pub use tree::BTree;

use crate::common::{PageNumber, RowId};
use crate::storage::page::PageType;

/// The two kinds of tree a database holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeKind {
    /// Keyed by rowid
    Table,
    /// Keyed by comparator-ordered byte strings
    Index,
}

impl TreeKind {
    pub fn leaf_type(self) -> PageType {
        match self {
            TreeKind::Table => PageType::TableLeaf,
            TreeKind::Index => PageType::IndexLeaf,
        }
    }

    pub fn interior_type(self) -> PageType {
        self.leaf_type().interior()
    }

    pub(crate) fn of(page_type: PageType) -> Self {
        if page_type.is_table() {
            TreeKind::Table
        } else {
            TreeKind::Index
        }
    }
}

/// Key of a B-tree entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Row(RowId),
    Bytes(Vec<u8>),
}

impl Key {
    pub fn kind(&self) -> TreeKind {
        match self {
            Key::Row(_) => TreeKind::Table,
            Key::Bytes(_) => TreeKind::Index,
        }
    }
}

impl From<RowId> for Key {
    fn from(rowid: RowId) -> Self {
        Key::Row(rowid)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::Bytes(bytes)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Row(rowid) => write!(f, "{rowid}"),
            Key::Bytes(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Leaf slot where a missing key would be inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertionPoint {
    pub page: PageNumber,
    pub index: usize,
}

/// Outcome of [`Cursor::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    /// The cursor is on the entry with the key.
    Found,
    /// The key is absent; the cursor is on the next larger entry, if any.
    NotFound(InsertionPoint),
}

impl SeekResult {
    pub fn is_found(&self) -> bool {
        matches!(self, SeekResult::Found)
    }
}
