use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::common::{LodeError, PageNumber, Result};
use crate::pager::Pager;
use crate::storage::page::{
    header_offset, index_cell, local_payload_size, put_varint, read_varint, table_interior_cell,
    table_leaf_cell, BTreePage, PageType,
};

use super::key_comparator::{BytewiseComparator, KeyComparator};
use super::overflow;
use super::{Cursor, Key, TreeKind};

/// Root-to-leaf path: each page with the child (interior) or cell (leaf)
/// index taken on it
pub(super) type Path = Vec<(PageNumber, usize)>;

/// BTree is a handle on one tree of the database.
///
/// The root page never moves: when the root overflows its content is pushed
/// into a new child, and when it is left with a single child that child is
/// pulled back up. All reads and writes go through the pager, so a tree is
/// only usable inside a transaction, and writes need a write transaction.
#[derive(Clone)]
pub struct BTree {
    pub(super) pager: Arc<Pager>,
    root: PageNumber,
    kind: TreeKind,
    comparator: Arc<dyn KeyComparator>,
}

impl BTree {
    /// Allocates an empty tree and returns a handle on it.
    pub fn create(pager: Arc<Pager>, kind: TreeKind) -> Result<Self> {
        let root = pager.allocate_page()?;
        let tree = Self::open(pager, root, kind);
        tree.store(root, &BTreePage::new(kind.leaf_type()))?;
        debug!(root = root.as_u32(), ?kind, "created b-tree");
        Ok(tree)
    }

    /// Opens the tree rooted at `root`. Index trees order keys bytewise
    /// unless a comparator is supplied with [`BTree::with_comparator`].
    pub fn open(pager: Arc<Pager>, root: PageNumber, kind: TreeKind) -> Self {
        Self {
            pager,
            root,
            kind,
            comparator: Arc::new(BytewiseComparator),
        }
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn root(&self) -> PageNumber {
        self.root
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Opens a cursor on this tree.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.clone())
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.cursor();
        if cursor.seek(key)?.is_found() {
            cursor.value()
        } else {
            Ok(None)
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert(&self, key: &Key, value: &[u8]) -> Result<()> {
        self.cursor().insert(key, value)
    }

    /// Removes `key`. Returns false if it was not present.
    pub fn delete(&self, key: &Key) -> Result<bool> {
        self.cursor().delete(key)
    }

    /// Number of levels from the root to the leaves.
    pub fn depth(&self) -> Result<usize> {
        let mut depth = 1;
        let mut node = self.load(self.root)?;
        while !node.is_leaf() {
            node = self.load(node.child_at(0)?)?;
            depth += 1;
        }
        Ok(depth)
    }

    /// Pages the tree occupies, overflow pages included.
    pub fn page_count(&self) -> Result<usize> {
        Ok(self.collect_pages()?.len())
    }

    /// Removes every entry, leaving an empty root leaf.
    pub fn clear(&self) -> Result<()> {
        let pages = self.collect_pages()?;
        for pgno in pages.into_iter().filter(|&p| p != self.root) {
            self.pager.free_page(pgno)?;
        }
        self.store(self.root, &BTreePage::new(self.kind.leaf_type()))?;
        debug!(root = self.root.as_u32(), "cleared b-tree");
        Ok(())
    }

    /// Frees every page of the tree. A tree rooted on page 1 is cleared
    /// instead, since page 1 always stays allocated.
    pub fn drop_tree(self) -> Result<()> {
        if self.root.as_u32() == 1 {
            return self.clear();
        }
        for pgno in self.collect_pages()? {
            self.pager.free_page(pgno)?;
        }
        debug!(root = self.root.as_u32(), "dropped b-tree");
        Ok(())
    }

    /// Every page of the tree, found by walking it from the root.
    fn collect_pages(&self) -> Result<Vec<PageNumber>> {
        let usable = self.usable();
        let mut pages = Vec::new();
        let mut stack = vec![self.root];
        while let Some(pgno) = stack.pop() {
            let node = self.load(pgno)?;
            pages.push(pgno);
            for i in 0..node.cells.len() {
                let info = node.cell_info(i, usable)?;
                if let Some(first) = info.overflow {
                    let spilled = info.payload_len - info.local.len() as u64;
                    pages.extend(overflow::chain_pages(&self.pager, first, spilled)?);
                }
            }
            for i in 0..node.child_count() {
                stack.push(node.child_at(i)?);
            }
        }
        Ok(pages)
    }

    pub(super) fn usable(&self) -> usize {
        self.pager.usable_size()
    }

    /// Bytes available to the B-tree page stored on `pgno`.
    pub(super) fn capacity(&self, pgno: PageNumber) -> usize {
        self.usable() - header_offset(pgno)
    }

    /// Reads and decodes page `pgno`, checking it belongs to this kind of tree.
    pub(super) fn load(&self, pgno: PageNumber) -> Result<BTreePage> {
        let page = self.pager.read_page(pgno)?;
        let node = BTreePage::decode(&page.data(), header_offset(pgno), self.usable())?;
        if TreeKind::of(node.page_type) != self.kind {
            return Err(LodeError::corrupt(format!(
                "page {} has type {:?} in a {:?} tree",
                pgno.as_u32(),
                node.page_type,
                self.kind
            )));
        }
        Ok(node)
    }

    pub(super) fn store(&self, pgno: PageNumber, node: &BTreePage) -> Result<()> {
        let mut page = self.pager.page_mut(pgno)?;
        node.encode(&mut page.data_mut(), header_offset(pgno), self.usable())?;
        Ok(())
    }

    pub(super) fn check_key(&self, key: &Key) -> Result<()> {
        if key.kind() != self.kind {
            return Err(LodeError::Misuse("key type does not match the tree"));
        }
        Ok(())
    }

    pub(super) fn compare(&self, a: &Key, b: &Key) -> Ordering {
        match (a, b) {
            (Key::Row(a), Key::Row(b)) => a.cmp(b),
            (Key::Bytes(a), Key::Bytes(b)) => self.comparator.compare(a, b),
            (Key::Row(_), Key::Bytes(_)) => Ordering::Less,
            (Key::Bytes(_), Key::Row(_)) => Ordering::Greater,
        }
    }

    /// Key of cell `idx`, leaf or divider.
    pub(super) fn cell_key(&self, node: &BTreePage, idx: usize) -> Result<Key> {
        let info = node.cell_info(idx, self.usable())?;
        match info.rowid {
            Some(rowid) => Ok(Key::Row(rowid)),
            None => {
                let payload = overflow::read_payload(&self.pager, &node.cells[idx], &info)?;
                let (key, _) = split_index_payload(&payload)?;
                Ok(Key::Bytes(key.to_vec()))
            }
        }
    }

    /// Key and value of leaf cell `idx`.
    pub(super) fn cell_entry(&self, node: &BTreePage, idx: usize) -> Result<(Key, Vec<u8>)> {
        let info = node.cell_info(idx, self.usable())?;
        let payload = overflow::read_payload(&self.pager, &node.cells[idx], &info)?;
        match info.rowid {
            Some(rowid) => Ok((Key::Row(rowid), payload)),
            None => {
                let (key, value) = split_index_payload(&payload)?;
                Ok((Key::Bytes(key.to_vec()), value.to_vec()))
            }
        }
    }

    /// Builds the leaf cell for an entry, spilling large payloads to
    /// overflow pages.
    pub(super) fn leaf_cell(&self, key: &Key, value: &[u8]) -> Result<Vec<u8>> {
        let usable = self.usable();
        match key {
            Key::Row(rowid) => {
                let len = value.len() as u64;
                let local = local_payload_size(len, usable, PageType::TableLeaf);
                let overflow = overflow::write_chain(&self.pager, &value[local..])?;
                Ok(table_leaf_cell(*rowid, len, &value[..local], overflow))
            }
            Key::Bytes(bytes) => {
                let payload = index_payload(bytes, value);
                let len = payload.len() as u64;
                let local = local_payload_size(len, usable, PageType::IndexLeaf);
                let overflow = overflow::write_chain(&self.pager, &payload[local..])?;
                Ok(index_cell(None, len, &payload[..local], overflow))
            }
        }
    }

    /// Builds an interior cell dividing `left` from its right neighbour at
    /// `key`.
    pub(super) fn divider_cell(&self, left: PageNumber, key: &Key) -> Result<Vec<u8>> {
        match key {
            Key::Row(rowid) => Ok(table_interior_cell(left, *rowid)),
            Key::Bytes(bytes) => {
                let payload = index_payload(bytes, &[]);
                let len = payload.len() as u64;
                let local = local_payload_size(len, self.usable(), PageType::IndexInterior);
                let overflow = overflow::write_chain(&self.pager, &payload[local..])?;
                Ok(index_cell(Some(left), len, &payload[..local], overflow))
            }
        }
    }

    /// Frees the overflow chain of a cell that is going away.
    pub(super) fn free_cell(&self, page_type: PageType, cell: &[u8]) -> Result<()> {
        let info = crate::storage::page::parse_cell(page_type, cell, self.usable())?;
        overflow::free_chain(&self.pager, &info)
    }

    /// Finds the first cell of a leaf whose key is not less than `key`.
    /// Returns its index and whether the key matches exactly.
    fn search_leaf(&self, node: &BTreePage, key: &Key) -> Result<(usize, bool)> {
        let (mut lo, mut hi) = (0, node.cells.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.compare(&self.cell_key(node, mid)?, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    /// Child of an interior page whose key range holds `key`: the first
    /// divider not less than the key, or the right child.
    fn search_interior(&self, node: &BTreePage, key: &Key) -> Result<usize> {
        let (mut lo, mut hi) = (0, node.cells.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.compare(&self.cell_key(node, mid)?, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Walks from the root to the leaf that holds or would hold `key`.
    pub(super) fn descend(&self, key: &Key) -> Result<(Path, bool)> {
        let mut path = Path::new();
        let mut pgno = self.root;
        loop {
            let node = self.load(pgno)?;
            if node.is_leaf() {
                let (idx, found) = self.search_leaf(&node, key)?;
                path.push((pgno, idx));
                return Ok((path, found));
            }
            let idx = self.search_interior(&node, key)?;
            path.push((pgno, idx));
            pgno = node.child_at(idx)?;
            if path.len() > MAX_DEPTH {
                return Err(LodeError::corrupt("b-tree is deeper than any valid tree"));
            }
        }
    }

    /// Walks from `pgno` down its left-most (or right-most) edge, extending
    /// `path` down to a leaf.
    pub(super) fn descend_edge(&self, path: &mut Path, mut pgno: PageNumber, rightmost: bool) -> Result<BTreePage> {
        loop {
            let node = self.load(pgno)?;
            if node.is_leaf() {
                let idx = if rightmost { node.cells.len().saturating_sub(1) } else { 0 };
                path.push((pgno, idx));
                return Ok(node);
            }
            let idx = if rightmost { node.cells.len() } else { 0 };
            path.push((pgno, idx));
            pgno = node.child_at(idx)?;
            if path.len() > MAX_DEPTH {
                return Err(LodeError::corrupt("b-tree is deeper than any valid tree"));
            }
        }
    }

    /// Stores `key`/`value` at the leaf position `path` ends in.
    pub(super) fn insert_at(&self, path: &Path, found: bool, key: &Key, value: &[u8]) -> Result<()> {
        let (leaf_pgno, idx) = *path.last().ok_or(LodeError::Misuse("empty b-tree path"))?;
        let mut leaf = self.load(leaf_pgno)?;
        let cell = self.leaf_cell(key, value)?;
        if found {
            let old = std::mem::replace(&mut leaf.cells[idx], cell);
            self.free_cell(leaf.page_type, &old)?;
        } else {
            leaf.cells.insert(idx, cell);
        }
        self.balance(path, path.len() - 1, leaf)
    }

    /// Removes the leaf cell `path` ends in.
    pub(super) fn delete_at(&self, path: &Path) -> Result<()> {
        let (leaf_pgno, idx) = *path.last().ok_or(LodeError::Misuse("empty b-tree path"))?;
        let mut leaf = self.load(leaf_pgno)?;
        if idx >= leaf.cells.len() {
            return Err(LodeError::corrupt("delete past the end of a leaf"));
        }
        let old = leaf.cells.remove(idx);
        self.free_cell(leaf.page_type, &old)?;
        self.balance(path, path.len() - 1, leaf)
    }
}

/// Deeper than this a tree of 2^32 pages cannot be
const MAX_DEPTH: usize = 64;

/// Index entries store the key length, the key, then the value.
fn index_payload(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(key.len() + value.len() + 9);
    put_varint(&mut payload, key.len() as u64);
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);
    payload
}

fn split_index_payload(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, n) = read_varint(payload)?;
    let end = n
        .checked_add(len as usize)
        .filter(|&end| end <= payload.len())
        .ok_or_else(|| LodeError::corrupt("index key runs past its payload"))?;
    Ok((&payload[n..end], &payload[end..]))
}
