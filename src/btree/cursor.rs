use crate::common::{PageNumber, Result};

use super::tree::Path;
use super::{BTree, InsertionPoint, Key, SeekResult};

/// Where a cursor stands
#[derive(Debug, Clone)]
enum CursorState {
    /// Not on any entry
    Invalid,
    /// On the leaf entry `path` ends in, which has key `key`
    OnLeaf { path: Path, key: Key },
    /// The tree changed since the cursor was positioned; the path is gone and
    /// the position is recovered by seeking `key` again
    Saved { key: Key },
}

/// How a saved position was recovered
enum Restored {
    /// The position was still current
    Unchanged,
    /// Back on the saved entry
    Exact,
    /// The saved entry is gone; the cursor is on the entry after it
    Successor,
}

/// Cursor walks the entries of one tree in key order.
///
/// The cursor keeps the path from the root to its leaf instead of relying on
/// parent or sibling pointers in pages. It also remembers the key it stands
/// on, so when any page changes (through this cursor, another cursor, or
/// another connection's commit becoming visible) it re-seeks that key before
/// moving on.
pub struct Cursor {
    tree: BTree,
    state: CursorState,
    /// Pager change sequence the path was computed at
    seq: u64,
}

impl Cursor {
    pub(super) fn new(tree: BTree) -> Self {
        Self {
            tree,
            state: CursorState::Invalid,
            seq: 0,
        }
    }

    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Returns true if the cursor stands on an entry.
    pub fn is_valid(&self) -> bool {
        !matches!(self.state, CursorState::Invalid)
    }

    /// Moves to `key`, or to the smallest larger entry if it is absent.
    pub fn seek(&mut self, key: &Key) -> Result<SeekResult> {
        self.tree.check_key(key)?;
        let (mut path, found) = self.tree.descend(key)?;
        self.seq = self.tree.pager.change_seq();
        if found {
            self.state = CursorState::OnLeaf {
                path,
                key: key.clone(),
            };
            return Ok(SeekResult::Found);
        }

        let &(page, index) = path.last().unwrap_or(&(self.tree.root(), 0));
        let point = InsertionPoint { page, index };
        let leaf = self.tree.load(page)?;
        if index < leaf.cells.len() {
            let key = self.tree.cell_key(&leaf, index)?;
            self.state = CursorState::OnLeaf { path, key };
        } else {
            self.step_to_next_leaf(&mut path)?;
        }
        Ok(SeekResult::NotFound(point))
    }

    /// Moves to the smallest entry. Returns false if the tree is empty.
    pub fn first(&mut self) -> Result<bool> {
        self.edge(false)
    }

    /// Moves to the largest entry. Returns false if the tree is empty.
    pub fn last(&mut self) -> Result<bool> {
        self.edge(true)
    }

    fn edge(&mut self, rightmost: bool) -> Result<bool> {
        self.seq = self.tree.pager.change_seq();
        self.land(&mut Path::new(), self.tree.root(), rightmost)?;
        Ok(self.is_valid())
    }

    /// Moves to the next entry. Returns false once past the last one.
    pub fn next(&mut self) -> Result<bool> {
        if let Restored::Successor = self.restore()? {
            return Ok(self.is_valid());
        }
        let CursorState::OnLeaf { mut path, .. } =
            std::mem::replace(&mut self.state, CursorState::Invalid)
        else {
            return Ok(false);
        };
        let (pgno, idx) = path.last().copied().unwrap_or((self.tree.root(), 0));
        let leaf = self.tree.load(pgno)?;
        if idx + 1 < leaf.cells.len() {
            let last = path.len() - 1;
            path[last].1 = idx + 1;
            let key = self.tree.cell_key(&leaf, idx + 1)?;
            self.state = CursorState::OnLeaf { path, key };
        } else {
            self.step_to_next_leaf(&mut path)?;
        }
        Ok(self.is_valid())
    }

    /// Moves to the previous entry. Returns false once before the first one.
    pub fn prev(&mut self) -> Result<bool> {
        let restored = self.restore()?;
        if let (Restored::Successor, false) = (&restored, self.is_valid()) {
            // the saved entry was the last one and is gone
            return self.last();
        }
        let CursorState::OnLeaf { mut path, .. } =
            std::mem::replace(&mut self.state, CursorState::Invalid)
        else {
            return Ok(false);
        };
        let (pgno, idx) = path.last().copied().unwrap_or((self.tree.root(), 0));
        if idx > 0 {
            let leaf = self.tree.load(pgno)?;
            let last = path.len() - 1;
            path[last].1 = idx - 1;
            let key = self.tree.cell_key(&leaf, idx - 1)?;
            self.state = CursorState::OnLeaf { path, key };
        } else {
            self.step_to_prev_leaf(&mut path)?;
        }
        Ok(self.is_valid())
    }

    /// Key of the current entry.
    pub fn key(&mut self) -> Result<Option<Key>> {
        self.restore()?;
        Ok(match &self.state {
            CursorState::OnLeaf { key, .. } => Some(key.clone()),
            _ => None,
        })
    }

    /// Value of the current entry.
    pub fn value(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.entry()?.map(|(_, value)| value))
    }

    /// Key and value of the current entry.
    pub fn entry(&mut self) -> Result<Option<(Key, Vec<u8>)>> {
        self.restore()?;
        let CursorState::OnLeaf { path, .. } = &self.state else {
            return Ok(None);
        };
        let &(pgno, idx) = path.last().unwrap_or(&(self.tree.root(), 0));
        let leaf = self.tree.load(pgno)?;
        self.tree.cell_entry(&leaf, idx).map(Some)
    }

    /// Stores `value` under `key`, replacing any previous value, and leaves
    /// the cursor on the new entry.
    pub fn insert(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        self.tree.check_key(key)?;
        let (path, found) = self.tree.descend(key)?;
        self.tree.insert_at(&path, found, key, value)?;
        self.state = CursorState::Saved { key: key.clone() };
        Ok(())
    }

    /// Removes `key`. The cursor is left just before the entry that followed
    /// it, so `next` moves onto that entry. Returns false if the key was
    /// absent.
    pub fn delete(&mut self, key: &Key) -> Result<bool> {
        self.tree.check_key(key)?;
        let (path, found) = self.tree.descend(key)?;
        if found {
            self.tree.delete_at(&path)?;
        }
        self.state = CursorState::Saved { key: key.clone() };
        Ok(found)
    }

    /// Re-seeks the remembered key if any page changed since the path was
    /// computed.
    fn restore(&mut self) -> Result<Restored> {
        if let CursorState::OnLeaf { key, .. } = &self.state {
            if self.seq == self.tree.pager.change_seq() {
                return Ok(Restored::Unchanged);
            }
            self.state = CursorState::Saved { key: key.clone() };
        }
        let CursorState::Saved { key } = &self.state else {
            return Ok(Restored::Unchanged);
        };
        let key = key.clone();
        Ok(match self.seek(&key)? {
            SeekResult::Found => Restored::Exact,
            SeekResult::NotFound(_) => Restored::Successor,
        })
    }

    /// Climbs `path` to the first ancestor with a child to the right and
    /// descends to that child's left-most leaf.
    fn step_to_next_leaf(&mut self, path: &mut Path) -> Result<()> {
        path.pop();
        while let Some((pgno, idx)) = path.pop() {
            let node = self.tree.load(pgno)?;
            if idx + 1 < node.child_count() {
                path.push((pgno, idx + 1));
                let child = node.child_at(idx + 1)?;
                return self.land(path, child, false);
            }
        }
        self.state = CursorState::Invalid;
        Ok(())
    }

    /// Mirror of [`Cursor::step_to_next_leaf`].
    fn step_to_prev_leaf(&mut self, path: &mut Path) -> Result<()> {
        path.pop();
        while let Some((pgno, idx)) = path.pop() {
            if idx > 0 {
                let node = self.tree.load(pgno)?;
                path.push((pgno, idx - 1));
                let child = node.child_at(idx - 1)?;
                return self.land(path, child, true);
            }
        }
        self.state = CursorState::Invalid;
        Ok(())
    }

    /// Descends from `child` to the first (or last) entry below it, moving
    /// on past empty leaves.
    fn land(&mut self, path: &mut Path, child: PageNumber, rightmost: bool) -> Result<()> {
        let leaf = self.tree.descend_edge(path, child, rightmost)?;
        if leaf.cells.is_empty() {
            return if rightmost {
                self.step_to_prev_leaf(path)
            } else {
                self.step_to_next_leaf(path)
            };
        }
        let idx = path.last().map_or(0, |&(_, idx)| idx);
        let key = self.tree.cell_key(&leaf, idx)?;
        self.state = CursorState::OnLeaf {
            path: std::mem::take(path),
            key,
        };
        Ok(())
    }
}
