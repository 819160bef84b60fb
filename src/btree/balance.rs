//! Keeping pages within their size bounds after an insert or delete.
//!
//! A modified page is written back through [`BTree::balance`], which walks up
//! the path it was reached by. An overfull page is split into as many pages
//! as its cells need; an underfull one is combined with a sibling and
//! either merged into one page or spread evenly over two. Each step changes
//! the parent, which is then balanced in turn. The root is handled apart so
//! its page number never changes.

use std::ops::Range;

use tracing::debug;

use crate::common::{LodeError, PageNumber, Result};
use crate::storage::page::{set_left_child, BTreePage};

use super::tree::Path;
use super::BTree;

impl BTree {
    /// Writes `node`, the modified page at `path[level]`, and rebalances
    /// the pages above it as needed.
    pub(super) fn balance(&self, path: &Path, mut level: usize, mut node: BTreePage) -> Result<()> {
        loop {
            let pgno = path[level].0;
            if level == 0 {
                return self.balance_root(pgno, node);
            }

            let overfull = !node.fits(self.capacity(pgno));
            if !overfull && !self.is_underfull(&node) {
                return self.store(pgno, &node);
            }

            let (parent_pgno, child_idx) = path[level - 1];
            let mut parent = self.load(parent_pgno)?;
            if overfull {
                self.distribute(&mut parent, child_idx, vec![pgno], node)?;
            } else if !self.combine_with_sibling(&mut parent, child_idx, pgno, node)? {
                // an only child may now fit back into the root
                return if level == 1 {
                    self.balance_root(parent_pgno, parent)
                } else {
                    Ok(())
                };
            }
            node = parent;
            level -= 1;
        }
    }

    fn is_underfull(&self, node: &BTreePage) -> bool {
        node.content_size() < self.usable() / 4
    }

    /// The root grows by pushing its content into a new child, and shrinks
    /// by absorbing its only child.
    fn balance_root(&self, root: PageNumber, mut node: BTreePage) -> Result<()> {
        loop {
            let capacity = self.capacity(root);
            if !node.fits(capacity) {
                let child = self.pager.allocate_page()?;
                let mut parent = BTreePage::new_interior(node.page_type, child);
                self.distribute(&mut parent, 0, vec![child], node)?;
                debug!(root = root.as_u32(), "b-tree grew a level");
                node = parent;
                continue;
            }

            if !node.is_leaf() && node.cells.is_empty() {
                let child_pgno = node.child_at(0)?;
                let child = self.load(child_pgno)?;
                if child.fits(capacity) {
                    self.pager.free_page(child_pgno)?;
                    debug!(root = root.as_u32(), "b-tree lost a level");
                    node = child;
                    continue;
                }
            }
            return self.store(root, &node);
        }
    }

    /// Combines the underfull child at `idx` with a neighbour and spreads
    /// the result over one or two pages. Returns false if the parent has no
    /// other child, in which case only the child is written.
    fn combine_with_sibling(
        &self,
        parent: &mut BTreePage,
        idx: usize,
        pgno: PageNumber,
        node: BTreePage,
    ) -> Result<bool> {
        if parent.child_count() < 2 {
            self.store(pgno, &node)?;
            return Ok(false);
        }

        let (left_idx, left_pgno, left, right_pgno, right) = if idx > 0 {
            let sibling = parent.child_at(idx - 1)?;
            (idx - 1, sibling, self.load(sibling)?, pgno, node)
        } else {
            let sibling = parent.child_at(idx + 1)?;
            (idx, pgno, node, sibling, self.load(sibling)?)
        };
        if left.page_type != right.page_type {
            return Err(LodeError::corrupt(format!(
                "sibling pages {} and {} differ in type",
                left_pgno.as_u32(),
                right_pgno.as_u32()
            )));
        }

        let mut divider = parent.cells.remove(left_idx);

        let mut combined = BTreePage {
            page_type: left.page_type,
            right_child: right.right_child,
            cells: left.cells,
        };
        if combined.is_leaf() {
            self.free_cell(parent.page_type, &divider)?;
        } else {
            // the divider moves down between the two halves
            let child = left
                .right_child
                .ok_or_else(|| LodeError::corrupt("interior page without right child"))?;
            set_left_child(&mut divider, child);
            combined.cells.push(divider);
        }
        combined.cells.extend(right.cells);

        debug!(
            left = left_pgno.as_u32(),
            right = right_pgno.as_u32(),
            "rebalancing sibling pages"
        );
        self.distribute(parent, left_idx, vec![left_pgno, right_pgno], combined)?;
        Ok(true)
    }

    /// Spreads the cells of `combined` over as few pages as fit them, reusing
    /// `pages` first, and links the result into `parent` in place of child
    /// `idx`.
    fn distribute(
        &self,
        parent: &mut BTreePage,
        idx: usize,
        mut pages: Vec<PageNumber>,
        combined: BTreePage,
    ) -> Result<()> {
        // pages below the root never carry the database header
        let capacity = self.usable();
        let runs = if combined.fits(capacity) {
            vec![0..combined.cells.len()]
        } else {
            partition(&combined, capacity)
        };

        while pages.len() < runs.len() {
            pages.push(self.pager.allocate_page()?);
        }
        for extra in pages.split_off(runs.len()) {
            self.pager.free_page(extra)?;
        }
        if runs.len() > 1 {
            debug!(
                page = pages[0].as_u32(),
                pieces = runs.len(),
                cells = combined.cells.len(),
                "split page"
            );
        }

        let mut dividers = Vec::with_capacity(runs.len() - 1);
        for (i, run) in runs.iter().enumerate() {
            let last = i + 1 == runs.len();
            let mut piece = BTreePage {
                page_type: combined.page_type,
                right_child: None,
                cells: combined.cells[run.clone()].to_vec(),
            };
            if combined.is_leaf() {
                if !last {
                    let key = self.cell_key(&piece, piece.cells.len() - 1)?;
                    dividers.push(self.divider_cell(pages[i], &key)?);
                }
            } else if last {
                piece.right_child = combined.right_child;
            } else {
                // the cell after the run is promoted into the parent
                piece.right_child = Some(combined.child_at(run.end)?);
                let mut promoted = combined.cells[run.end].clone();
                set_left_child(&mut promoted, pages[i]);
                dividers.push(promoted);
            }
            self.store(pages[i], &piece)?;
        }

        parent.set_child_at(idx, pages[runs.len() - 1]);
        for (i, divider) in dividers.into_iter().enumerate() {
            parent.cells.insert(idx + i, divider);
        }
        Ok(())
    }
}

/// Cuts the cells of an overfull page into runs that each fit in
/// `capacity`, balanced by bytes. Interior runs are separated by one cell,
/// which is promoted to the parent.
fn partition(node: &BTreePage, capacity: usize) -> Vec<Range<usize>> {
    let budget = capacity - node.page_type.header_size();
    let sizes = node.cells.iter().map(|c| c.len() + 2).collect::<Vec<_>>();
    let total = sizes.iter().sum::<usize>();
    let count = total.div_ceil(budget).max(2);
    let target = total.div_ceil(count);

    let mut runs = Vec::with_capacity(count);
    let (mut start, mut used, mut i) = (0, 0, 0);
    while i < sizes.len() {
        let size = sizes[i];
        let full = used + size > budget;
        let balanced = used + size / 2 > target && runs.len() + 1 < count;
        if used > 0 && (full || balanced) {
            runs.push(start..i);
            if !node.is_leaf() {
                i += 1;
            }
            start = i;
            used = 0;
            continue;
        }
        used += size;
        i += 1;
    }
    runs.push(start..sizes.len());
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageNumber;
    use crate::storage::page::{table_interior_cell, table_leaf_cell, PageType};

    #[test]
    fn test_partition_leaf_halves_by_bytes() {
        let mut node = BTreePage::new(PageType::TableLeaf);
        for rowid in 0..40 {
            node.cells.push(table_leaf_cell(rowid, 20, &[0u8; 20], None));
        }
        let runs = partition(&node, 512);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].end, runs[1].start);
        assert_eq!(runs[1].end, 40);
        assert!(runs[0].len().abs_diff(runs[1].len()) <= 2);
    }

    #[test]
    fn test_partition_large_cells_need_three_pages() {
        let mut node = BTreePage::new(PageType::TableLeaf);
        for rowid in 0..3 {
            node.cells.push(table_leaf_cell(rowid, 400, &[0u8; 400], None));
        }
        let runs = partition(&node, 512);
        assert_eq!(runs, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_partition_interior_promotes_separator() {
        let mut node = BTreePage::new_interior(PageType::TableLeaf, PageNumber::new(99));
        for rowid in 0..100 {
            node.cells.push(table_interior_cell(PageNumber::new(rowid as u32 + 2), rowid));
        }
        let runs = partition(&node, 512);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].end + 1, runs[1].start);
        assert_eq!(runs[1].end, 100);
    }
}
