use std::cmp::Ordering;
use std::collections::BTreeSet;

use tracing::debug;

use crate::common::{LodeError, PageNumber, Result};

use super::overflow;
use super::{BTree, Key};

/// Key range a subtree must stay within: above `lower`, at most `upper`
#[derive(Clone, Copy)]
struct Bounds<'a> {
    lower: Option<&'a Key>,
    upper: Option<&'a Key>,
}

impl BTree {
    /// Walks the whole tree checking page types, key order, separator
    /// bounds, equal leaf depth and overflow chains. Returns every page the
    /// tree uses.
    pub fn check_integrity(&self) -> Result<BTreeSet<PageNumber>> {
        let mut seen = BTreeSet::new();
        let mut leaf_depth = None;
        let bounds = Bounds {
            lower: None,
            upper: None,
        };
        self.check_page(self.root(), bounds, 1, &mut leaf_depth, &mut seen)?;
        debug!(
            root = self.root().as_u32(),
            pages = seen.len(),
            depth = leaf_depth.unwrap_or(1),
            "b-tree integrity check passed"
        );
        Ok(seen)
    }

    fn check_page(
        &self,
        pgno: PageNumber,
        bounds: Bounds<'_>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        seen: &mut BTreeSet<PageNumber>,
    ) -> Result<()> {
        if !seen.insert(pgno) {
            return Err(LodeError::corrupt(format!(
                "page {} is referenced twice",
                pgno.as_u32()
            )));
        }
        let node = self.load(pgno)?;

        let mut keys = Vec::with_capacity(node.cells.len());
        for i in 0..node.cells.len() {
            let key = self.cell_key(&node, i)?;
            let in_bounds = bounds
                .lower
                .map_or(true, |lower| self.compare(&key, lower) == Ordering::Greater)
                && bounds
                    .upper
                    .map_or(true, |upper| self.compare(&key, upper) != Ordering::Greater);
            if !in_bounds {
                return Err(LodeError::corrupt(format!(
                    "key {key} on page {} is outside its parent's range",
                    pgno.as_u32()
                )));
            }
            if let Some(prev) = keys.last() {
                if self.compare(prev, &key) != Ordering::Less {
                    return Err(LodeError::corrupt(format!(
                        "keys out of order on page {} at cell {i}",
                        pgno.as_u32()
                    )));
                }
            }

            let info = node.cell_info(i, self.usable())?;
            if let Some(first) = info.overflow {
                let spilled = info.payload_len - info.local.len() as u64;
                for page in overflow::chain_pages(&self.pager, first, spilled)? {
                    if !seen.insert(page) {
                        return Err(LodeError::corrupt(format!(
                            "overflow page {} is referenced twice",
                            page.as_u32()
                        )));
                    }
                }
            }
            keys.push(key);
        }

        if node.is_leaf() {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(LodeError::corrupt(format!(
                        "leaf page {} at depth {depth}, other leaves at depth {expected}",
                        pgno.as_u32()
                    )));
                }
                Some(_) => {}
            }
            return Ok(());
        }

        for i in 0..node.child_count() {
            let child_bounds = Bounds {
                lower: if i == 0 { bounds.lower } else { keys.get(i - 1) },
                upper: keys.get(i).or(bounds.upper),
            };
            self.check_page(node.child_at(i)?, child_bounds, depth + 1, leaf_depth, seen)?;
        }
        Ok(())
    }
}
