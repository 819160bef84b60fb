use tracing::{debug, trace};

use crate::common::{LodeError, PageNumber, Result};
use crate::storage::page::FreelistTrunk;

use super::connection::PagerState;
use super::{Pager, TransactionState};

impl Pager {
    /// Hands out a zeroed page for the open write transaction, reusing a
    /// freelist page when there is one and growing the file otherwise.
    pub fn allocate_page(&self) -> Result<PageNumber> {
        let mut state = self.state.lock();
        if state.txn != TransactionState::Write {
            return Err(LodeError::Misuse("page allocation outside a write transaction"));
        }

        let pgno = match self.pop_free_page(&mut state)? {
            Some(pgno) => pgno,
            None => self.grow(&mut state)?,
        };
        drop(self.cache.insert_dirty(pgno, &vec![0u8; self.page_size()]));
        self.bump_change_seq();
        trace!(pgno = pgno.as_u32(), "allocated page");
        Ok(pgno)
    }

    fn pop_free_page(&self, state: &mut PagerState) -> Result<Option<PageNumber>> {
        let trunk_pgno = state.header.freelist_trunk;
        if trunk_pgno == 0 {
            return Ok(None);
        }
        let trunk_pgno = self.check_free_page(state, trunk_pgno)?;
        let usable = self.usable_size();
        let mut trunk = {
            let page = self.fetch_page(state, trunk_pgno)?;
            let data = page.data();
            FreelistTrunk::decode(&data, usable)?
        };

        let pgno = match trunk.leaves.pop() {
            Some(leaf) => {
                let leaf = self.check_free_page(state, leaf.as_u32())?;
                let mut page = self
                    .cache
                    .get_mut(trunk_pgno)
                    .ok_or_else(|| LodeError::corrupt("freelist trunk vanished from the cache"))?;
                trunk.encode(&mut page.data_mut());
                leaf
            }
            None => {
                state.header.freelist_trunk = trunk.next.map_or(0, |p| p.as_u32());
                trunk_pgno
            }
        };
        state.header.freelist_count = state
            .header
            .freelist_count
            .checked_sub(1)
            .ok_or_else(|| LodeError::corrupt("freelist count is smaller than the list"))?;
        Ok(Some(pgno))
    }

    fn check_free_page(&self, state: &PagerState, pgno: u32) -> Result<PageNumber> {
        if pgno < 2 || pgno > state.db_size {
            return Err(LodeError::corrupt(format!(
                "freelist refers to page {pgno} of {}",
                state.db_size
            )));
        }
        Ok(PageNumber::new(pgno))
    }

    /// Extends the database by one page, stepping over the page that holds
    /// the lock bytes.
    fn grow(&self, state: &mut PagerState) -> Result<PageNumber> {
        let mut next = state.db_size as u64 + 1;
        if next == self.config().lock_byte_page() as u64 {
            next += 1;
        }
        if next > self.config().max_page_count as u64 {
            return Err(LodeError::OutOfSpace(format!(
                "database is limited to {} pages",
                self.config().max_page_count
            )));
        }
        state.db_size = next as u32;
        Ok(PageNumber::new(state.db_size))
    }

    /// Returns `pgno` to the freelist. The page content is forgotten unless
    /// the page becomes a trunk.
    pub fn free_page(&self, pgno: PageNumber) -> Result<()> {
        let mut state = self.state.lock();
        self.check_writable(&state, pgno)?;
        if pgno.as_u32() == 1 {
            return Err(LodeError::Misuse("page 1 cannot be freed"));
        }

        let usable = self.usable_size();
        let trunk_pgno = state.header.freelist_trunk;
        if trunk_pgno != 0 {
            let trunk_pgno = self.check_free_page(&state, trunk_pgno)?;
            let mut trunk = {
                let page = self.fetch_page(&mut state, trunk_pgno)?;
                let data = page.data();
                FreelistTrunk::decode(&data, usable)?
            };
            if trunk.leaves.len() < FreelistTrunk::leaf_capacity(usable) {
                trunk.leaves.push(pgno);
                let mut page = self
                    .cache
                    .get_mut(trunk_pgno)
                    .ok_or_else(|| LodeError::corrupt("freelist trunk vanished from the cache"))?;
                trunk.encode(&mut page.data_mut());
                drop(page);
                self.cache.discard(pgno);
                state.header.freelist_count += 1;
                self.bump_change_seq();
                trace!(pgno = pgno.as_u32(), trunk = trunk_pgno.as_u32(), "freed page");
                return Ok(());
            }
        }

        let trunk = FreelistTrunk {
            next: (trunk_pgno != 0).then_some(PageNumber::new(trunk_pgno)),
            leaves: Vec::new(),
        };
        let mut data = vec![0u8; self.page_size()];
        trunk.encode(&mut data);
        drop(self.cache.insert_dirty(pgno, &data));
        state.header.freelist_trunk = pgno.as_u32();
        state.header.freelist_count += 1;
        self.bump_change_seq();
        debug!(pgno = pgno.as_u32(), "started freelist trunk");
        Ok(())
    }

    /// Every page on the freelist, trunks included, in list order.
    pub fn freelist_pages(&self) -> Result<Vec<PageNumber>> {
        let mut state = self.state.lock();
        if state.txn == TransactionState::Idle {
            return Err(LodeError::Misuse("freelist walk outside a transaction"));
        }
        let usable = self.usable_size();
        let expected = state.header.freelist_count as usize;
        let mut pages = Vec::with_capacity(expected);
        let mut next = state.header.freelist_trunk;
        while next != 0 {
            let trunk_pgno = self.check_free_page(&state, next)?;
            if pages.len() > expected {
                return Err(LodeError::corrupt("freelist is longer than its count"));
            }
            let trunk = {
                let page = self.fetch_page(&mut state, trunk_pgno)?;
                let data = page.data();
                FreelistTrunk::decode(&data, usable)?
            };
            pages.push(trunk_pgno);
            pages.extend(trunk.leaves);
            next = trunk.next.map_or(0, |p| p.as_u32());
        }
        if pages.len() != expected {
            return Err(LodeError::corrupt(format!(
                "freelist holds {} pages but the header counts {expected}",
                pages.len()
            )));
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use crate::common::{LodeError, PageNumber, PagerConfig};
    use crate::lock::MemoryLockTable;
    use crate::pager::Pager;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path, config: PagerConfig) -> Pager {
        let table = MemoryLockTable::new();
        Pager::open_with_lock_manager(dir.join("t.db"), config, Box::new(table.connect())).unwrap()
    }

    #[test]
    fn test_freed_pages_are_reused() {
        let dir = tempdir().unwrap();
        let pager = open(dir.path(), PagerConfig::default().with_page_size(512));
        pager.begin_write().unwrap();
        let pages = (0..5).map(|_| pager.allocate_page().unwrap()).collect::<Vec<_>>();
        assert_eq!(pages[0], PageNumber::new(2));
        assert_eq!(pager.db_size(), 6);

        for &pgno in &pages[..3] {
            pager.free_page(pgno).unwrap();
        }
        let mut free = pager.freelist_pages().unwrap();
        free.sort();
        assert_eq!(free, pages[..3].to_vec());
        assert_eq!(pager.header().freelist_count, 3);

        let reused = pager.allocate_page().unwrap();
        assert!(pages[..3].contains(&reused));
        assert_eq!(pager.db_size(), 6);
        assert!(pager.read_page(reused).unwrap().data().iter().all(|&b| b == 0));
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        assert_eq!(pager.freelist_pages().unwrap().len(), 2);
    }

    #[test]
    fn test_trunk_overflow_starts_new_trunk() {
        let dir = tempdir().unwrap();
        let pager = open(dir.path(), PagerConfig::default().with_page_size(512));
        pager.begin_write().unwrap();
        // one trunk holds 120 leaves on a 512-byte page
        let pages = (0..130).map(|_| pager.allocate_page().unwrap()).collect::<Vec<_>>();
        for &pgno in &pages {
            pager.free_page(pgno).unwrap();
        }
        assert_eq!(pager.freelist_pages().unwrap().len(), 130);
        for _ in 0..130 {
            pager.allocate_page().unwrap();
        }
        assert_eq!(pager.header().freelist_count, 0);
        assert_eq!(pager.header().freelist_trunk, 0);
        assert_eq!(pager.db_size(), 131);
    }

    #[test]
    fn test_max_page_count_is_enforced() {
        let dir = tempdir().unwrap();
        let pager = open(
            dir.path(),
            PagerConfig::default().with_page_size(512).with_max_page_count(3),
        );
        pager.begin_write().unwrap();
        pager.allocate_page().unwrap();
        pager.allocate_page().unwrap();
        assert!(matches!(pager.allocate_page(), Err(LodeError::OutOfSpace(_))));
        assert!(matches!(
            pager.free_page(PageNumber::new(1)),
            Err(LodeError::Misuse(_))
        ));
    }
}
