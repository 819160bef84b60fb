use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::buffer::{PageCache, PageMut, PageRef};
use crate::common::{
    FrameNumber, LodeError, PageNumber, PagerConfig, Result, SyncMode, DB_HEADER_SIZE,
    READ_MARK_COUNT,
};
use crate::lock::{BusyHandler, LockLevel, LockManager, Slot, SlotMode};
use crate::storage::disk::{sidecar_path, DiskManager};
use crate::storage::page::{peek_change_counter, BTreePage, DatabaseHeader, PageType};
use crate::wal::{CheckpointMode, Wal, WalSalts};

use super::{Snapshot, TransactionState};

/// Attempts at pinning a consistent snapshot before reporting `Busy`
const MAX_READ_ATTEMPTS: usize = 100;

/// Mutable connection state, guarded by the pager mutex
pub(super) struct PagerState {
    pub(super) wal: Wal,
    pub(super) txn: TransactionState,
    pub(super) snapshot: Option<Snapshot>,
    /// Database header as of the snapshot, plus changes of the open write
    /// transaction
    pub(super) header: DatabaseHeader,
    /// Database size in pages, including pages allocated by the open write
    /// transaction
    pub(super) db_size: u32,
    /// Header and size to restore on rollback
    pub(super) saved: Option<(DatabaseHeader, u32)>,
    pub(super) holds_wal_write: bool,
    /// Cached pages reflect the committed state through this frame
    pub(super) cache_frame: FrameNumber,
    pub(super) cache_salts: Option<WalSalts>,
    /// Change counter of the main file when the cache was last checked
    pub(super) file_change_counter: Option<u32>,
}

/// Pager is one connection to a database file.
///
/// It serves page images from its cache, the write-ahead log or the main
/// file according to the transaction's snapshot, collects dirty pages of a
/// write transaction, and appends them to the log at commit. All methods
/// take `&self`; a connection is meant to be used by one thread at a time,
/// and the internal mutex only keeps it sound when shared.
pub struct Pager {
    config: PagerConfig,
    path: PathBuf,
    pub(super) disk: DiskManager,
    pub(super) cache: PageCache,
    pub(super) locks: Box<dyn LockManager>,
    pub(super) busy: BusyHandler,
    pub(super) state: Mutex<PagerState>,
    /// Bumped whenever a page image this connection can see changes
    change_seq: AtomicU64,
}

impl Pager {
    /// Opens the database at `path`, coordinating with other connections
    /// and processes through POSIX advisory locks.
    #[cfg(unix)]
    pub fn open<P: AsRef<Path>>(path: P, config: PagerConfig) -> Result<Self> {
        let path = path.as_ref();
        let locks = crate::lock::PosixLockManager::open(path)?;
        // reads and writes go through the descriptor that holds the locks
        let disk = DiskManager::with_shared_file(locks.db_file(), path, config.page_size);
        Self::open_parts(path.to_path_buf(), config, disk, Box::new(locks))
    }

    /// Opens the database at `path` using `locks` for coordination.
    pub fn open_with_lock_manager<P: AsRef<Path>>(
        path: P,
        config: PagerConfig,
        locks: Box<dyn LockManager>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let disk = DiskManager::new(&path, config.page_size)?;
        Self::open_parts(path, config, disk, locks)
    }

    fn open_parts(
        path: PathBuf,
        mut config: PagerConfig,
        disk: DiskManager,
        locks: Box<dyn LockManager>,
    ) -> Result<Self> {
        if !PagerConfig::page_size_is_valid(config.page_size) {
            return Err(LodeError::format(format!(
                "invalid page size {}",
                config.page_size
            )));
        }

        let mut raw = [0u8; DB_HEADER_SIZE];
        if disk.read_at(0, &mut raw)? == DB_HEADER_SIZE {
            let header = DatabaseHeader::parse(&raw)?;
            if header.page_size != config.page_size {
                return Err(LodeError::format(format!(
                    "database page size {} does not match requested page size {}",
                    header.page_size, config.page_size
                )));
            }
            config.reserved_space = header.reserved_space;
        }
        if config.usable_size() < 480 {
            return Err(LodeError::format("reserved space leaves too small a page"));
        }

        let wal = Wal::open(sidecar_path(&path, "-wal"), config.page_size)?;
        let cache = PageCache::new(config.cache_size, config.lru_k, config.page_size);
        let header = DatabaseHeader::new(&config);
        debug!(path = %path.display(), page_size = config.page_size, "opened database");

        Ok(Self {
            busy: BusyHandler::new(config.busy_timeout),
            path,
            disk,
            cache,
            locks,
            state: Mutex::new(PagerState {
                wal,
                txn: TransactionState::Idle,
                snapshot: None,
                header,
                db_size: 0,
                saved: None,
                holds_wal_write: false,
                cache_frame: 0,
                cache_salts: None,
                file_change_counter: None,
            }),
            change_seq: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &PagerConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Bytes of each page available to the B-tree layer.
    pub fn usable_size(&self) -> usize {
        self.config.usable_size()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.state.lock().txn
    }

    pub fn lock_level(&self) -> LockLevel {
        self.locks.level()
    }

    /// Database size in pages as seen by the current transaction.
    pub fn db_size(&self) -> u32 {
        self.state.lock().db_size
    }

    /// Header as seen by the current transaction.
    pub fn header(&self) -> DatabaseHeader {
        self.state.lock().header.clone()
    }

    /// Snapshot of the open transaction, if any.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.state.lock().snapshot
    }

    /// Counter that moves whenever a page visible to this connection may have
    /// changed. Cursors compare it to decide whether to re-seek.
    pub fn change_seq(&self) -> u64 {
        self.change_seq.load(Ordering::Acquire)
    }

    pub(super) fn bump_change_seq(&self) {
        self.change_seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Committed frames currently in the log.
    pub fn wal_frame_count(&self) -> FrameNumber {
        self.state.lock().wal.max_frame()
    }

    /// Starts a read transaction on the newest committed state. Does nothing
    /// inside a transaction.
    pub fn begin_read(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.begin_read_locked(&mut state)
    }

    fn begin_read_locked(&self, state: &mut PagerState) -> Result<()> {
        if state.txn != TransactionState::Idle {
            return Ok(());
        }
        let busy = self.busy;
        busy.retry(|| self.try_begin_read(state))
    }

    fn try_begin_read(&self, state: &mut PagerState) -> Result<()> {
        self.locks.acquire(LockLevel::Shared)?;
        let snapshot = match self.acquire_snapshot(state) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.locks.release()?;
                return Err(e);
            }
        };
        state.snapshot = Some(snapshot);
        state.txn = TransactionState::Read;

        if let Err(e) = self.load_header(state) {
            self.end_transaction(state)?;
            return Err(e);
        }
        trace!(
            max_frame = snapshot.max_frame,
            slot = snapshot.read_slot,
            db_size = state.db_size,
            "read transaction started"
        );
        Ok(())
    }

    /// Brings the cache in line with the newest committed state and pins
    /// that state with a read mark.
    fn acquire_snapshot(&self, state: &mut PagerState) -> Result<Snapshot> {
        for _ in 0..MAX_READ_ATTEMPTS {
            self.sync_cache(state)?;
            let wal_end = state.wal.max_frame();
            let salts = state.wal.salts();
            let backfilled = self.backfilled(salts)?;

            let slot = if wal_end == backfilled {
                if !self.locks.try_lock_slot(Slot::ReadMark(0), SlotMode::Shared)? {
                    return Err(LodeError::Busy);
                }
                0
            } else {
                match self.claim_read_mark(wal_end)? {
                    Some(slot) => slot,
                    None => return Err(LodeError::Busy),
                }
            };

            // a restart or backfill may have slipped in before the slot was held
            let still_valid = state.wal.header_is_current()?
                && if slot == 0 {
                    self.backfilled(salts)? == wal_end
                } else {
                    self.locks.read_mark(slot)? == wal_end
                };
            if still_valid {
                return Ok(Snapshot {
                    max_frame: if slot == 0 { 0 } else { wal_end },
                    wal_end,
                    salts,
                    read_slot: slot,
                });
            }
            self.locks.unlock_slot(Slot::ReadMark(slot))?;
        }
        Err(LodeError::Busy)
    }

    pub(super) fn backfilled(&self, salts: Option<WalSalts>) -> Result<FrameNumber> {
        Ok(match salts {
            Some(salts) => self.locks.backfill()?.frames_for(salts.as_pair()),
            None => 0,
        })
    }

    /// Takes a read-mark slot recording `wal_end`, sharing one that already
    /// does or repurposing an idle one.
    fn claim_read_mark(&self, wal_end: FrameNumber) -> Result<Option<usize>> {
        for i in 1..READ_MARK_COUNT {
            if self.locks.read_mark(i)? == wal_end
                && self.locks.try_lock_slot(Slot::ReadMark(i), SlotMode::Shared)?
            {
                return Ok(Some(i));
            }
        }
        for i in 1..READ_MARK_COUNT {
            let slot = Slot::ReadMark(i);
            if self.locks.try_lock_slot(slot, SlotMode::Exclusive)? {
                self.locks.set_read_mark(i, wal_end)?;
                if self.locks.try_lock_slot(slot, SlotMode::Shared)? {
                    return Ok(Some(i));
                }
                self.locks.unlock_slot(slot)?;
            }
        }
        Ok(None)
    }

    /// Catches up with the log and the main file, dropping cached pages
    /// other connections changed.
    pub(super) fn sync_cache(&self, state: &mut PagerState) -> Result<()> {
        let restarted = state.wal.refresh()?;
        let salts = state.wal.salts();
        let wal_end = state.wal.max_frame();
        let mut invalidated = false;

        if restarted || salts != state.cache_salts {
            if !self.cache.is_empty() {
                debug!("log restarted, clearing page cache");
            }
            self.cache.clear();
            invalidated = true;
        } else if wal_end > state.cache_frame {
            for pgno in state.wal.pages_between(state.cache_frame, wal_end) {
                invalidated |= self.cache.discard(pgno);
            }
        }

        let mut raw = [0u8; DB_HEADER_SIZE];
        let counter = if self.disk.read_at(0, &mut raw)? == DB_HEADER_SIZE {
            peek_change_counter(&raw)
        } else {
            None
        };
        if counter != state.file_change_counter {
            if state.file_change_counter.is_some() {
                self.cache.clear();
                invalidated = true;
            }
            state.file_change_counter = counter;
        }

        state.cache_frame = wal_end;
        state.cache_salts = salts;
        if invalidated {
            self.bump_change_seq();
        }
        Ok(())
    }

    /// Reads the database header and size for the current snapshot.
    fn load_header(&self, state: &mut PagerState) -> Result<()> {
        let snapshot = state.snapshot.ok_or(LodeError::Misuse("no open transaction"))?;
        let wal_size = if snapshot.max_frame > 0 {
            state.wal.db_size_at(snapshot.max_frame)
        } else {
            None
        };
        let file_pages = self.disk.file_pages()?;

        if wal_size.is_none() && file_pages == 0 {
            state.header = DatabaseHeader::new(&self.config);
            state.db_size = 0;
            return Ok(());
        }

        let page = self.fetch_page(state, PageNumber::new(1))?;
        let header = DatabaseHeader::parse(&page.data())?;
        if header.page_size != self.config.page_size {
            return Err(LodeError::format(format!(
                "database page size {} does not match requested page size {}",
                header.page_size, self.config.page_size
            )));
        }
        state.db_size = wal_size.unwrap_or_else(|| header.trusted_page_count().unwrap_or(file_pages));
        state.header = header;
        Ok(())
    }

    /// Returns page `pgno` as of the current transaction.
    pub fn read_page(&self, pgno: PageNumber) -> Result<PageRef> {
        let mut state = self.state.lock();
        self.check_readable(&state, pgno)?;
        self.fetch_page(&mut state, pgno)
    }

    fn check_readable(&self, state: &PagerState, pgno: PageNumber) -> Result<()> {
        if state.txn == TransactionState::Idle {
            return Err(LodeError::Misuse("page read outside a transaction"));
        }
        if !pgno.is_valid() || pgno.as_u32() > state.db_size {
            return Err(LodeError::InvalidPageNumber(pgno));
        }
        Ok(())
    }

    /// Loads a page from the cache, the log, or the main file.
    pub(super) fn fetch_page(&self, state: &mut PagerState, pgno: PageNumber) -> Result<PageRef> {
        if let Some(page) = self.cache.get(pgno) {
            return Ok(page);
        }

        let max_frame = state.snapshot.map_or(0, |s| s.max_frame);
        let mut data = vec![0u8; self.config.page_size];
        match state.wal.find_frame(pgno, max_frame) {
            Some(frame) => state.wal.read_frame(frame, &mut data)?,
            None => self.disk.read_page(pgno, &mut data)?,
        }
        trace!(pgno = pgno.as_u32(), "loaded page");
        Ok(self.cache.insert(pgno, &data))
    }

    /// Returns page `pgno` for modification, marking it dirty.
    pub fn page_mut(&self, pgno: PageNumber) -> Result<PageMut> {
        let mut state = self.state.lock();
        self.check_writable(&state, pgno)?;
        if !self.cache.contains(pgno) {
            drop(self.fetch_page(&mut state, pgno)?);
        }
        self.bump_change_seq();
        self.cache
            .get_mut(pgno)
            .ok_or_else(|| LodeError::corrupt(format!("page {} vanished from the cache", pgno.as_u32())))
    }

    /// Replaces the image of page `pgno`.
    pub fn write_page(&self, pgno: PageNumber, data: &[u8]) -> Result<()> {
        let state = self.state.lock();
        self.check_writable(&state, pgno)?;
        if data.len() != self.config.page_size {
            return Err(LodeError::Misuse("page image must be exactly one page"));
        }
        match self.cache.get_mut(pgno) {
            Some(mut page) => {
                page.data_mut().copy_from_slice(data);
            }
            None => drop(self.cache.insert_dirty(pgno, data)),
        }
        self.bump_change_seq();
        Ok(())
    }

    pub(super) fn check_writable(&self, state: &PagerState, pgno: PageNumber) -> Result<()> {
        if state.txn != TransactionState::Write {
            return Err(LodeError::Misuse("page write outside a write transaction"));
        }
        if !pgno.is_valid() || pgno.as_u32() > state.db_size {
            return Err(LodeError::InvalidPageNumber(pgno));
        }
        Ok(())
    }

    /// Upgrades to a write transaction, starting a read transaction first
    /// if needed. Fails with `Busy` if another connection is writing or if
    /// the snapshot of the open read transaction is no longer the newest.
    pub fn begin_write(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.txn == TransactionState::Write {
            return Ok(());
        }
        let implicit_read = state.txn == TransactionState::Idle;
        self.begin_read_locked(&mut state)?;

        match self.try_begin_write(&mut state) {
            Ok(()) => Ok(()),
            Err(e) => {
                if state.holds_wal_write {
                    self.locks.unlock_slot(Slot::WalWrite)?;
                    state.holds_wal_write = false;
                }
                if implicit_read {
                    self.end_transaction(&mut state)?;
                } else {
                    self.locks.downgrade(LockLevel::Shared)?;
                }
                Err(e)
            }
        }
    }

    fn try_begin_write(&self, state: &mut PagerState) -> Result<()> {
        let busy = self.busy;
        busy.retry(|| self.locks.acquire(LockLevel::Reserved))?;
        busy.retry(|| {
            if self.locks.try_lock_slot(Slot::WalWrite, SlotMode::Exclusive)? {
                Ok(())
            } else {
                Err(LodeError::Busy)
            }
        })?;
        state.holds_wal_write = true;

        let mut snapshot = state.snapshot.ok_or(LodeError::Misuse("no open transaction"))?;
        let restarted = state.wal.refresh()?;
        if restarted || state.wal.salts() != snapshot.salts || state.wal.max_frame() != snapshot.wal_end {
            debug!("snapshot is stale, write transaction refused");
            return Err(LodeError::Busy);
        }

        if snapshot.read_slot == 0 && snapshot.wal_end > 0 && self.try_restart_wal(state)? {
            snapshot.wal_end = 0;
            snapshot.salts = state.wal.salts();
            state.snapshot = Some(snapshot);
            state.cache_frame = 0;
            state.cache_salts = snapshot.salts;
        }

        state.saved = Some((state.header.clone(), state.db_size));
        state.txn = TransactionState::Write;

        if state.db_size == 0 {
            self.create_first_page(state)?;
        }
        trace!("write transaction started");
        Ok(())
    }

    /// Restarts a fully backfilled log before the first append, so it does
    /// not grow without bound. Needs every reader of the log gone.
    fn try_restart_wal(&self, state: &mut PagerState) -> Result<bool> {
        let salts = state.wal.salts();
        if self.backfilled(salts)? != state.wal.max_frame() {
            return Ok(false);
        }
        let mut held = Vec::new();
        let mut all = true;
        for i in 1..READ_MARK_COUNT {
            if self.locks.try_lock_slot(Slot::ReadMark(i), SlotMode::Exclusive)? {
                held.push(i);
            } else {
                all = false;
                break;
            }
        }
        if all {
            state.wal.restart(false)?;
            self.reset_read_marks(state)?;
        }
        for i in held {
            self.locks.unlock_slot(Slot::ReadMark(i))?;
        }
        Ok(all)
    }

    /// Shared log bookkeeping for a freshly restarted log.
    pub(super) fn reset_read_marks(&self, state: &PagerState) -> Result<()> {
        let salts = state.wal.salts().unwrap_or_default();
        self.locks.set_backfill(crate::lock::Backfill {
            salt1: salts.salt1,
            salt2: salts.salt2,
            frames: 0,
        })?;
        self.locks.set_read_mark(1, 0)?;
        for i in 2..READ_MARK_COUNT {
            self.locks.set_read_mark(i, crate::common::READMARK_NOT_USED)?;
        }
        Ok(())
    }

    /// Creates page 1 of an empty database: the header and an empty table
    /// leaf that serves as the first root.
    fn create_first_page(&self, state: &mut PagerState) -> Result<()> {
        let mut data = vec![0u8; self.config.page_size];
        state.header = DatabaseHeader::new(&self.config);
        state.header.page_count = 1;
        state.header.write(&mut data);
        BTreePage::new(PageType::TableLeaf).encode(&mut data, DB_HEADER_SIZE, self.config.usable_size())?;
        state.db_size = 1;
        drop(self.cache.insert_dirty(PageNumber::new(1), &data));
        self.bump_change_seq();
        debug!(path = %self.path.display(), "created database");
        Ok(())
    }

    /// Lets the caller adjust header fields such as the schema cookie or
    /// user version inside a write transaction. Page size, page count and
    /// freelist fields are maintained by the pager and cannot be changed.
    pub fn update_header(&self, f: impl FnOnce(&mut DatabaseHeader)) -> Result<()> {
        let mut state = self.state.lock();
        if state.txn != TransactionState::Write {
            return Err(LodeError::Misuse("header update outside a write transaction"));
        }
        let before = state.header.clone();
        f(&mut state.header);
        let header = &mut state.header;
        header.page_size = before.page_size;
        header.reserved_space = before.reserved_space;
        header.page_count = before.page_count;
        header.freelist_trunk = before.freelist_trunk;
        header.freelist_count = before.freelist_count;
        header.change_counter = before.change_counter;
        header.version_valid_for = before.version_valid_for;
        Ok(())
    }

    /// Commits the open transaction. A write transaction appends its dirty
    /// pages to the log with a commit marker on the last frame.
    pub fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.txn {
            TransactionState::Idle => Ok(()),
            TransactionState::Read => self.end_transaction(&mut state),
            TransactionState::Write => {
                self.commit_write(&mut state)?;
                self.end_transaction(&mut state)?;
                self.auto_checkpoint(&mut state);
                Ok(())
            }
        }
    }

    fn commit_write(&self, state: &mut PagerState) -> Result<()> {
        let busy = self.busy;
        busy.retry(|| self.locks.acquire(LockLevel::Pending))?;

        if self.cache.dirty_pages().is_empty() && state.saved.as_ref().map(|(h, _)| h) == Some(&state.header) {
            trace!("nothing to commit");
            return Ok(());
        }

        let db_size = state.db_size;
        let header = &mut state.header;
        header.change_counter = header.change_counter.wrapping_add(1);
        header.version_valid_for = header.change_counter;
        header.page_count = db_size;
        let header = header.clone();
        {
            let page1 = PageNumber::new(1);
            if !self.cache.contains(page1) {
                drop(self.fetch_page(state, page1)?);
            }
            let mut page = self
                .cache
                .get_mut(page1)
                .ok_or_else(|| LodeError::corrupt("page 1 vanished from the cache"))?;
            header.write(&mut page.data_mut());
        }

        let dirty = self
            .cache
            .dirty_pages()
            .into_iter()
            .filter(|pgno| pgno.as_u32() <= db_size)
            .collect::<Vec<_>>();
        let mut images = Vec::with_capacity(dirty.len());
        for &pgno in &dirty {
            let data = self
                .cache
                .copy_page(pgno)
                .ok_or_else(|| LodeError::corrupt(format!("dirty page {} not cached", pgno.as_u32())))?;
            images.push((pgno, data));
        }
        let frames = images
            .iter()
            .map(|(pgno, data)| (*pgno, data.as_slice()))
            .collect::<Vec<_>>();

        let appended_at = state.wal.max_frame();
        let written = state.wal.append_frames(&frames, Some(db_size));
        let durable = written.and_then(|()| match self.config.synchronous {
            SyncMode::Full => state.wal.sync(),
            _ => Ok(()),
        });
        if let Err(e) = durable {
            // a commit frame left in the log would become visible to others
            if let Err(undo) = state.wal.rewind(appended_at) {
                warn!(error = %undo, "could not remove failed commit from the WAL");
            }
            return Err(e);
        }
        for pgno in dirty {
            self.cache.mark_clean(pgno);
        }
        for pgno in self.cache.dirty_pages() {
            self.cache.discard(pgno);
        }
        state.cache_frame = state.wal.max_frame();
        state.cache_salts = state.wal.salts();
        state.saved = None;
        debug!(
            pages = frames.len(),
            db_size,
            max_frame = state.wal.max_frame(),
            "committed transaction"
        );
        Ok(())
    }

    /// Abandons the open transaction. Dirty pages are dropped and every lock
    /// is released.
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.rollback_locked(&mut state)
    }

    pub(super) fn rollback_locked(&self, state: &mut PagerState) -> Result<()> {
        if state.txn == TransactionState::Write {
            for pgno in self.cache.dirty_pages() {
                self.cache.discard(pgno);
            }
            state.wal.discard_pending();
            if let Some((header, db_size)) = state.saved.take() {
                state.header = header;
                state.db_size = db_size;
            }
            self.bump_change_seq();
            debug!("rolled back write transaction");
        }
        self.end_transaction(state)
    }

    /// Ends any transaction and releases its locks.
    pub fn end_read(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.txn == TransactionState::Write {
            return Err(LodeError::Misuse("end_read inside a write transaction"));
        }
        self.end_transaction(&mut state)
    }

    fn end_transaction(&self, state: &mut PagerState) -> Result<()> {
        if state.holds_wal_write {
            self.locks.unlock_slot(Slot::WalWrite)?;
            state.holds_wal_write = false;
        }
        if let Some(snapshot) = state.snapshot.take() {
            self.locks.unlock_slot(Slot::ReadMark(snapshot.read_slot))?;
        }
        state.txn = TransactionState::Idle;
        state.saved = None;
        self.locks.release()
    }

    fn auto_checkpoint(&self, state: &mut PagerState) {
        let threshold = self.config.wal_autocheckpoint;
        if threshold == 0 || state.wal.max_frame() < threshold {
            return;
        }
        match self.checkpoint_locked(state, CheckpointMode::Passive) {
            Ok(result) => debug!(
                wal_frames = result.wal_frames,
                backfilled = result.backfilled,
                "automatic checkpoint"
            ),
            Err(e) => debug!(error = %e, "automatic checkpoint skipped"),
        }
    }

    /// Ends any transaction and, if no other connection is using the
    /// database, copies the whole log into the main file and empties it.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.rollback_locked(&mut state)?;

        let exclusive = self
            .locks
            .acquire(LockLevel::Shared)
            .and_then(|()| self.locks.acquire(LockLevel::Exclusive));
        let alone = match exclusive {
            Ok(()) => true,
            Err(LodeError::Busy) => false,
            Err(e) => {
                self.locks.release()?;
                return Err(e);
            }
        };
        let result = if alone {
            match self.checkpoint_locked(&mut state, CheckpointMode::Truncate) {
                Ok(_) | Err(LodeError::Busy) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };
        self.locks.release()?;
        self.cache.clear();
        debug!(path = %self.path.display(), checkpointed = alone, "closed database");
        result
    }
}
