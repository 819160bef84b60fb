use tracing::debug;

use crate::common::{LodeError, Result, SyncMode, DB_HEADER_SIZE, READ_MARK_COUNT, READMARK_NOT_USED};
use crate::lock::{Backfill, LockLevel, Slot, SlotMode};
use crate::storage::page::peek_change_counter;
use crate::wal::{CheckpointMode, CheckpointResult};

use super::connection::PagerState;
use super::{Pager, TransactionState};

impl Pager {
    /// Copies committed log frames into the main database file.
    ///
    /// PASSIVE copies what no reader still needs and never waits. The other
    /// modes wait, up to the busy timeout, for the writer and for readers of
    /// older snapshots; RESTART and TRUNCATE then also wait for every log
    /// reader to finish and start the log over. A waiting mode that could
    /// not finish returns `Busy` after copying what was safe.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult> {
        let mut state = self.state.lock();
        if state.txn != TransactionState::Idle {
            return Err(LodeError::Misuse("checkpoint inside a transaction"));
        }
        self.checkpoint_locked(&mut state, mode)
    }

    pub(super) fn checkpoint_locked(
        &self,
        state: &mut PagerState,
        mode: CheckpointMode,
    ) -> Result<CheckpointResult> {
        let busy = self.busy;
        let had_lock = self.locks.level() >= LockLevel::Shared;
        if !had_lock {
            busy.retry(|| self.locks.acquire(LockLevel::Shared))?;
        }

        let mut held = Vec::new();
        let result = self.run_checkpoint(state, mode, &mut held);

        for slot in held.into_iter().rev() {
            self.locks.unlock_slot(slot)?;
        }
        if !had_lock {
            self.locks.release()?;
        }
        result
    }

    fn lock_slot(&self, slot: Slot, wait: bool) -> Result<()> {
        let attempt = || {
            if self.locks.try_lock_slot(slot, SlotMode::Exclusive)? {
                Ok(())
            } else {
                Err(LodeError::Busy)
            }
        };
        if wait {
            self.busy.retry(attempt)
        } else {
            attempt()
        }
    }

    fn run_checkpoint(
        &self,
        state: &mut PagerState,
        mode: CheckpointMode,
        held: &mut Vec<Slot>,
    ) -> Result<CheckpointResult> {
        self.lock_slot(Slot::Checkpoint, mode.waits())?;
        held.push(Slot::Checkpoint);
        if mode.waits() {
            self.lock_slot(Slot::WalWrite, true)?;
            held.push(Slot::WalWrite);
        }

        self.sync_cache(state)?;
        let max_frame = state.wal.max_frame();
        let salts = state.wal.salts();
        let mut backfilled = self.backfilled(salts)?;

        if max_frame > backfilled {
            let safe = self.safe_frame(max_frame, mode.waits())?;
            if safe > backfilled && self.locks.try_lock_slot(Slot::ReadMark(0), SlotMode::Exclusive)? {
                let copied = self.backfill_frames(state, backfilled, safe, max_frame);
                self.locks.unlock_slot(Slot::ReadMark(0))?;
                copied?;
                backfilled = safe;
            }
        }

        let result = CheckpointResult {
            wal_frames: max_frame,
            backfilled,
        };
        debug!(
            %mode,
            wal_frames = result.wal_frames,
            backfilled = result.backfilled,
            "checkpoint"
        );
        if mode.waits() && !result.is_complete() {
            return Err(LodeError::Busy);
        }

        if mode.restarts() {
            let mut readers = Vec::new();
            let mut locked = Ok(());
            for i in 1..READ_MARK_COUNT {
                match self.lock_slot(Slot::ReadMark(i), true) {
                    Ok(()) => readers.push(Slot::ReadMark(i)),
                    Err(e) => {
                        locked = Err(e);
                        break;
                    }
                }
            }
            let restarted = locked.and_then(|()| {
                state.wal.restart(mode == CheckpointMode::Truncate)?;
                self.reset_read_marks(state)
            });
            for slot in readers {
                self.locks.unlock_slot(slot)?;
            }
            restarted?;
            state.cache_frame = 0;
            state.cache_salts = state.wal.salts();
            debug!(truncate = mode == CheckpointMode::Truncate, "log restarted");
        }
        Ok(result)
    }

    /// Largest frame every reader has already seen. Idle read-mark slots are
    /// moved to `max_frame` so later readers do not hold the checkpoint back.
    fn safe_frame(&self, max_frame: u32, wait: bool) -> Result<u32> {
        let mut safe = max_frame;
        for i in 1..READ_MARK_COUNT {
            let mark = self.locks.read_mark(i)?;
            if safe <= mark {
                continue;
            }
            let slot = Slot::ReadMark(i);
            let locked = if wait {
                self.busy
                    .retry(|| {
                        if self.locks.try_lock_slot(slot, SlotMode::Exclusive)? {
                            Ok(())
                        } else {
                            Err(LodeError::Busy)
                        }
                    })
                    .is_ok()
            } else {
                self.locks.try_lock_slot(slot, SlotMode::Exclusive)?
            };
            if locked {
                let mark = if i == 1 { max_frame } else { READMARK_NOT_USED };
                self.locks.set_read_mark(i, mark)?;
                self.locks.unlock_slot(slot)?;
            } else {
                safe = mark;
            }
        }
        Ok(safe)
    }

    /// Writes the newest image of every page logged in `(from, through]`
    /// into the main file.
    fn backfill_frames(
        &self,
        state: &mut PagerState,
        from: u32,
        through: u32,
        max_frame: u32,
    ) -> Result<()> {
        let sync = self.config().synchronous;
        if sync != SyncMode::Off {
            state.wal.sync()?;
        }

        let mut data = vec![0u8; self.page_size()];
        for (pgno, frame) in state.wal.latest_frames(from, through) {
            state.wal.read_frame(frame, &mut data)?;
            self.disk.write_page(pgno, &data)?;
        }
        if through == max_frame {
            if let Some(db_size) = state.wal.db_size_at(max_frame) {
                self.disk.truncate_pages(db_size)?;
            }
        }
        if sync != SyncMode::Off {
            self.disk.sync()?;
        }

        let salts = state.wal.salts().unwrap_or_default();
        self.locks.set_backfill(Backfill {
            salt1: salts.salt1,
            salt2: salts.salt2,
            frames: through,
        })?;

        let mut raw = [0u8; DB_HEADER_SIZE];
        if self.disk.read_at(0, &mut raw)? == DB_HEADER_SIZE {
            state.file_change_counter = peek_change_counter(&raw);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PageNumber, PagerConfig};
    use crate::lock::MemoryLockTable;
    use tempfile::tempdir;

    fn write_pages(pager: &Pager, count: u32) {
        pager.begin_write().unwrap();
        for _ in 0..count {
            let pgno = pager.allocate_page().unwrap();
            let mut page = pager.page_mut(pgno).unwrap();
            page.data_mut()[0] = pgno.as_u32() as u8;
        }
        pager.commit().unwrap();
    }

    #[test]
    fn test_passive_checkpoint_copies_everything_without_readers() {
        let dir = tempdir().unwrap();
        let table = MemoryLockTable::new();
        let config = PagerConfig::default()
            .with_page_size(512)
            .with_wal_autocheckpoint(0);
        let pager =
            Pager::open_with_lock_manager(dir.path().join("t.db"), config, Box::new(table.connect()))
                .unwrap();
        write_pages(&pager, 3);

        let result = pager.checkpoint(CheckpointMode::Passive).unwrap();
        assert!(result.wal_frames > 0);
        assert!(result.is_complete());
        assert_eq!(pager.disk.file_pages().unwrap(), 4);

        let result = pager.checkpoint(CheckpointMode::Truncate).unwrap();
        assert!(result.is_complete());
        assert_eq!(pager.wal_frame_count(), 0);

        pager.begin_read().unwrap();
        assert_eq!(pager.read_page(PageNumber::new(3)).unwrap().data()[0], 3);
    }

    #[test]
    fn test_checkpoint_inside_transaction_is_misuse() {
        let dir = tempdir().unwrap();
        let table = MemoryLockTable::new();
        let pager = Pager::open_with_lock_manager(
            dir.path().join("t.db"),
            PagerConfig::default().with_page_size(512),
            Box::new(table.connect()),
        )
        .unwrap();
        pager.begin_read().unwrap();
        assert!(matches!(
            pager.checkpoint(CheckpointMode::Passive),
            Err(LodeError::Misuse(_))
        ));
    }
}
