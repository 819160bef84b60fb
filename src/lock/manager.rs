use crate::common::{FrameNumber, Result};

use super::{Backfill, LockLevel, Slot, SlotMode};

/// Advisory locking for one connection to one database file.
///
/// Every method makes a single non-blocking attempt; contention is reported
/// as `LodeError::Busy` (or `Ok(false)` for slots) and retried by the caller
/// through a [`BusyHandler`](super::BusyHandler).
pub trait LockManager: Send + Sync {
    /// Level currently held.
    fn level(&self) -> LockLevel;

    /// Raises the lock to `level`. Asking for a level at or below the current
    /// one is a no-op. A failed EXCLUSIVE request leaves the lock at PENDING.
    fn acquire(&self, level: LockLevel) -> Result<()>;

    /// Lowers the lock to SHARED or UNLOCKED.
    fn downgrade(&self, level: LockLevel) -> Result<()>;

    /// Drops every database lock level.
    fn release(&self) -> Result<()> {
        self.downgrade(LockLevel::Unlocked)
    }

    /// Tries to take or convert a coordination slot.
    fn try_lock_slot(&self, slot: Slot, mode: SlotMode) -> Result<bool>;

    fn unlock_slot(&self, slot: Slot) -> Result<()>;

    /// Snapshot frame recorded in read-mark slot `index`.
    fn read_mark(&self, index: usize) -> Result<FrameNumber>;

    fn set_read_mark(&self, index: usize, frame: FrameNumber) -> Result<()>;

    fn backfill(&self) -> Result<Backfill>;

    fn set_backfill(&self, backfill: Backfill) -> Result<()>;
}
