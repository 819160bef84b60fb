use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::common::{FrameNumber, LodeError, Result, READMARK_NOT_USED, READ_MARK_COUNT};

use super::{Backfill, LockLevel, LockManager, Slot, SlotMode};

#[derive(Default)]
struct SlotHolders {
    shared: HashSet<u64>,
    exclusive: Option<u64>,
}

/// Which connections of this process hold which locks. Both lock managers
/// arbitrate between local connections with it.
#[derive(Default)]
pub(super) struct LocalLocks {
    next_id: u64,
    /// Lock level of every connection above UNLOCKED
    levels: HashMap<u64, LockLevel>,
    slots: HashMap<Slot, SlotHolders>,
}

impl LocalLocks {
    /// Hands out the id of a new connection.
    pub(super) fn register(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(super) fn level_of(&self, id: u64) -> LockLevel {
        self.levels.get(&id).copied().unwrap_or(LockLevel::Unlocked)
    }

    /// Returns true if a connection other than `id` holds `level` or stronger.
    pub(super) fn other_holds(&self, id: u64, level: LockLevel) -> bool {
        self.levels
            .iter()
            .any(|(&other, &held)| other != id && held >= level)
    }

    pub(super) fn set_level(&mut self, id: u64, level: LockLevel) {
        if level == LockLevel::Unlocked {
            self.levels.remove(&id);
        } else {
            self.levels.insert(id, level);
        }
    }

    /// Strongest mode any local connection holds `slot` in.
    pub(super) fn slot_mode(&self, slot: Slot) -> Option<SlotMode> {
        let holders = self.slots.get(&slot)?;
        if holders.exclusive.is_some() {
            Some(SlotMode::Exclusive)
        } else if !holders.shared.is_empty() {
            Some(SlotMode::Shared)
        } else {
            None
        }
    }

    /// Returns false if another connection holds `slot` in a mode that
    /// conflicts with `mode`.
    pub(super) fn slot_admits(&self, id: u64, slot: Slot, mode: SlotMode) -> bool {
        let Some(holders) = self.slots.get(&slot) else {
            return true;
        };
        if holders.exclusive.is_some_and(|owner| owner != id) {
            return false;
        }
        mode == SlotMode::Shared || holders.shared.iter().all(|&h| h == id)
    }

    /// Records `id` as holding `slot` in `mode`, replacing its previous mode.
    pub(super) fn grant_slot(&mut self, id: u64, slot: Slot, mode: SlotMode) {
        let holders = self.slots.entry(slot).or_default();
        match mode {
            SlotMode::Shared => {
                if holders.exclusive == Some(id) {
                    holders.exclusive = None;
                }
                holders.shared.insert(id);
            }
            SlotMode::Exclusive => {
                holders.shared.remove(&id);
                holders.exclusive = Some(id);
            }
        }
    }

    /// Drops the hold of `id` on `slot`. Returns false if it held none.
    pub(super) fn remove_slot(&mut self, id: u64, slot: Slot) -> bool {
        let Some(holders) = self.slots.get_mut(&slot) else {
            return false;
        };
        let shared = holders.shared.remove(&id);
        let exclusive = holders.exclusive == Some(id);
        if exclusive {
            holders.exclusive = None;
        }
        shared || exclusive
    }

    /// Slots `id` holds, in any mode.
    pub(super) fn slots_of(&self, id: u64) -> Vec<Slot> {
        self.slots
            .iter()
            .filter(|(_, h)| h.exclusive == Some(id) || h.shared.contains(&id))
            .map(|(&slot, _)| slot)
            .collect()
    }
}

struct TableState {
    locks: LocalLocks,
    read_marks: [FrameNumber; READ_MARK_COUNT],
    backfill: Backfill,
}

/// Lock state shared by every connection of one process to one database.
///
/// Behaves like the file-lock protocol but lives entirely in memory, with
/// no files touched, so it only coordinates connections of this process.
pub struct MemoryLockTable {
    state: Mutex<TableState>,
}

impl MemoryLockTable {
    pub fn new() -> Arc<Self> {
        let mut read_marks = [READMARK_NOT_USED; READ_MARK_COUNT];
        read_marks[0] = 0;
        Arc::new(Self {
            state: Mutex::new(TableState {
                locks: LocalLocks::default(),
                read_marks,
                backfill: Backfill::default(),
            }),
        })
    }

    /// Registers a new connection with no locks held.
    pub fn connect(self: &Arc<Self>) -> MemoryLockManager {
        let id = self.state.lock().locks.register();
        MemoryLockManager {
            table: Arc::clone(self),
            id,
        }
    }
}

/// One connection's handle on a [`MemoryLockTable`].
pub struct MemoryLockManager {
    table: Arc<MemoryLockTable>,
    id: u64,
}

impl MemoryLockManager {
    /// Applies a level change under the table lock.
    fn transition(&self, target: LockLevel) -> Result<()> {
        let mut state = self.table.state.lock();
        let locks = &mut state.locks;
        let current = locks.level_of(self.id);
        if target <= current {
            return Ok(());
        }
        if current == LockLevel::Unlocked && target > LockLevel::Shared {
            return Err(LodeError::Misuse("SHARED must be held before a write lock"));
        }

        match target {
            LockLevel::Shared => {
                // a pending writer keeps new readers out
                if locks.other_holds(self.id, LockLevel::Pending) {
                    return Err(LodeError::Busy);
                }
            }
            LockLevel::Reserved | LockLevel::Pending => {
                if locks.other_holds(self.id, LockLevel::Reserved) {
                    return Err(LodeError::Busy);
                }
            }
            LockLevel::Exclusive => {
                if current < LockLevel::Pending {
                    if locks.other_holds(self.id, LockLevel::Reserved) {
                        return Err(LodeError::Busy);
                    }
                    locks.set_level(self.id, LockLevel::Pending);
                }
                if locks.other_holds(self.id, LockLevel::Shared) {
                    trace!(conn = self.id, "exclusive lock waiting for readers");
                    return Err(LodeError::Busy);
                }
            }
            LockLevel::Unlocked => unreachable!("target is above the current level"),
        }

        locks.set_level(self.id, target);
        trace!(conn = self.id, from = %current, to = %target, "lock acquired");
        Ok(())
    }
}

impl LockManager for MemoryLockManager {
    fn level(&self) -> LockLevel {
        self.table.state.lock().locks.level_of(self.id)
    }

    fn acquire(&self, level: LockLevel) -> Result<()> {
        self.transition(level)
    }

    fn downgrade(&self, level: LockLevel) -> Result<()> {
        if level > LockLevel::Shared {
            return Err(LodeError::Misuse("locks can only be lowered to SHARED or UNLOCKED"));
        }
        let mut state = self.table.state.lock();
        if level < state.locks.level_of(self.id) {
            state.locks.set_level(self.id, level);
        }
        Ok(())
    }

    fn try_lock_slot(&self, slot: Slot, mode: SlotMode) -> Result<bool> {
        let mut state = self.table.state.lock();
        let locks = &mut state.locks;
        if !locks.slot_admits(self.id, slot, mode) {
            return Ok(false);
        }
        locks.grant_slot(self.id, slot, mode);
        Ok(true)
    }

    fn unlock_slot(&self, slot: Slot) -> Result<()> {
        self.table.state.lock().locks.remove_slot(self.id, slot);
        Ok(())
    }

    fn read_mark(&self, index: usize) -> Result<FrameNumber> {
        let state = self.table.state.lock();
        state
            .read_marks
            .get(index)
            .copied()
            .ok_or(LodeError::Misuse("read mark index out of range"))
    }

    fn set_read_mark(&self, index: usize, frame: FrameNumber) -> Result<()> {
        let mut state = self.table.state.lock();
        let mark = state
            .read_marks
            .get_mut(index)
            .ok_or(LodeError::Misuse("read mark index out of range"))?;
        *mark = frame;
        Ok(())
    }

    fn backfill(&self) -> Result<Backfill> {
        Ok(self.table.state.lock().backfill)
    }

    fn set_backfill(&self, backfill: Backfill) -> Result<()> {
        self.table.state.lock().backfill = backfill;
        Ok(())
    }
}

impl Drop for MemoryLockManager {
    fn drop(&mut self) {
        let mut state = self.table.state.lock();
        let locks = &mut state.locks;
        locks.set_level(self.id, LockLevel::Unlocked);
        for slot in locks.slots_of(self.id) {
            locks.remove_slot(self.id, slot);
        }
    }
}
