use std::fmt;

use crate::common::{FrameNumber, READ_MARK_COUNT};

/// Lock levels a connection holds on the database file, weakest first.
///
/// Only one connection may be past SHARED at a time, and PENDING blocks new
/// SHARED requests, so no cycle of waiters can form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    Unlocked,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockLevel::Unlocked => "UNLOCKED",
            LockLevel::Shared => "SHARED",
            LockLevel::Reserved => "RESERVED",
            LockLevel::Pending => "PENDING",
            LockLevel::Exclusive => "EXCLUSIVE",
        };
        f.write_str(name)
    }
}

/// Coordination locks used by the write-ahead log, separate from the
/// database lock levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Held exclusively by the connection appending to the log
    WalWrite,
    /// Held exclusively while a checkpoint runs
    Checkpoint,
    /// Read-mark slot `i`; shared by readers of that snapshot
    ReadMark(usize),
}

impl Slot {
    /// Position of the slot's lock byte in the coordination region.
    pub fn index(self) -> usize {
        match self {
            Slot::WalWrite => 0,
            Slot::Checkpoint => 1,
            Slot::ReadMark(i) => {
                debug_assert!(i < READ_MARK_COUNT);
                3 + i
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotMode {
    Shared,
    Exclusive,
}

/// How far the log has been copied into the main file. Only meaningful while
/// the salts match the current log header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backfill {
    pub salt1: u32,
    pub salt2: u32,
    pub frames: FrameNumber,
}

impl Backfill {
    /// Backfilled frame count for a log with the given salts.
    pub fn frames_for(&self, salts: (u32, u32)) -> FrameNumber {
        if (self.salt1, self.salt2) == salts {
            self.frames
        } else {
            0
        }
    }
}
