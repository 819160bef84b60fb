//! Database and log coordination locks.

mod busy;
mod level;
mod manager;
mod memory;
#[cfg(unix)]
mod posix;

pub use busy::BusyHandler;
pub use level::{Backfill, LockLevel, Slot, SlotMode};
pub use manager::LockManager;
pub use memory::{MemoryLockManager, MemoryLockTable};
#[cfg(unix)]
pub use posix::PosixLockManager;
