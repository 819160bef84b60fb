//! Write-ahead log: file format, frame index, recovery and checkpoint plumbing.

mod checkpoint;
mod format;
mod index;
mod wal_file;
mod worker;

pub use checkpoint::{CheckpointMode, CheckpointResult};
pub use format::*;
pub use index::{FrameEntry, WalIndex};
pub use wal_file::Wal;
pub use worker::{CheckpointRequest, CheckpointWorker};
