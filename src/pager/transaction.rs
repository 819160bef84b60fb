use std::fmt;

use crate::common::FrameNumber;
use crate::wal::WalSalts;

/// Transaction a connection is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    /// Holds SHARED and a read mark
    Read,
    /// Also holds RESERVED and the log write lock
    Write,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Idle => "idle",
            TransactionState::Read => "read",
            TransactionState::Write => "write",
        };
        f.write_str(name)
    }
}

/// The committed state a transaction reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Last log frame this transaction may read; 0 reads the main file only
    pub max_frame: FrameNumber,
    /// Last committed frame of the log when the snapshot was taken
    pub wal_end: FrameNumber,
    /// Log generation the frames belong to
    pub salts: Option<WalSalts>,
    /// Read-mark slot held for the lifetime of the transaction
    pub read_slot: usize,
}

impl Snapshot {
    /// Returns true if the snapshot reads only the main database file.
    pub fn reads_main_file_only(&self) -> bool {
        self.max_frame == 0
    }
}
