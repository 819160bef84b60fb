use std::fmt;

use crate::common::FrameNumber;

/// How hard a checkpoint tries to empty the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointMode {
    /// Copy what readers allow without waiting on anyone.
    Passive,
    /// Wait for the writer and for readers of older snapshots, then copy
    /// every committed frame.
    Full,
    /// Like `Full`, then wait until no reader uses the log and restart it.
    Restart,
    /// Like `Restart`, and leave the log file empty.
    Truncate,
}

impl CheckpointMode {
    /// Returns true for modes that wait on the busy handler.
    pub fn waits(self) -> bool {
        self != CheckpointMode::Passive
    }

    /// Returns true for modes that reset the log afterwards.
    pub fn restarts(self) -> bool {
        matches!(self, CheckpointMode::Restart | CheckpointMode::Truncate)
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        };
        f.write_str(name)
    }
}

/// Outcome of a checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointResult {
    /// Committed frames in the log when the checkpoint started
    pub wal_frames: FrameNumber,
    /// Frames now copied into the main file
    pub backfilled: FrameNumber,
}

impl CheckpointResult {
    pub fn is_complete(&self) -> bool {
        self.backfilled >= self.wal_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags() {
        assert!(!CheckpointMode::Passive.waits());
        assert!(CheckpointMode::Full.waits());
        assert!(!CheckpointMode::Full.restarts());
        assert!(CheckpointMode::Truncate.restarts());
        assert_eq!(CheckpointMode::Restart.to_string(), "RESTART");
    }

    #[test]
    fn test_result_completion() {
        let partial = CheckpointResult {
            wal_frames: 10,
            backfilled: 4,
        };
        assert!(!partial.is_complete());
        assert!(CheckpointResult::default().is_complete());
    }
}
