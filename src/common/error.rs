use thiserror::Error;

use super::types::PageNumber;

/// Storage engine error types
#[derive(Error, Debug)]
pub enum LodeError {
    /// A lock could not be obtained before the busy timeout ran out.
    #[error("database is locked")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An on-disk structure failed validation.
    #[error("database disk image is malformed: {0}")]
    Corrupt(String),

    /// The file was written with an incompatible page size or format version.
    #[error("file format error: {0}")]
    Format(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("invalid page number: {0}")]
    InvalidPageNumber(PageNumber),

    #[error("library misuse: {0}")]
    Misuse(&'static str),
}

impl LodeError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        LodeError::Corrupt(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        LodeError::Format(msg.into())
    }

    /// Returns true for the only error class a retry loop may absorb.
    pub fn is_busy(&self) -> bool {
        matches!(self, LodeError::Busy)
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for LodeError {
    fn from(errno: nix::errno::Errno) -> Self {
        LodeError::Io(std::io::Error::from(errno))
    }
}

pub type Result<T> = std::result::Result<T, LodeError>;
