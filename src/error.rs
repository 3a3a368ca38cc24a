use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the hybrid log.
///
/// I/O failures carry the number of bytes the operation completed before
/// failing, so a partially applied append or read is never silently lost.
#[derive(Debug, Error)]
pub enum HybridLogError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("failed to open log at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("log at {} is held by another owner (waited {timeout:?})", path.display())]
    Busy { path: PathBuf, timeout: Duration },
    #[error("I/O error after {completed} bytes: {source}")]
    Io {
        completed: usize,
        #[source]
        source: io::Error,
    },
    #[error("log is closed")]
    Closed,
    #[error("offset {offset} with length {len} overflows the offset space")]
    InvalidRange { offset: u64, len: u64 },
    #[error("offset {offset} is at or past the end of the log ({size} bytes)")]
    EndOfData { offset: u64, size: u64 },
}

impl From<io::Error> for HybridLogError {
    fn from(source: io::Error) -> Self {
        HybridLogError::Io {
            completed: 0,
            source,
        }
    }
}
