//! Append-only byte log persisted to a single regular file.
//!
//! Recent writes are served from an in-memory tail buffer while older data
//! is read directly from the file, giving near-memory latency for the hot
//! tail and bounded disk I/O for the cold prefix. The log is byte-granular
//! (no record framing) and safe for concurrent appends and reads from many
//! threads.
//!
//! [`open`] returns the log behind the narrow [`ByteLog`] capability set.
//! With [`Config::auto_compaction`] enabled the log is wrapped in a
//! background compactor that periodically rewrites the file to reclaim
//! tombstoned bytes; open [`CompactingLog`] directly to record tombstones.
//!
//! ```no_run
//! use hybridlog::{Config, HybridLog};
//!
//! let log = HybridLog::open(Config::new("./data.log"))?;
//! log.append(b"hello")?;
//! let mut buf = [0u8; 5];
//! log.read_at(&mut buf, 0)?;
//! assert_eq!(&buf, b"hello");
//! log.close()?;
//! # Ok::<(), hybridlog::HybridLogError>(())
//! ```
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

mod buffer;
mod compactor;
mod config;
mod error;
mod guard;
mod hybrid;
mod sync;

pub use compactor::CompactingLog;
pub use config::{
    CompactionMode, Config, SyncPolicy, DEFAULT_BUFFER_SIZE, DEFAULT_COMPACTION_CHUNK_SIZE,
    DEFAULT_COMPACT_AFTER, DEFAULT_HIGH_WATER_MARK, DEFAULT_OPEN_TIMEOUT,
};
pub use error::HybridLogError;
pub use hybrid::HybridLog;

/// The log's capability set: append, positional read, size, close.
///
/// Both [`HybridLog`] and the [`CompactingLog`] decorator implement it; the
/// compactor is transparent at this surface.
pub trait ByteLog: Send + Sync {
    /// Appends `payload`, returning the byte count written. Partial counts
    /// are carried inside the error when the underlying write fails.
    fn append(&self, payload: &[u8]) -> Result<usize, HybridLogError>;

    /// Fills `buf` from absolute offset `offset`, returning the byte count
    /// produced. Short counts signal that the range extends past the end;
    /// a read starting at or past the end fails with
    /// [`HybridLogError::EndOfData`].
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, HybridLogError>;

    /// Total appended bytes.
    fn size(&self) -> u64;

    /// Drains in-flight operations and releases the path. A second close is
    /// a no-op; other operations fail with [`HybridLogError::Closed`] after.
    fn close(&self) -> Result<(), HybridLogError>;
}

impl ByteLog for HybridLog {
    fn append(&self, payload: &[u8]) -> Result<usize, HybridLogError> {
        HybridLog::append(self, payload)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, HybridLogError> {
        HybridLog::read_at(self, buf, offset)
    }

    fn size(&self) -> u64 {
        HybridLog::size(self)
    }

    fn close(&self) -> Result<(), HybridLogError> {
        HybridLog::close(self)
    }
}

impl ByteLog for CompactingLog {
    fn append(&self, payload: &[u8]) -> Result<usize, HybridLogError> {
        CompactingLog::append(self, payload)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, HybridLogError> {
        CompactingLog::read_at(self, buf, offset)
    }

    fn size(&self) -> u64 {
        CompactingLog::size(self)
    }

    fn close(&self) -> Result<(), HybridLogError> {
        CompactingLog::close(self)
    }
}

/// Opens a hybrid log at `config.path`, creating the file if absent. With
/// `auto_compaction` the log comes back wrapped in the compactor.
pub fn open(config: Config) -> Result<Box<dyn ByteLog>, HybridLogError> {
    if config.auto_compaction {
        Ok(Box::new(CompactingLog::open(config)?))
    } else {
        Ok(Box::new(HybridLog::open(config)?))
    }
}
