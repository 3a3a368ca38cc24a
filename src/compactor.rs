use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::{CompactionMode, Config};
use crate::error::HybridLogError;
use crate::hybrid::{HybridLog, RewriteOutcome};
use crate::sync::Ticker;

const FRAGMENTATION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A recorded deletion against the log's logical offset space. Tombstoned
/// bytes stay readable until the next compaction drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tombstone {
    pub(crate) offset: u64,
    pub(crate) len: u64,
}

/// Compacting decorator over [`HybridLog`].
///
/// Presents the same append/read/size/close surface and adds [`delete`] for
/// recording tombstones and [`compact`] for forcing a cycle. A background
/// monitor rewrites the backing file either on a fixed cadence
/// ([`CompactionMode::TimeBased`]) or once enough tombstones accumulate
/// ([`CompactionMode::FragmentationBased`]). Compaction resets the logical
/// offset space to the compacted length; live bytes keep their order.
///
/// [`delete`]: CompactingLog::delete
/// [`compact`]: CompactingLog::compact
#[derive(Debug)]
pub struct CompactingLog {
    shared: Arc<CompactionShared>,
    monitor: Mutex<Option<Ticker>>,
}

#[derive(Debug)]
struct CompactionShared {
    log: Arc<HybridLog>,
    chunk_size: usize,
    /// Tombstone ledger. The mutex doubles as the compaction lock: holding
    /// it for the whole rewrite keeps concurrent compactions out and makes
    /// every `delete` land in a stable offset space.
    ledger: Mutex<Vec<Tombstone>>,
    fragments: AtomicUsize,
}

impl CompactingLog {
    /// Opens the underlying log and starts the compaction monitor according
    /// to `config.compaction_mode` and `config.compact_after`.
    pub fn open(config: Config) -> Result<Self, HybridLogError> {
        let mode = config.compaction_mode;
        let compact_after = config.compact_after;
        let chunk_size = config.compaction_chunk_size;
        let log = Arc::new(HybridLog::open(config)?);
        let shared = Arc::new(CompactionShared {
            log,
            chunk_size,
            ledger: Mutex::new(Vec::new()),
            fragments: AtomicUsize::new(0),
        });
        let monitor = match mode {
            CompactionMode::TimeBased => {
                let ticking = shared.clone();
                Ticker::spawn(
                    "hybridlog-compactor",
                    Duration::from_secs(compact_after),
                    move || ticking.compact_and_report(),
                )
            }
            CompactionMode::FragmentationBased => {
                let ticking = shared.clone();
                Ticker::spawn("hybridlog-compactor", FRAGMENTATION_CHECK_INTERVAL, move || {
                    if ticking.fragments.load(Ordering::Acquire) as u64 >= compact_after {
                        ticking.compact_and_report();
                    }
                })
            }
        };
        Ok(Self {
            shared,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn append(&self, payload: &[u8]) -> Result<usize, HybridLogError> {
        self.shared.log.append(payload)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, HybridLogError> {
        self.shared.log.read_at(buf, offset)
    }

    pub fn size(&self) -> u64 {
        self.shared.log.size()
    }

    /// Stops the monitor, then closes the underlying log. A second close is
    /// a no-op.
    pub fn close(&self) -> Result<(), HybridLogError> {
        if let Some(mut monitor) = self
            .monitor
            .lock()
            .expect("compaction monitor slot poisoned")
            .take()
        {
            monitor.shutdown();
        }
        self.shared.log.close()
    }

    /// Records a tombstone over `[offset, offset + len)`. The range must lie
    /// within the current log; tombstoned bytes remain readable until the
    /// next compaction. Each recorded tombstone counts as one fragment.
    ///
    /// A call that races a running compaction waits for it and then records
    /// against the post-compaction offset space.
    pub fn delete(&self, offset: u64, len: u64) -> Result<(), HybridLogError> {
        let end = offset
            .checked_add(len)
            .ok_or(HybridLogError::InvalidRange { offset, len })?;
        if len == 0 {
            return Ok(());
        }
        let mut ledger = self.shared.ledger.lock().expect("tombstone ledger poisoned");
        if end > self.shared.log.size() {
            return Err(HybridLogError::InvalidRange { offset, len });
        }
        ledger.push(Tombstone { offset, len });
        self.shared.fragments.store(ledger.len(), Ordering::Release);
        Ok(())
    }

    /// Number of tombstones recorded since the last completed compaction.
    pub fn fragments(&self) -> usize {
        self.shared.fragments.load(Ordering::Acquire)
    }

    /// Forces a compaction cycle immediately, outside the monitor cadence.
    pub fn compact(&self) -> Result<(), HybridLogError> {
        self.shared.compact().map(|_| ())
    }
}

impl Drop for CompactingLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// `write` appends and `flush` forces a data sync, matching the adapter on
/// the underlying log.
impl std::io::Write for &CompactingLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.append(buf).map_err(std::io::Error::other)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.shared.log.sync_now()
    }
}

impl CompactionShared {
    fn compact(&self) -> Result<RewriteOutcome, HybridLogError> {
        let mut ledger = self.ledger.lock().expect("tombstone ledger poisoned");
        let snapshot = std::mem::take(&mut *ledger);
        match self.log.rewrite(&snapshot, self.chunk_size) {
            Ok(outcome) => {
                self.fragments.store(0, Ordering::Release);
                Ok(outcome)
            }
            Err(err) => {
                // Keep the tombstones for the next cycle; the source file is
                // untouched on failure.
                *ledger = snapshot;
                Err(err)
            }
        }
    }

    fn compact_and_report(&self) {
        let started = Instant::now();
        match self.compact() {
            Ok(outcome) => {
                info!(
                    "event=compaction_complete path={} previous_bytes={} compacted_bytes={} duration_ms={}",
                    self.log.shared_path().display(),
                    outcome.previous_len,
                    outcome.new_len,
                    started.elapsed().as_millis()
                );
            }
            Err(HybridLogError::Closed) => {}
            Err(err) => {
                warn!(
                    "event=compaction_failed path={} error={}",
                    self.log.shared_path().display(),
                    err
                );
            }
        }
    }
}
