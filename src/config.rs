use std::path::PathBuf;
use std::time::Duration;

use crate::error::HybridLogError;

/// Default capacity of the in-memory tail buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// Default buffer fullness (percent) at which the split point is advanced.
pub const DEFAULT_HIGH_WATER_MARK: u32 = 50;
/// Default wait for exclusive acquisition of the backing file.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(3);
/// Default compaction trigger: seconds for [`CompactionMode::TimeBased`],
/// fragment count for [`CompactionMode::FragmentationBased`].
pub const DEFAULT_COMPACT_AFTER: u64 = 60;
/// Default upper bound on a single compaction copy step.
pub const DEFAULT_COMPACTION_CHUNK_SIZE: usize = 1024 * 1024;

/// When the file's data is forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Never issue a data sync.
    #[default]
    NoSync,
    /// Sync after every append, before the append returns.
    AlwaysSync,
    /// A background tick issues one data sync per second while dirty.
    SyncEverySecond,
}

/// What drives the compactor's rewrite cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionMode {
    /// Rewrite every `compact_after` seconds.
    #[default]
    TimeBased,
    /// Rewrite once `compact_after` tombstones have accumulated.
    FragmentationBased,
}

/// Configuration for opening a hybrid log.
///
/// All fields are public; [`Config::new`] fills in the defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem path of the backing file. An extension is required; the
    /// sidecar lock file and compaction scratch file are derived from it.
    pub path: PathBuf,
    /// Capacity in bytes of the in-memory tail buffer, allocated once at
    /// open and never grown.
    pub buffer_size: usize,
    /// Buffer fullness in percent (1..=100) that triggers a remap.
    pub high_water_mark: u32,
    /// Maximum wait for exclusive acquisition of the backing file.
    pub open_timeout: Duration,
    /// When appended data is forced to stable storage.
    pub sync_policy: SyncPolicy,
    /// Wrap the log in the background compactor.
    pub auto_compaction: bool,
    /// Trigger mode for the compactor.
    pub compaction_mode: CompactionMode,
    /// Seconds ([`CompactionMode::TimeBased`]) or fragment count
    /// ([`CompactionMode::FragmentationBased`]) before a compaction fires.
    pub compact_after: u64,
    /// Maximum bytes moved per compaction copy step.
    pub compaction_chunk_size: usize,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            sync_policy: SyncPolicy::NoSync,
            auto_compaction: false,
            compaction_mode: CompactionMode::TimeBased,
            compact_after: DEFAULT_COMPACT_AFTER,
            compaction_chunk_size: DEFAULT_COMPACTION_CHUNK_SIZE,
        }
    }

    pub fn validate(&self) -> Result<(), HybridLogError> {
        if self.path.file_name().is_none() {
            return Err(invalid("path must name a file"));
        }
        if self.path.extension().is_none() {
            return Err(invalid("path must carry a file extension"));
        }
        if self.buffer_size == 0 {
            return Err(invalid("buffer_size must be greater than zero"));
        }
        if self.high_water_mark == 0 || self.high_water_mark > 100 {
            return Err(invalid("high_water_mark must be within 1..=100"));
        }
        if self.auto_compaction {
            if self.compact_after == 0 {
                return Err(invalid("compact_after must be greater than zero"));
            }
            if self.compaction_chunk_size == 0 {
                return Err(invalid(
                    "compaction_chunk_size must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> HybridLogError {
    HybridLogError::InvalidConfig {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::new("./data.log").validate().is_ok());
    }

    #[test]
    fn rejects_missing_extension() {
        let cfg = Config::new("./data");
        assert!(matches!(
            cfg.validate(),
            Err(HybridLogError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_zero_buffer() {
        let mut cfg = Config::new("./data.log");
        cfg.buffer_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_high_water_mark() {
        let mut cfg = Config::new("./data.log");
        cfg.high_water_mark = 0;
        assert!(cfg.validate().is_err());
        cfg.high_water_mark = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn compactor_fields_checked_only_when_enabled() {
        let mut cfg = Config::new("./data.log");
        cfg.compact_after = 0;
        assert!(cfg.validate().is_ok());
        cfg.auto_compaction = true;
        assert!(cfg.validate().is_err());
    }
}
