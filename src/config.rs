//! Builder-style configuration for [`crate::Engine::open`].

use std::path::Path;
use std::time::Duration;

use crate::engine::Engine;
use crate::error::Result;

/// Default maximum key size: 64 bytes.
pub const DEFAULT_MAX_KEY_SIZE: u32 = 64;
/// Default maximum value size: 64 KiB.
pub const DEFAULT_MAX_VALUE_SIZE: u32 = 64 * 1024;
/// Default rotation threshold for the active datafile: 64 MiB.
pub const DEFAULT_MAX_DATAFILE_SIZE: u64 = 64 * 1024 * 1024;

/// How aggressively `Put`/`Delete` flush to durable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Rely on the operating system to flush its buffers; only an explicit
    /// `Sync()` call guarantees durability.
    #[default]
    None,
    /// Fsync the active datafile after every write. Durable but slow.
    Always,
    /// Fsync the active datafile at most once per the given interval of
    /// wall-clock time elapsed since the last sync.
    Interval(Duration),
}

/// Conditions under which the directory as a whole is considered worth
/// merging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeTriggers {
    /// Any single datafile whose dead-key fraction exceeds this ratio marks
    /// the directory as eligible for a merge pass.
    pub fragmentation: f64,
    /// Any single datafile with at least this many dead bytes marks the
    /// directory as eligible for a merge pass.
    pub dead_bytes: u64,
}

impl Default for MergeTriggers {
    fn default() -> Self {
        Self {
            fragmentation: 0.6,
            dead_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Per-datafile cutoffs deciding which datafiles are worth rewriting once a
/// merge pass has been triggered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeThresholds {
    /// A datafile whose dead-key fraction exceeds this ratio is included.
    pub fragmentation: f64,
    /// A datafile with at least this many dead bytes is included.
    pub dead_bytes: u64,
    /// A datafile smaller than this, regardless of fragmentation, is
    /// included too (rewriting it is cheap and keeps the file count down).
    pub small_file: u64,
}

impl Default for MergeThresholds {
    fn default() -> Self {
        Self {
            fragmentation: 0.4,
            dead_bytes: 128 * 1024 * 1024,
            small_file: 10 * 1024 * 1024,
        }
    }
}

/// The merge policy: whether to auto-merge on open, and the trigger/threshold
/// pair described in §4.5 of the specification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeConfig {
    /// Whether `Engine::open` checks the trigger policy and merges before
    /// returning.
    pub auto_merge_on_open: bool,
    pub triggers: MergeTriggers,
    pub thresholds: MergeThresholds,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            auto_merge_on_open: true,
            triggers: MergeTriggers::default(),
            thresholds: MergeThresholds::default(),
        }
    }
}

/// Storage engine configuration, passed to [`Config::open`].
///
/// Every field has a sensible default; call the builder methods to override
/// just the ones a particular test or deployment cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub(crate) max_key_size: u32,
    pub(crate) max_value_size: u32,
    pub(crate) max_datafile_size: u64,
    pub(crate) concurrency: usize,
    pub(crate) sync: SyncStrategy,
    pub(crate) merge: MergeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            max_datafile_size: DEFAULT_MAX_DATAFILE_SIZE,
            concurrency: num_cpus::get(),
            sync: SyncStrategy::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl Config {
    /// Opens (or creates) an engine at `path` with this configuration.
    pub fn open(self, path: impl AsRef<Path>) -> Result<Engine> {
        Engine::open(path, self)
    }

    /// Reject `Put` with `KeyTooLarge` once a key exceeds this length.
    /// Defaults to 64 bytes.
    pub fn max_key_size(&mut self, max_key_size: u32) -> &mut Self {
        self.max_key_size = max_key_size;
        self
    }

    /// Reject `Put` with `ValueTooLarge` once a value exceeds this length.
    /// Defaults to 64 KiB.
    pub fn max_value_size(&mut self, max_value_size: u32) -> &mut Self {
        self.max_value_size = max_value_size;
        self
    }

    /// Rotate the active datafile once it reaches this size. Defaults to 64 MiB.
    pub fn max_datafile_size(&mut self, max_datafile_size: u64) -> &mut Self {
        self.max_datafile_size = max_datafile_size;
        self
    }

    /// Number of cached reader file descriptors kept ready per thread for
    /// concurrent `Get`s. Defaults to the number of logical CPUs.
    pub fn concurrency(&mut self, concurrency: usize) -> &mut Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the durability strategy. Defaults to `SyncStrategy::None`.
    pub fn sync(&mut self, sync: SyncStrategy) -> &mut Self {
        self.sync = sync;
        self
    }

    /// Enable or disable the auto-merge check performed by `open`. Defaults
    /// to enabled.
    pub fn auto_merge_on_open(&mut self, enable: bool) -> &mut Self {
        self.merge.auto_merge_on_open = enable;
        self
    }

    /// Set the directory-wide merge trigger conditions.
    pub fn merge_triggers(&mut self, triggers: MergeTriggers) -> &mut Self {
        self.merge.triggers = triggers;
        self
    }

    /// Set the per-file merge inclusion thresholds.
    pub fn merge_thresholds(&mut self, thresholds: MergeThresholds) -> &mut Self {
        self.merge.thresholds = thresholds;
        self
    }
}
