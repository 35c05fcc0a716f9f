//! Configuration for the storage engine.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage engine.
#[derive(Clone)]
pub struct StoreConfig {
    /// Base path for the two rotating commit log files. The manager derives
    /// `<base>-a.log` and `<base>-b.log` from it.
    pub commitlog_path: PathBuf,
    /// Count trigger: attempt a flush once this many entries are buffered.
    pub entries_per_commitlog: usize,
    /// Timer trigger: attempt a flush at least this often.
    pub flush_period: Duration,
    /// How often the memory tables sweep out expired entries.
    pub memtable_expiration_period: Duration,
    /// Expiry window granted to entries prefetched from the sorted store
    /// into the memory table.
    pub memtable_prefetch_window: Duration,
    /// Root directory for the per-tag sorted store files.
    pub sstable_dir: PathBuf,
    /// Maximum entries held per tag in the memory table, 0 = unbounded.
    pub memtable_max_entries_per_tag: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            commitlog_path: PathBuf::from("./data/commitlog"),
            entries_per_commitlog: 128,
            flush_period: Duration::from_secs(1),
            memtable_expiration_period: Duration::from_secs(1),
            memtable_prefetch_window: Duration::from_secs(60),
            sstable_dir: PathBuf::from("./data/sst"),
            memtable_max_entries_per_tag: 4096,
        }
    }
}
