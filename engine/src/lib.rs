//! Per-tag LSM storage engine for timestamp-ordered measurements.
//!
//! Architecture:
//! - Commit log: rotating append-only durability buffer
//! - Memory table: bounded per-tag cache of recent writes with TTL sweep
//! - Sorted store: per-tag merge-sorted, deduplicated on-disk records
//! - Flush orchestrator: drains the commit log into the sorted store
//! - Store façade: independent write/read handles over the managers

pub mod commitlog;
pub mod config;
pub mod error;
pub mod flush;
pub mod memtable;
pub mod sstable;
pub mod store;
pub mod types;

mod tasks;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use store::{StorageReader, StorageWriter, open};
pub use types::{Entry, Measurement, Tag, TaggedMeasurement, Value};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
