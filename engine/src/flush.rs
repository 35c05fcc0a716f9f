//! Flush orchestration: drains the commit log into the sorted store.
//!
//! Two independent triggers attempt a flush: a counter over appended
//! entries and a recurring timer that bounds durability latency under low
//! write volume. The whole read-swap-merge-clear sequence is serialized by
//! one lock, so redundant attempts from either trigger are harmless.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::commitlog::CommitlogManager;
use crate::error::Result;
use crate::sstable::SstManager;
use crate::tasks::PeriodicTask;
use crate::types::Entry;

/// The active commit log pair plus the count-trigger counter, guarded
/// together by the flush lock.
struct LogState {
    commitlog: CommitlogManager,
    buffered: usize,
}

struct DiskWriterInner {
    log: Mutex<LogState>,
    sst: Arc<SstManager>,
    entries_per_commitlog: usize,
}

impl DiskWriterInner {
    /// Drain the active commit log into the sorted store. An empty active
    /// log makes this a no-op, so both triggers may call it redundantly.
    fn try_flush(&self) -> Result<()> {
        let mut state = self.log.lock();
        let drained = state.commitlog.retrieve_all()?;
        if drained.is_empty() {
            return Ok(());
        }
        debug!(entries = drained.len(), "switching commitlogs");
        state.commitlog.swap_commitlogs();
        self.sst.merge_with_commitlog(drained)?;
        state.commitlog.clear_previous()?;
        state.buffered = 0;
        Ok(())
    }
}

/// Drives durability from the commit log into the sorted store.
pub struct DiskWriter {
    inner: Arc<DiskWriterInner>,
    flusher: PeriodicTask,
}

impl DiskWriter {
    pub fn new(
        commitlog: CommitlogManager,
        sst: Arc<SstManager>,
        entries_per_commitlog: usize,
        flush_period: Duration,
    ) -> Self {
        let inner = Arc::new(DiskWriterInner {
            log: Mutex::new(LogState {
                commitlog,
                buffered: 0,
            }),
            sst,
            entries_per_commitlog,
        });
        let flush_inner = Arc::clone(&inner);
        let flusher = PeriodicTask::spawn("commitlog-flush", flush_period, move || {
            flush_inner.try_flush().expect("background flush failed");
        });
        Self { inner, flusher }
    }

    /// Durably append one entry, flushing when the count trigger fires.
    pub fn store(&self, entry: &Entry) -> Result<()> {
        let should_flush = {
            let mut state = self.inner.log.lock();
            state.commitlog.store(entry)?;
            state.buffered += 1;
            state.buffered >= self.inner.entries_per_commitlog
        };
        if should_flush {
            self.try_flush()?;
        }
        Ok(())
    }

    /// Durably append a batch, flushing when the count trigger fires.
    pub fn store_multiple(&self, entries: &[Entry]) -> Result<()> {
        let should_flush = {
            let mut state = self.inner.log.lock();
            state.commitlog.store_multiple(entries)?;
            state.buffered += entries.len();
            state.buffered >= self.inner.entries_per_commitlog
        };
        if should_flush {
            self.try_flush()?;
        }
        Ok(())
    }

    /// Attempt a flush now; a no-op when the active log is empty.
    pub fn try_flush(&self) -> Result<()> {
        self.inner.try_flush()
    }

    /// Stop the timer trigger. Also invoked on drop.
    pub fn stop(&self) {
        self.flusher.stop();
    }
}
