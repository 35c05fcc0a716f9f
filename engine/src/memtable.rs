//! Per-tag memory table: a bounded, time-ordered cache of recent writes.
//!
//! Each tag owns an independent table behind its own lock, so tags never
//! contend with each other. The manager only guards the tag registry, which
//! is append-only after first creation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::now_millis;
use crate::tasks::PeriodicTask;
use crate::types::{Entry, Measurement, Tag, Value};

struct Slot {
    expires_at: u64,
    value: Value,
}

/// Time-ordered cache of recent writes for one tag.
///
/// Keyed by timestamp; re-inserting an existing timestamp overwrites that
/// slot without growing the count.
pub struct MemTable {
    tag: Tag,
    max_entries: usize,
    data: BTreeMap<u64, Slot>,
}

impl MemTable {
    /// `max_entries == 0` means unbounded.
    pub fn new(tag: Tag, max_entries: usize) -> Self {
        Self {
            tag,
            max_entries,
            data: BTreeMap::new(),
        }
    }

    /// Insert one commit log entry if its tag matches this table.
    pub fn store_commitlog_entry(&mut self, entry: &Entry) {
        if entry.tag == self.tag {
            self.save(entry.timestamp, entry.expires_at, entry.value.clone());
        }
    }

    /// Insert the entries of a possibly mixed-tag batch that match this
    /// table's tag.
    pub fn merge_with_commitlog(&mut self, entries: &[Entry]) {
        for entry in entries {
            if entry.tag == self.tag {
                self.save(entry.timestamp, entry.expires_at, entry.value.clone());
            }
        }
    }

    /// Bulk-load tag-scoped measurements sharing one expiry, e.g. to warm
    /// the cache from the sorted store.
    pub fn merge_with_prefetched(&mut self, measurements: &[Measurement], expires_at: u64) {
        for m in measurements {
            self.save(m.timestamp, expires_at, m.value.clone());
        }
    }

    fn save(&mut self, timestamp: u64, expires_at: u64, value: Value) {
        if self.max_entries != 0 && self.data.len() >= self.max_entries {
            // Sliding window over the most recent timestamps: evict the
            // minimum only when the incoming timestamp is strictly newer.
            // An out-of-order backfill at capacity is inserted anyway,
            // transiently holding capacity+1 entries.
            if let Some((&min_ts, _)) = self.data.first_key_value() {
                if min_ts < timestamp {
                    self.data.pop_first();
                }
            }
        }
        self.data.insert(timestamp, Slot { expires_at, value });
    }

    /// Ascending snapshot of every entry.
    pub fn retrieve_all(&self) -> Vec<Measurement> {
        self.retrieve(0, u64::MAX)
    }

    /// Ascending snapshot of the inclusive timestamp range.
    pub fn retrieve(&self, from: u64, to: u64) -> Vec<Measurement> {
        self.data
            .range(from..=to)
            .map(|(&timestamp, slot)| Measurement {
                timestamp,
                value: slot.value.clone(),
            })
            .collect()
    }

    /// (min, max) timestamp held, or (0, 0) when empty.
    pub fn availability(&self) -> (u64, u64) {
        match (self.data.first_key_value(), self.data.last_key_value()) {
            (Some((&min, _)), Some((&max, _))) => (min, max),
            _ => (0, 0),
        }
    }

    /// Delete entries whose expiry is non-zero and strictly below `now`.
    /// Returns how many were removed.
    pub fn perform_expiration(&mut self, now: u64) -> usize {
        let before = self.data.len();
        self.data
            .retain(|_, slot| slot.expires_at == 0 || slot.expires_at >= now);
        before - self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lazily creates and routes to per-tag memory tables, and owns the
/// recurring expiration sweep.
pub struct MemTableManager {
    max_entries_per_tag: usize,
    tables: Arc<DashMap<Tag, Arc<Mutex<MemTable>>>>,
    sweeper: PeriodicTask,
}

impl MemTableManager {
    pub fn new(max_entries_per_tag: usize, expiration_period: Duration) -> Self {
        let tables: Arc<DashMap<Tag, Arc<Mutex<MemTable>>>> = Arc::new(DashMap::new());
        let sweep_tables = Arc::clone(&tables);
        let sweeper = PeriodicTask::spawn("memtable-expiration", expiration_period, move || {
            let now = now_millis();
            let mut removed = 0;
            for table in sweep_tables.iter() {
                removed += table.value().lock().perform_expiration(now);
            }
            if removed > 0 {
                debug!(removed, "memory table expiration sweep");
            }
        });
        Self {
            max_entries_per_tag,
            tables,
            sweeper,
        }
    }

    /// The table for `tag`, created on first use.
    pub fn table_for_tag(&self, tag: &Tag) -> Arc<Mutex<MemTable>> {
        self.tables
            .entry(tag.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(MemTable::new(
                    tag.clone(),
                    self.max_entries_per_tag,
                )))
            })
            .clone()
    }

    pub fn store_commitlog_entry(&self, entry: &Entry) {
        self.table_for_tag(&entry.tag)
            .lock()
            .store_commitlog_entry(entry);
    }

    pub fn merge_with_commitlog_for_tag(&self, tag: &Tag, entries: &[Entry]) {
        self.table_for_tag(tag).lock().merge_with_commitlog(entries);
    }

    /// Combined (min, max) timestamp bounds across all non-empty tables,
    /// or (0, 0) when nothing is cached.
    pub fn availability(&self) -> (u64, u64) {
        let mut min = u64::MAX;
        let mut max = 0u64;
        let mut seen = false;
        for table in self.tables.iter() {
            let (lo, hi) = table.value().lock().availability();
            if (lo, hi) == (0, 0) {
                continue;
            }
            seen = true;
            min = min.min(lo);
            max = max.max(hi);
        }
        if seen { (min, max) } else { (0, 0) }
    }

    /// Stop the expiration sweep. Also invoked on drop.
    pub fn stop(&self) {
        self.sweeper.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(max_entries: usize) -> MemTable {
        MemTable::new(Tag::from("tagZero"), max_entries)
    }

    fn entry(tag: &str, timestamp: u64, value: &str) -> Entry {
        Entry {
            tag: Tag::from(tag),
            timestamp,
            expires_at: 0,
            value: Value::from(value),
        }
    }

    #[test]
    fn test_reinsert_overwrites_in_place() {
        let mut mt = table(0);
        mt.store_commitlog_entry(&entry("tagZero", 1337, "v1"));
        mt.store_commitlog_entry(&entry("tagZero", 1337, "v2"));

        assert_eq!(mt.len(), 1);
        assert_eq!(mt.retrieve_all()[0].value, Value::from("v2"));
    }

    #[test]
    fn test_sliding_window_evicts_oldest() {
        let mut mt = table(3);
        for ts in [1, 2, 3] {
            mt.store_commitlog_entry(&entry("tagZero", ts, "v"));
        }
        mt.store_commitlog_entry(&entry("tagZero", 4, "v"));

        assert_eq!(mt.len(), 3);
        assert_eq!(mt.availability(), (2, 4));
    }

    #[test]
    fn test_backfill_at_capacity_keeps_minimum() {
        let mut mt = table(3);
        for ts in [2, 3, 4] {
            mt.store_commitlog_entry(&entry("tagZero", ts, "v"));
        }

        // Not newer than the current minimum: inserted without eviction.
        mt.store_commitlog_entry(&entry("tagZero", 1, "old"));
        assert_eq!(mt.len(), 4);
        assert_eq!(mt.availability(), (1, 4));
    }

    #[test]
    fn test_retrieve_range_is_inclusive() {
        let mut mt = table(0);
        for ts in [10, 20, 30] {
            mt.store_commitlog_entry(&entry("tagZero", ts, "v"));
        }

        assert_eq!(mt.retrieve(10, 30).len(), 3);
        assert_eq!(mt.retrieve(11, 29).len(), 1);
        assert_eq!(mt.retrieve(31, 40).len(), 0);
        assert_eq!(mt.retrieve_all().len(), 3);
    }

    #[test]
    fn test_availability_empty_is_zero() {
        assert_eq!(table(0).availability(), (0, 0));
    }

    #[test]
    fn test_expiration_respects_zero_and_future() {
        let mut mt = table(0);
        let mut forever = entry("tagZero", 1, "v");
        forever.expires_at = 0;
        let mut stale = entry("tagZero", 2, "v");
        stale.expires_at = 100;
        let mut fresh = entry("tagZero", 3, "v");
        fresh.expires_at = 200;
        mt.merge_with_commitlog(&[forever, stale, fresh]);

        assert_eq!(mt.perform_expiration(150), 1);
        assert_eq!(mt.len(), 2);
        assert_eq!(mt.availability(), (1, 3));
    }

    #[test]
    fn test_mixed_tag_batch_is_filtered() {
        let mut mt = table(0);
        mt.merge_with_commitlog(&[
            entry("tagZero", 1, "mine"),
            entry("tagOther", 2, "foreign"),
            entry("tagZero", 3, "mine"),
        ]);

        assert_eq!(mt.len(), 2);
        assert_eq!(mt.availability(), (1, 3));
    }

    #[test]
    fn test_prefetched_share_one_expiry() {
        let mut mt = table(0);
        let warm = vec![
            Measurement {
                timestamp: 5,
                value: Value::from("a"),
            },
            Measurement {
                timestamp: 6,
                value: Value::from("b"),
            },
        ];
        mt.merge_with_prefetched(&warm, 100);

        assert_eq!(mt.len(), 2);
        assert_eq!(mt.perform_expiration(101), 2);
        assert!(mt.is_empty());
    }

    #[test]
    fn test_manager_routes_and_sweeps() {
        let manager = MemTableManager::new(0, Duration::from_millis(20));

        let mut doomed = entry("tagZero", 1, "v");
        doomed.expires_at = 1; // far in the past
        manager.store_commitlog_entry(&doomed);
        manager.merge_with_commitlog_for_tag(&Tag::from("tagOne"), &[entry("tagOne", 7, "v")]);

        assert_eq!(manager.availability(), (1, 7));

        std::thread::sleep(Duration::from_millis(200));
        assert!(manager.table_for_tag(&Tag::from("tagZero")).lock().is_empty());
        assert_eq!(manager.availability(), (7, 7));
        manager.stop();
    }
}
