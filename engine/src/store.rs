//! Write/read façade over the commit log, memory tables, and sorted store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::commitlog::CommitlogManager;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::flush::DiskWriter;
use crate::memtable::MemTableManager;
use crate::now_millis;
use crate::sstable::SstManager;
use crate::types::{Entry, Measurement, Tag, TaggedMeasurement};

/// Wire up the engine and return independent reader and writer handles
/// sharing the underlying managers.
pub fn open(config: StoreConfig) -> Result<(StorageReader, StorageWriter)> {
    let commitlog = CommitlogManager::open(&config.commitlog_path)?;
    let sst = Arc::new(SstManager::open(&config.sstable_dir)?);
    let disk = Arc::new(DiskWriter::new(
        commitlog,
        Arc::clone(&sst),
        config.entries_per_commitlog,
        config.flush_period,
    ));
    let memtables = Arc::new(MemTableManager::new(
        config.memtable_max_entries_per_tag,
        config.memtable_expiration_period,
    ));

    let writer = StorageWriter {
        disk,
        memtables: Arc::clone(&memtables),
    };
    let reader = StorageReader {
        memtables,
        sst,
        prefetch_window: config.memtable_prefetch_window,
    };
    Ok((reader, writer))
}

/// Converts external write calls into commit log appends and memory table
/// inserts.
pub struct StorageWriter {
    disk: Arc<DiskWriter>,
    memtables: Arc<MemTableManager>,
}

impl StorageWriter {
    /// Store one measurement. Every write path mirrors into the memory
    /// table, so single writes are readable from the cache too.
    pub fn store(&self, data: TaggedMeasurement, expires_at: u64) -> Result<()> {
        let entry = Entry {
            tag: data.tag,
            timestamp: data.timestamp,
            expires_at,
            value: data.value,
        };
        self.disk.store(&entry)?;
        self.memtables.store_commitlog_entry(&entry);
        Ok(())
    }

    /// Store tag-grouped measurements sharing one expiry. Durability and
    /// cache population both complete before the call returns.
    pub fn store_multiple(
        &self,
        data: HashMap<Tag, Vec<Measurement>>,
        expires_at: u64,
    ) -> Result<()> {
        for (tag, measurements) in data {
            let entries: Vec<Entry> = measurements
                .into_iter()
                .map(|m| Entry {
                    tag: tag.clone(),
                    timestamp: m.timestamp,
                    expires_at,
                    value: m.value,
                })
                .collect();
            self.disk.store_multiple(&entries)?;
            self.memtables.merge_with_commitlog_for_tag(&tag, &entries);
        }
        Ok(())
    }

    /// Store a mixed-tag batch sharing one expiry.
    pub fn store_batch(&self, data: Vec<TaggedMeasurement>, expires_at: u64) -> Result<()> {
        let mut per_tag: HashMap<Tag, Vec<Measurement>> = HashMap::new();
        for m in data {
            per_tag.entry(m.tag).or_default().push(Measurement {
                timestamp: m.timestamp,
                value: m.value,
            });
        }
        self.store_multiple(per_tag, expires_at)
    }
}

/// Serves range queries spanning the memory table (hot) and the sorted
/// store (cold), warming the cache with whatever the cold read surfaces.
pub struct StorageReader {
    memtables: Arc<MemTableManager>,
    sst: Arc<SstManager>,
    prefetch_window: Duration,
}

impl StorageReader {
    /// Ascending measurements per requested tag over the inclusive range.
    pub fn retrieve(
        &self,
        tags: &[Tag],
        from: u64,
        to: u64,
    ) -> Result<HashMap<Tag, Vec<Measurement>>> {
        let mut response = HashMap::with_capacity(tags.len());
        for tag in tags {
            response.insert(tag.clone(), self.retrieve_for_tag(tag, from, to)?);
        }
        Ok(response)
    }

    fn retrieve_for_tag(&self, tag: &Tag, from: u64, to: u64) -> Result<Vec<Measurement>> {
        let table = self.memtables.table_for_tag(tag);
        let (cached, memt_min) = {
            let table = table.lock();
            (!table.is_empty(), table.availability().0)
        };

        let mut merged: BTreeMap<u64, Measurement> = BTreeMap::new();

        // Anything older than the memory table's horizon comes from the
        // sorted store.
        if !cached || from < memt_min {
            let cold_to = if cached {
                to.min(memt_min.saturating_sub(1))
            } else {
                to
            };
            let cold = self
                .sst
                .sst_for_tag(tag)?
                .get_entries_with_index(from, cold_to)?;
            if !cold.is_empty() {
                let expires_at = now_millis() + self.prefetch_window.as_millis() as u64;
                table.lock().merge_with_prefetched(&cold, expires_at);
                for m in cold {
                    merged.insert(m.timestamp, m);
                }
            }
        }

        // The hot portion wins at the boundary.
        for m in table.lock().retrieve(from, to) {
            merged.insert(m.timestamp, m);
        }

        Ok(merged.into_values().collect())
    }

    /// Global [min, max] timestamp range: the oldest sorted-store boundary
    /// combined with the newest memory-table boundary across known tags,
    /// falling back to the other source when one side is empty.
    pub fn availability(&self) -> (u64, u64) {
        let (sst_min, sst_max) = self.sst.availability();
        let (memt_min, memt_max) = self.memtables.availability();
        let from = if sst_min != 0 { sst_min } else { memt_min };
        let to = if memt_max != 0 { memt_max } else { sst_max };
        (from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use tempfile::TempDir;

    const TAG: &str = "whatever";

    fn dummy_data(count: usize) -> Vec<Measurement> {
        (0..count)
            .map(|i| Measurement {
                timestamp: 1337 + i as u64,
                value: Value::new(vec![i as u8; 4]),
            })
            .collect()
    }

    fn slice(data: &[Measurement], from: usize, to: usize) -> HashMap<Tag, Vec<Measurement>> {
        let mut map = HashMap::new();
        map.insert(Tag::from(TAG), data[from..to].to_vec());
        map
    }

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            commitlog_path: dir.path().join("commitlog"),
            entries_per_commitlog: 10,
            flush_period: Duration::from_millis(50),
            memtable_expiration_period: Duration::from_secs(10),
            memtable_prefetch_window: Duration::from_secs(10),
            sstable_dir: dir.path().join("sst"),
            memtable_max_entries_per_tag: 9999,
        }
    }

    #[test]
    fn test_storage_writer_populates_both_stores() {
        let dir = TempDir::new().unwrap();
        let commitlog = CommitlogManager::open(dir.path().join("commitlog")).unwrap();
        let sst = Arc::new(SstManager::open(dir.path().join("sst")).unwrap());
        let disk = Arc::new(DiskWriter::new(
            commitlog,
            Arc::clone(&sst),
            10,
            Duration::from_millis(50),
        ));
        let memtables = Arc::new(MemTableManager::new(9999, Duration::from_secs(10)));
        let writer = StorageWriter {
            disk,
            memtables: Arc::clone(&memtables),
        };

        let data = dummy_data(25);
        writer.store_multiple(slice(&data, 0, 16), 0).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        writer.store_multiple(slice(&data, 16, 20), 0).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        writer.store_multiple(slice(&data, 20, 25), 0).unwrap();
        std::thread::sleep(Duration::from_millis(400));

        let tag = Tag::from(TAG);
        let on_disk = sst.sst_for_tag(&tag).unwrap().get_all_entries().unwrap();
        let cached = memtables.table_for_tag(&tag).lock().retrieve_all();

        assert_eq!(on_disk.len(), data.len());
        assert_eq!(cached.len(), data.len());
        for i in 0..data.len() {
            assert_eq!(on_disk[i], data[i]);
            assert_eq!(cached[i], data[i]);
        }
    }

    #[test]
    fn test_reader_retrieve_and_availability() {
        let dir = TempDir::new().unwrap();
        let (reader, writer) = open(test_config(&dir)).unwrap();

        let data = dummy_data(25);
        writer.store_multiple(slice(&data, 0, 25), 0).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let tag = Tag::from(TAG);
        let response = reader.retrieve(&[tag.clone()], 1336, 1500).unwrap();
        assert_eq!(response.len(), 1);
        let retrieved = &response[&tag];
        assert_eq!(retrieved.len(), data.len());
        for i in 0..data.len() {
            assert_eq!(retrieved[i], data[i]);
        }

        assert_eq!(reader.availability(), (1337, 1361));
    }

    #[test]
    fn test_store_batch_groups_by_tag() {
        let dir = TempDir::new().unwrap();
        let (reader, writer) = open(test_config(&dir)).unwrap();

        let batch = vec![
            TaggedMeasurement {
                tag: Tag::from("tagZero"),
                timestamp: 10,
                value: Value::from("a"),
            },
            TaggedMeasurement {
                tag: Tag::from("tagOne"),
                timestamp: 11,
                value: Value::from("b"),
            },
            TaggedMeasurement {
                tag: Tag::from("tagZero"),
                timestamp: 12,
                value: Value::from("c"),
            },
        ];
        writer.store_batch(batch, 0).unwrap();

        let tags = [Tag::from("tagZero"), Tag::from("tagOne")];
        let response = reader.retrieve(&tags, 0, 100).unwrap();
        assert_eq!(response[&tags[0]].len(), 2);
        assert_eq!(response[&tags[1]].len(), 1);
        assert_eq!(response[&tags[0]][0].value, Value::from("a"));
        assert_eq!(response[&tags[0]][1].value, Value::from("c"));
    }

    #[test]
    fn test_single_store_mirrors_into_memtable() {
        let dir = TempDir::new().unwrap();
        let commitlog = CommitlogManager::open(dir.path().join("commitlog")).unwrap();
        let sst = Arc::new(SstManager::open(dir.path().join("sst")).unwrap());
        let disk = Arc::new(DiskWriter::new(
            commitlog,
            Arc::clone(&sst),
            1000,
            Duration::from_secs(60),
        ));
        let memtables = Arc::new(MemTableManager::new(9999, Duration::from_secs(10)));
        let writer = StorageWriter {
            disk: Arc::clone(&disk),
            memtables: Arc::clone(&memtables),
        };

        let tag = Tag::from(TAG);
        writer
            .store(
                TaggedMeasurement {
                    tag: tag.clone(),
                    timestamp: 1337,
                    value: Value::from("single"),
                },
                0,
            )
            .unwrap();

        // Cached immediately, durable after an explicit flush.
        assert_eq!(memtables.table_for_tag(&tag).lock().len(), 1);
        assert_eq!(sst.availability(), (0, 0));
        disk.try_flush().unwrap();
        assert_eq!(
            sst.sst_for_tag(&tag).unwrap().get_all_entries().unwrap().len(),
            1
        );
    }

    #[test]
    fn test_cold_and_hot_ranges_merge_at_boundary() {
        let dir = TempDir::new().unwrap();
        let sst = Arc::new(SstManager::open(dir.path().join("sst")).unwrap());
        let memtables = Arc::new(MemTableManager::new(9999, Duration::from_secs(10)));
        let reader = StorageReader {
            memtables: Arc::clone(&memtables),
            sst: Arc::clone(&sst),
            prefetch_window: Duration::from_secs(10),
        };

        let tag = Tag::from(TAG);
        let cold: Vec<Entry> = (100..=120)
            .map(|ts| Entry {
                tag: tag.clone(),
                timestamp: ts,
                expires_at: 0,
                value: Value::from("cold"),
            })
            .collect();
        sst.merge_with_commitlog(cold).unwrap();
        let hot: Vec<Entry> = (115..=130)
            .map(|ts| Entry {
                tag: tag.clone(),
                timestamp: ts,
                expires_at: 0,
                value: Value::from("hot"),
            })
            .collect();
        memtables.merge_with_commitlog_for_tag(&tag, &hot);

        let response = reader.retrieve(&[tag.clone()], 90, 200).unwrap();
        let merged = &response[&tag];
        assert_eq!(merged.len(), 31);
        for pair in merged.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
        for m in merged {
            let expected = if m.timestamp < 115 { "cold" } else { "hot" };
            assert_eq!(m.value, Value::from(expected), "at ts {}", m.timestamp);
        }

        // The cold portion was prefetched into the memory table.
        assert_eq!(memtables.table_for_tag(&tag).lock().len(), 31);
    }

    #[test]
    fn test_concurrent_multi_tag_ingestion() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.entries_per_commitlog = 100;
        config.memtable_max_entries_per_tag = 0;
        let (reader, writer) = open(config).unwrap();
        let writer = Arc::new(writer);

        const TAGS: usize = 16;
        const PER_TAG: usize = 30;

        let handles: Vec<_> = (0..TAGS)
            .map(|id| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    let tag = Tag::new(format!("tag{id}").into_bytes());
                    for i in 0..PER_TAG {
                        writer
                            .store(
                                TaggedMeasurement {
                                    tag: tag.clone(),
                                    timestamp: 1000 + i as u64,
                                    value: Value::new(vec![id as u8; 5]),
                                },
                                0,
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        std::thread::sleep(Duration::from_millis(400));

        for id in 0..TAGS {
            let tag = Tag::new(format!("tag{id}").into_bytes());
            let response = reader.retrieve(&[tag.clone()], 0, u64::MAX).unwrap();
            let measurements = &response[&tag];
            assert_eq!(measurements.len(), PER_TAG, "lost entries for tag{id}");
            for (i, m) in measurements.iter().enumerate() {
                assert_eq!(m.timestamp, 1000 + i as u64);
                assert_eq!(m.value, Value::new(vec![id as u8; 5]));
            }
        }
    }
}
