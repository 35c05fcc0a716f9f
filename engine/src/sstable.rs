//! Per-tag sorted store: durable, merge-sorted, deduplicated record files.
//!
//! One growing file per tag, created lazily on first merge. Records carry a
//! fixed header (timestamp, expiry, value length) followed by the value
//! bytes. Min/max bounds, the record count, and the sparse seek index are
//! all rebuilt by scanning the file on open, so a cold reopen needs no
//! external metadata.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::types::{Entry, Measurement, Tag, Value};

/// Every Nth record lands in the sparse seek index.
const INDEX_GRANULARITY: usize = 64;

/// Fixed per-record header: timestamp + expiry + value length.
const RECORD_HEADER_LEN: usize = 8 + 8 + 4;

/// One stored record. The expiry is carried through merges but plays no
/// role in range queries.
#[derive(Clone, Debug)]
struct Record {
    timestamp: u64,
    expires_at: u64,
    value: Value,
}

impl Record {
    fn disk_len(&self) -> u64 {
        (RECORD_HEADER_LEN + self.value.len()) as u64
    }
}

fn write_record<W: Write>(writer: &mut W, record: &Record) -> Result<()> {
    writer.write_all(&record.timestamp.to_le_bytes())?;
    writer.write_all(&record.expires_at.to_le_bytes())?;
    writer.write_all(&(record.value.len() as u32).to_le_bytes())?;
    writer.write_all(record.value.as_bytes())?;
    Ok(())
}

/// Read one record, or None at a clean end of file.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let timestamp = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let expires_at = u64::from_le_bytes(header[8..16].try_into().unwrap());
    let value_len = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
    let mut value = vec![0u8; value_len];
    reader.read_exact(&mut value).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            StoreError::CorruptRecord(format!(
                "sorted store record declares {value_len} value bytes but the file ends early"
            ))
        } else {
            StoreError::Io(e)
        }
    })?;
    Ok(Some(Record {
        timestamp,
        expires_at,
        value: Value::new(value),
    }))
}

/// Scan-derived metadata for one tag's file.
struct SstState {
    /// (timestamp, byte offset) of every Nth record, ascending.
    index: Vec<(u64, u64)>,
    min_ts: u64,
    max_ts: u64,
    count: usize,
}

impl SstState {
    fn empty() -> Self {
        Self {
            index: Vec::new(),
            min_ts: 0,
            max_ts: 0,
            count: 0,
        }
    }
}

/// Streams the merged record sequence into a fresh file while tracking the
/// bounds and sparse index for the replacement state.
struct SstFileBuilder {
    writer: BufWriter<File>,
    state: SstState,
    offset: u64,
}

impl SstFileBuilder {
    fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            state: SstState::empty(),
            offset: 0,
        })
    }

    fn push(&mut self, record: &Record) -> Result<()> {
        if self.state.count == 0 {
            self.state.min_ts = record.timestamp;
        }
        self.state.max_ts = record.timestamp;
        if self.state.count % INDEX_GRANULARITY == 0 {
            self.state.index.push((record.timestamp, self.offset));
        }
        write_record(&mut self.writer, record)?;
        self.offset += record.disk_len();
        self.state.count += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<SstState> {
        self.writer.flush()?;
        Ok(self.state)
    }
}

/// The sorted store for one tag.
pub struct SstForTag {
    path: PathBuf,
    state: RwLock<SstState>,
}

impl SstForTag {
    /// Open the store, scanning any existing file to rebuild bounds and the
    /// seek index. The file itself is created lazily on first merge.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            Self::scan(&path)?
        } else {
            SstState::empty()
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn scan(path: &Path) -> Result<SstState> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut state = SstState::empty();
        let mut offset = 0u64;
        while let Some(record) = read_record(&mut reader)? {
            if state.count == 0 {
                state.min_ts = record.timestamp;
            }
            state.max_ts = record.timestamp;
            if state.count % INDEX_GRANULARITY == 0 {
                state.index.push((record.timestamp, offset));
            }
            offset += record.disk_len();
            state.count += 1;
        }
        Ok(state)
    }

    /// Merge-sort a batch into the stored sequence. Timestamp collisions
    /// resolve to the most recently merged value; afterwards the file is
    /// strictly ascending with one record per distinct timestamp.
    ///
    /// The write lock is held across the rewrite-and-rename, so a reader
    /// observes either the pre- or post-merge file, never a torn state.
    pub fn merge_with_commitlog(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut incoming: Vec<Record> = entries
            .iter()
            .map(|e| Record {
                timestamp: e.timestamp,
                expires_at: e.expires_at,
                value: e.value.clone(),
            })
            .collect();
        // Stable sort keeps batch order for equal timestamps, so the later
        // entry of a colliding pair wins the dedup below.
        incoming.sort_by_key(|r| r.timestamp);

        let mut state = self.state.write();

        let mut existing = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let mut stored = match existing.as_mut() {
            Some(reader) => read_record(reader)?,
            None => None,
        };

        let tmp_path = self.path.with_extension("sst.tmp");
        let mut builder = SstFileBuilder::create(&tmp_path)?;
        let mut incoming = incoming.into_iter().peekable();

        loop {
            let stored_ts = stored.as_ref().map(|r| r.timestamp);
            let incoming_ts = incoming.peek().map(|r| r.timestamp);
            let mut next = match (stored_ts, incoming_ts) {
                (None, None) => break,
                (Some(s), Some(n)) if s < n => {
                    let record = stored.take().unwrap();
                    stored = match existing.as_mut() {
                        Some(reader) => read_record(reader)?,
                        None => None,
                    };
                    record
                }
                (Some(s), Some(n)) if s == n => {
                    // Collision: the incoming batch supersedes the stored
                    // record.
                    stored = match existing.as_mut() {
                        Some(reader) => read_record(reader)?,
                        None => None,
                    };
                    incoming.next().unwrap()
                }
                (Some(_), None) => {
                    let record = stored.take().unwrap();
                    stored = match existing.as_mut() {
                        Some(reader) => read_record(reader)?,
                        None => None,
                    };
                    record
                }
                _ => incoming.next().unwrap(),
            };
            // Collapse duplicates within the batch; the last one wins.
            while incoming
                .peek()
                .is_some_and(|n| n.timestamp == next.timestamp)
            {
                next = incoming.next().unwrap();
            }
            builder.push(&next)?;
        }

        drop(existing);
        let merged = builder.finish()?;
        fs::rename(&tmp_path, &self.path)?;
        debug!(records = merged.count, "merged batch into sorted store");
        *state = merged;
        Ok(())
    }

    /// Full ascending dump.
    pub fn get_all_entries(&self) -> Result<Vec<Measurement>> {
        let _state = self.state.read();
        self.scan_range(0, 0, u64::MAX)
    }

    /// (min, max) timestamp of the stored set, or (0, 0) when empty.
    /// Derived purely from persisted state after a cold reopen.
    pub fn availability(&self) -> (u64, u64) {
        let state = self.state.read();
        if state.count == 0 {
            (0, 0)
        } else {
            (state.min_ts, state.max_ts)
        }
    }

    /// Inclusive range read seeking via the sparse index.
    pub fn get_entries_with_index(&self, from: u64, to: u64) -> Result<Vec<Measurement>> {
        let state = self.state.read();
        let offset = match state.index.binary_search_by_key(&from, |&(ts, _)| ts) {
            Ok(i) => state.index[i].1,
            Err(0) => 0,
            Err(i) => state.index[i - 1].1,
        };
        self.scan_range(offset, from, to)
    }

    /// Inclusive range read by full linear scan. Must return exactly what
    /// the indexed path returns for the same inputs.
    pub fn get_entries_without_index(&self, from: u64, to: u64) -> Result<Vec<Measurement>> {
        let _state = self.state.read();
        self.scan_range(0, from, to)
    }

    /// Scan forward from `start_offset`, collecting records within the
    /// inclusive range. Callers hold the state lock.
    fn scan_range(&self, start_offset: u64, from: u64, to: u64) -> Result<Vec<Measurement>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(start_offset))?;

        let mut out = Vec::new();
        while let Some(record) = read_record(&mut reader)? {
            if record.timestamp > to {
                break;
            }
            if record.timestamp >= from {
                out.push(Measurement {
                    timestamp: record.timestamp,
                    value: record.value,
                });
            }
        }
        Ok(out)
    }
}

fn file_name_for_tag(tag: &Tag) -> String {
    let mut name = String::with_capacity(tag.len() * 2 + 4);
    for byte in tag.as_bytes() {
        name.push_str(&format!("{byte:02x}"));
    }
    name.push_str(".sst");
    name
}

fn tag_from_file_stem(stem: &str) -> Option<Tag> {
    if stem.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(stem.len() / 2);
    for i in (0..stem.len()).step_by(2) {
        bytes.push(u8::from_str_radix(&stem[i..i + 2], 16).ok()?);
    }
    Some(Tag::new(bytes))
}

/// Lazily creates and routes to per-tag sorted stores under one root
/// directory. Tags are path-encoded as hex, so a reopened manager can
/// rediscover them by listing the directory.
pub struct SstManager {
    root_dir: PathBuf,
    tables: DashMap<Tag, Arc<SstForTag>>,
}

impl SstManager {
    pub fn open<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir)?;

        let tables = DashMap::new();
        for dirent in fs::read_dir(&root_dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sst") {
                continue;
            }
            let Some(tag) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(tag_from_file_stem)
            else {
                continue;
            };
            tables.insert(tag, Arc::new(SstForTag::open(&path)?));
        }
        Ok(Self { root_dir, tables })
    }

    /// The sorted store for `tag`, created on first use.
    pub fn sst_for_tag(&self, tag: &Tag) -> Result<Arc<SstForTag>> {
        if let Some(sst) = self.tables.get(tag) {
            return Ok(Arc::clone(&sst));
        }
        match self.tables.entry(tag.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Ok(Arc::clone(occupied.get())),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let path = self.root_dir.join(file_name_for_tag(tag));
                let sst = Arc::new(SstForTag::open(path)?);
                vacant.insert(Arc::clone(&sst));
                Ok(sst)
            }
        }
    }

    /// Partition a mixed-tag batch by tag and merge each subset into that
    /// tag's store.
    pub fn merge_with_commitlog(&self, entries: Vec<Entry>) -> Result<()> {
        let mut per_tag: HashMap<Tag, Vec<Entry>> = HashMap::new();
        for entry in entries {
            per_tag.entry(entry.tag.clone()).or_default().push(entry);
        }
        for (tag, batch) in per_tag {
            self.sst_for_tag(&tag)?.merge_with_commitlog(&batch)?;
        }
        Ok(())
    }

    /// Every tag with a sorted store, in no particular order.
    pub fn tags(&self) -> Vec<Tag> {
        self.tables.iter().map(|e| e.key().clone()).collect()
    }

    /// Combined (min, max) timestamp bounds across all non-empty stores,
    /// or (0, 0) when nothing is stored.
    pub fn availability(&self) -> (u64, u64) {
        let mut min = u64::MAX;
        let mut max = 0u64;
        let mut seen = false;
        for table in self.tables.iter() {
            let (lo, hi) = table.value().availability();
            if (lo, hi) == (0, 0) {
                continue;
            }
            seen = true;
            min = min.min(lo);
            max = max.max(hi);
        }
        if seen { (min, max) } else { (0, 0) }
    }
}
