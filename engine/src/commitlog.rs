//! Commit log: durable, append-only buffering ahead of the sorted store.
//!
//! The manager owns two rotating log files (active, previous) so draining
//! one never blocks appends to the other.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::types::Entry;

/// Narrow capability interface over a single append-only log.
///
/// Alternate backends (e.g. [`MemoryCommitlog`] for tests) plug in without
/// touching callers.
pub trait CommitLog: Send {
    /// Append one entry.
    fn store(&mut self, entry: &Entry) -> Result<()>;

    /// Append a batch of entries.
    fn store_multiple(&mut self, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            self.store(entry)?;
        }
        Ok(())
    }

    /// Decode and return every buffered record in append order.
    fn retrieve_all(&mut self) -> Result<Vec<Entry>>;

    /// Number of entries appended since the log was opened or cleared.
    fn count(&self) -> usize;

    /// Truncate the log and reinitialize it for reuse.
    fn clear(&mut self) -> Result<()>;
}

/// Commit log backed by a single append-only file of length-framed entries.
pub struct FileCommitlog {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: usize,
}

impl FileCommitlog {
    /// Open or create the log file for appending. Idempotent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            entries: 0,
        })
    }
}

impl CommitLog for FileCommitlog {
    fn store(&mut self, entry: &Entry) -> Result<()> {
        self.writer.write_all(&entry.to_frame()?)?;
        self.writer.flush()?;
        self.entries += 1;
        Ok(())
    }

    fn store_multiple(&mut self, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            self.writer.write_all(&entry.to_frame()?)?;
            self.entries += 1;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn retrieve_all(&mut self) -> Result<Vec<Entry>> {
        self.writer.flush()?;

        // Scoped read handle, released on every exit path including the
        // corruption path. The append handle stays open throughout.
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        let mut len_buf = [0u8; 2];
        loop {
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u16::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    StoreError::CorruptRecord(format!(
                        "record declares {len} bytes but the log ends early"
                    ))
                } else {
                    StoreError::Io(e)
                }
            })?;
            entries.push(Entry::decode(&payload)?);
        }
        Ok(entries)
    }

    fn count(&self) -> usize {
        self.entries
    }

    fn clear(&mut self) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.entries = 0;
        Ok(())
    }
}

/// In-memory commit log for tests and embedding without a disk.
#[derive(Default)]
pub struct MemoryCommitlog {
    entries: Vec<Entry>,
}

impl CommitLog for MemoryCommitlog {
    fn store(&mut self, entry: &Entry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn retrieve_all(&mut self) -> Result<Vec<Entry>> {
        Ok(self.entries.clone())
    }

    fn count(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Owns the active/previous log pair, enabling swap-and-drain: the active
/// log keeps accepting appends while the previous one is merged and cleared.
pub struct CommitlogManager {
    logs: [Box<dyn CommitLog>; 2],
    active: usize,
}

impl CommitlogManager {
    /// Open both log files derived from `base`, creating parent directories
    /// as needed. Idempotent.
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref();
        if let Some(parent) = base.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "commitlog".to_string());
        let a = FileCommitlog::open(base.with_file_name(format!("{name}-a.log")))?;
        let b = FileCommitlog::open(base.with_file_name(format!("{name}-b.log")))?;
        Ok(Self::with_logs(Box::new(a), Box::new(b)))
    }

    /// Build a manager over explicit log backends; the first is active.
    pub fn with_logs(active: Box<dyn CommitLog>, previous: Box<dyn CommitLog>) -> Self {
        Self {
            logs: [active, previous],
            active: 0,
        }
    }

    pub fn store(&mut self, entry: &Entry) -> Result<()> {
        self.logs[self.active].store(entry)
    }

    pub fn store_multiple(&mut self, entries: &[Entry]) -> Result<()> {
        self.logs[self.active].store_multiple(entries)
    }

    /// Decode every record in the active log, in append order.
    pub fn retrieve_all(&mut self) -> Result<Vec<Entry>> {
        self.logs[self.active].retrieve_all()
    }

    pub fn count(&self) -> usize {
        self.logs[self.active].count()
    }

    /// Exchange the active/previous roles; subsequent appends land in the
    /// newly active log.
    pub fn swap_commitlogs(&mut self) {
        self.active = 1 - self.active;
    }

    /// Truncate the previous log, called only after its contents are
    /// durably merged elsewhere.
    pub fn clear_previous(&mut self) -> Result<()> {
        self.logs[1 - self.active].clear()
    }

    /// Truncate the active log.
    pub fn clear_active(&mut self) -> Result<()> {
        self.logs[self.active].clear()
    }
}
