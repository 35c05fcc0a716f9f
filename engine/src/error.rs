//! Error and Result types for the storage engine.

use thiserror::Error;

/// A convenience `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for storage operations.
///
/// I/O failures are fatal: the engine assumes a reliable local disk and
/// never retries a failed open, create, remove, or rename.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record declared more bytes than the file actually holds.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Entry payload does not fit the 2-byte length frame.
    #[error("entry payload of {0} bytes exceeds the frame limit")]
    EntryTooLarge(usize),
}
