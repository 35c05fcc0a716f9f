//! Core record shapes shared across the engine.

use crate::error::{Result, StoreError};

/// Partition key. All ordering, capacity, and expiry policy is scoped to a
/// single tag.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Tag(pub Vec<u8>);

impl Tag {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Tag {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<Vec<u8>> for Tag {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

/// Opaque measurement payload. The engine never inspects it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Value(pub Vec<u8>);

impl Value {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Value {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

/// A durable write record.
///
/// `expires_at == 0` means the entry never expires. Timestamps are unsigned
/// milliseconds; duplicates are allowed at ingestion and resolve to the most
/// recently merged value in the sorted store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub tag: Tag,
    pub timestamp: u64,
    pub expires_at: u64,
    pub value: Value,
}

impl Entry {
    /// Serialize as a length-framed commit log record: a 2-byte little-endian
    /// payload length, then tag length (u16 LE) + tag + timestamp (u64 LE) +
    /// expiry (u64 LE) + value bytes.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let payload_len = 2 + self.tag.len() + 16 + self.value.len();
        if payload_len > u16::MAX as usize {
            return Err(StoreError::EntryTooLarge(payload_len));
        }
        let mut frame = Vec::with_capacity(2 + payload_len);
        frame.extend_from_slice(&(payload_len as u16).to_le_bytes());
        frame.extend_from_slice(&(self.tag.len() as u16).to_le_bytes());
        frame.extend_from_slice(self.tag.as_bytes());
        frame.extend_from_slice(&self.timestamp.to_le_bytes());
        frame.extend_from_slice(&self.expires_at.to_le_bytes());
        frame.extend_from_slice(self.value.as_bytes());
        Ok(frame)
    }

    /// Decode one record payload (a frame minus its length prefix).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(StoreError::CorruptRecord(
                "record shorter than its tag length prefix".into(),
            ));
        }
        let tag_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        let header_len = 2 + tag_len + 16;
        if payload.len() < header_len {
            return Err(StoreError::CorruptRecord(format!(
                "record of {} bytes cannot hold a {}-byte tag",
                payload.len(),
                tag_len
            )));
        }
        let tag = Tag::from_slice(&payload[2..2 + tag_len]);
        let timestamp =
            u64::from_le_bytes(payload[2 + tag_len..2 + tag_len + 8].try_into().unwrap());
        let expires_at =
            u64::from_le_bytes(payload[2 + tag_len + 8..header_len].try_into().unwrap());
        let value = Value::from_slice(&payload[header_len..]);
        Ok(Self {
            tag,
            timestamp,
            expires_at,
            value,
        })
    }
}

/// A timestamped value; the tag is implicit from the enclosing request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Measurement {
    pub timestamp: u64,
    pub value: Value,
}

/// A self-describing measurement, used for mixed-tag batches.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaggedMeasurement {
    pub tag: Tag,
    pub timestamp: u64,
    pub value: Value,
}
