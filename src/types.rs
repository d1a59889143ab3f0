//! Marten - Core Type Definitions
//! Fundamental types shared by every layer of the storage engine.

/// Key type for the storage engine.
/// Arbitrary binary keys are allowed.
pub type Key = Vec<u8>;

/// Value type for the storage engine.
/// Arbitrary binary values are allowed.
pub type Value = Vec<u8>;

/// Sequence number assigned to every mutation.
///
/// Sequence numbers are strictly increasing across the engine's lifetime
/// and totally order all writes. They are assigned under the single write
/// mutex, so ties cannot occur. `0` is reserved to mean "no sequence".
pub type SeqNo = u64;

/// A single versioned mutation: one key, one value (or tombstone), and the
/// sequence number that orders it against every other mutation.
///
/// A `None` value is a tombstone (deletion marker). Tombstones shadow all
/// older records for the same key until compaction can safely purge them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub value: Option<Value>,
    pub seq: SeqNo,
}

impl Record {
    /// Create a record carrying a value (SET operation).
    pub fn set(key: Key, value: Value, seq: SeqNo) -> Self {
        Self {
            key,
            value: Some(value),
            seq,
        }
    }

    /// Create a tombstone record (DELETE operation).
    pub fn tombstone(key: Key, seq: SeqNo) -> Self {
        Self {
            key,
            value: None,
            seq,
        }
    }

    /// Returns true if this record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}
