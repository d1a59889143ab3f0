//! Marten - Memtable (In-Memory Sorted Buffer)
//! The memtable is the write buffer of the LSM tree. Every mutation
//! lands here (after its WAL append) and stays until the memtable is
//! frozen and flushed to a sorted segment.
//!
//! Each key holds its full version chain (newest first) for as long as
//! the memtable is alive, so a snapshot pinned at an older sequence
//! number reads exactly the version that was visible when it was taken.
//! Flushing writes only the newest version per key; older versions stay
//! readable through the pinned memtable until the last snapshot drops it.

use std::collections::BTreeMap;

use crate::types::{Key, Record, SeqNo, Value};

/// One stored version of a key: sequence number plus value or tombstone.
type Version = (SeqNo, Option<Value>);

/// In-memory sorted key-value buffer backed by a BTreeMap.
pub struct MemTable {
    /// Version chains per key, newest version at index 0.
    entries: BTreeMap<Key, Vec<Version>>,
    /// Approximate size of all live versions in bytes.
    size_bytes: usize,
    /// Highest sequence number inserted.
    max_seq: SeqNo,
}

impl MemTable {
    /// Create a new, empty memtable.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            size_bytes: 0,
            max_seq: 0,
        }
    }

    /// Approximate memory footprint in bytes (keys + all versions).
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Number of distinct keys (tombstones included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest sequence number inserted so far (0 when empty).
    pub fn max_seq(&self) -> SeqNo {
        self.max_seq
    }

    /// Insert a record. Sequence numbers must arrive in increasing
    /// order per key; the write mutex in the engine guarantees this.
    pub fn insert(&mut self, record: Record) {
        debug_assert!(record.seq > self.max_seq);
        self.max_seq = self.max_seq.max(record.seq);
        self.size_bytes +=
            record.key.len() + record.value.as_ref().map_or(0, |v| v.len()) + 16;

        let Record { key, value, seq } = record;
        self.entries.entry(key).or_default().insert(0, (seq, value));
    }

    /// Newest version of a key.
    /// `None` means the key has never been written here; `Some((_, None))`
    /// is a tombstone.
    pub fn get(&self, key: &[u8]) -> Option<(SeqNo, Option<&Value>)> {
        self.entries
            .get(key)
            .and_then(|chain| chain.first())
            .map(|(seq, value)| (*seq, value.as_ref()))
    }

    /// Newest version of a key visible at `seq` (inclusive).
    pub fn get_at(&self, key: &[u8], seq: SeqNo) -> Option<(SeqNo, Option<&Value>)> {
        self.entries.get(key).and_then(|chain| {
            chain
                .iter()
                .find(|(s, _)| *s <= seq)
                .map(|(s, value)| (*s, value.as_ref()))
        })
    }

    /// Iterate the newest version of every key in sorted key order.
    /// This is the view a flush persists.
    pub fn iter_newest(&self) -> impl Iterator<Item = (&Key, SeqNo, Option<&Value>)> {
        self.entries.iter().filter_map(|(key, chain)| {
            chain.first().map(|(seq, value)| (key, *seq, value.as_ref()))
        })
    }

    /// Clone the newest version of every key into owned records,
    /// tombstones included. Used to feed merge iterators without
    /// borrowing the memtable across lock boundaries.
    pub fn newest_records(&self) -> Vec<Record> {
        self.iter_newest()
            .map(|(key, seq, value)| Record {
                key: key.clone(),
                value: value.cloned(),
                seq,
            })
            .collect()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}
