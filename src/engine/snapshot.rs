//! Marten - Snapshot Layer
//! Point-in-time consistent reads. A snapshot pins the sequence number
//! current at creation plus `Arc` references to the memtables and
//! segment version live at that moment; everything it references is
//! immutable or version-chained, so later writes, flushes and
//! compactions are invisible to it.
//!
//! The registry tracks which sequence numbers are pinned; compaction
//! consults it before physically dropping tombstones.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::engine::manifest::Version;
use crate::engine::memtable::MemTable;
use crate::error::{MartenError, Result};
use crate::types::{SeqNo, Value};

/// Counts open snapshots per pinned sequence number.
pub struct SnapshotRegistry {
    pinned: Mutex<BTreeMap<SeqNo, usize>>,
    retention: usize,
}

impl SnapshotRegistry {
    pub fn new(retention: usize) -> Self {
        Self {
            pinned: Mutex::new(BTreeMap::new()),
            retention,
        }
    }

    /// Pin `seq`. Fails when the configured snapshot cap is reached.
    pub fn register(&self, seq: SeqNo) -> Result<()> {
        let mut pinned = self.pinned.lock().expect("snapshot registry poisoned");
        let open: usize = pinned.values().sum();
        if open >= self.retention {
            return Err(MartenError::Config(format!(
                "snapshot retention limit of {} reached",
                self.retention
            )));
        }
        *pinned.entry(seq).or_insert(0) += 1;
        Ok(())
    }

    /// Release one pin on `seq`.
    pub fn release(&self, seq: SeqNo) {
        let mut pinned = self.pinned.lock().expect("snapshot registry poisoned");
        if let Some(count) = pinned.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&seq);
            }
        }
    }

    /// Oldest pinned sequence number, if any snapshot is open.
    /// Tombstones at or above this must be retained by compaction.
    pub fn min_pinned(&self) -> Option<SeqNo> {
        self.pinned
            .lock()
            .expect("snapshot registry poisoned")
            .keys()
            .next()
            .copied()
    }

    /// Number of currently open snapshots.
    pub fn open_count(&self) -> usize {
        self.pinned
            .lock()
            .expect("snapshot registry poisoned")
            .values()
            .sum()
    }
}

/// A pinned, consistent view of the database at a fixed sequence
/// number. Cheap to create (a few Arc clones and one registry entry)
/// and released on drop.
pub struct Snapshot {
    seq: SeqNo,
    /// Memtables live at creation, newest first (active, then frozen).
    memtables: Vec<Arc<RwLock<MemTable>>>,
    /// Segment set live at creation.
    version: Arc<Version>,
    registry: Arc<SnapshotRegistry>,
}

impl Snapshot {
    pub(crate) fn new(
        seq: SeqNo,
        memtables: Vec<Arc<RwLock<MemTable>>>,
        version: Arc<Version>,
        registry: Arc<SnapshotRegistry>,
    ) -> Self {
        Self {
            seq,
            memtables,
            version,
            registry,
        }
    }

    /// The sequence number this snapshot is pinned at.
    pub fn seq(&self) -> SeqNo {
        self.seq
    }

    /// Read a key as of this snapshot. Writes committed after the
    /// snapshot was taken are never observed.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        for mem in &self.memtables {
            let guard = mem.read().expect("memtable lock poisoned");
            if let Some((_, value)) = guard.get_at(key, self.seq) {
                return Ok(value.cloned());
            }
        }
        for segment in self.version.segments() {
            // Segments written entirely after the pin cannot hold a
            // visible version.
            if segment.meta().min_seq > self.seq {
                continue;
            }
            if let Some((seq, value)) = segment.get(key)? {
                if seq <= self.seq {
                    return Ok(value);
                }
                // Newer than the pin: an older visible version, if one
                // exists, lives in an older segment.
            }
        }
        Ok(None)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.registry.release(self.seq);
    }
}
