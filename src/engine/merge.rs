//! Marten - K-Way Merge Iterator
//! Merges multiple sorted record streams (memtables and segments) into
//! a single stream ordered by key, keeping only the highest-sequence
//! record per key. Both compaction and full scans are built on this.
//!
//! Tombstones are NOT filtered here: compaction needs to see them to
//! decide whether they can be purged, and scans filter them afterward.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::types::Record;

/// A boxed sorted record stream.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<Record>> + 'a>;

struct HeapItem {
    record: Record,
    source: usize,
}

// Min-heap on key; for equal keys the higher sequence number (newer
// record) surfaces first. Sequence numbers are globally unique, so
// full ties cannot occur.
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .record
            .key
            .cmp(&self.record.key)
            .then(self.record.seq.cmp(&other.record.seq))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

/// Merges N sorted record streams, yielding one record per key: the
/// one with the highest sequence number across all sources.
pub struct MergeIterator<'a> {
    heap: BinaryHeap<HeapItem>,
    sources: Vec<RecordStream<'a>>,
}

impl<'a> MergeIterator<'a> {
    /// Build a merge over the given sorted sources.
    pub fn new(mut sources: Vec<RecordStream<'a>>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some(record) = iter.next() {
                heap.push(HeapItem {
                    record: record?,
                    source,
                });
            }
        }
        Ok(Self { heap, sources })
    }

    /// Pull the next record from `source` into the heap, if any.
    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(record) = self.sources[source].next() {
            self.heap.push(HeapItem {
                record: record?,
                source,
            });
        }
        Ok(())
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let winner = self.heap.pop()?;
        if let Err(err) = self.refill(winner.source) {
            return Some(Err(err));
        }

        // Discard older versions of the same key from other sources.
        while let Some(item) = self.heap.peek() {
            if item.record.key != winner.record.key {
                break;
            }
            let shadowed = self.heap.pop().expect("peeked item vanished");
            if let Err(err) = self.refill(shadowed.source) {
                return Some(Err(err));
            }
        }

        Some(Ok(winner.record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SeqNo;

    fn stream(records: Vec<Record>) -> RecordStream<'static> {
        Box::new(records.into_iter().map(Ok))
    }

    fn set(key: &[u8], value: &[u8], seq: SeqNo) -> Record {
        Record::set(key.to_vec(), value.to_vec(), seq)
    }

    #[test]
    fn merges_disjoint_sources_in_order() {
        let a = stream(vec![set(b"a", b"1", 1), set(b"c", b"3", 2)]);
        let b = stream(vec![set(b"b", b"2", 3), set(b"d", b"4", 4)]);

        let merged: Vec<Record> = MergeIterator::new(vec![a, b])
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let keys: Vec<&[u8]> = merged.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a" as &[u8], b"b", b"c", b"d"]);
    }

    #[test]
    fn highest_sequence_wins_per_key() {
        let newer = stream(vec![set(b"k", b"new", 9)]);
        let older = stream(vec![set(b"k", b"old", 2), set(b"z", b"tail", 3)]);

        let merged: Vec<Record> = MergeIterator::new(vec![newer, older])
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].value.as_deref(), Some(&b"new"[..]));
        assert_eq!(merged[0].seq, 9);
        assert_eq!(merged[1].key, b"z");
    }

    #[test]
    fn tombstones_pass_through() {
        let newer = stream(vec![Record::tombstone(b"k".to_vec(), 5)]);
        let older = stream(vec![set(b"k", b"hidden", 1)]);

        let merged: Vec<Record> = MergeIterator::new(vec![newer, older])
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_tombstone());
        assert_eq!(merged[0].seq, 5);
    }

    #[test]
    fn three_way_merge_with_overwrites() {
        let s1 = stream(vec![set(b"a", b"a1", 7), set(b"b", b"b1", 8)]);
        let s2 = stream(vec![set(b"a", b"a0", 3), set(b"c", b"c0", 4)]);
        let s3 = stream(vec![set(b"b", b"b-old", 1), set(b"d", b"d0", 2)]);

        let merged: Vec<Record> = MergeIterator::new(vec![s1, s2, s3])
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[0].value.as_deref(), Some(&b"a1"[..]));
        assert_eq!(merged[1].value.as_deref(), Some(&b"b1"[..]));
        assert_eq!(merged[2].value.as_deref(), Some(&b"c0"[..]));
        assert_eq!(merged[3].value.as_deref(), Some(&b"d0"[..]));
    }

    #[test]
    fn empty_sources_yield_nothing() {
        let merged: Vec<Record> = MergeIterator::new(vec![stream(vec![]), stream(vec![])])
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert!(merged.is_empty());
    }
}
