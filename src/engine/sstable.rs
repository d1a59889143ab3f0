//! Marten - Sorted Segments
//! Immutable, sorted, indexed on-disk files produced by memtable
//! flushes and compaction. Once written a segment is never mutated,
//! only superseded by compaction and deleted after its last reader
//! releases it.
//!
//! ## File Layout
//! ```text
//! [entry]*                      sorted entry stream
//! [sparse index]                bincode Vec<(key, offset)>, every Nth entry
//! [bloom filter]                bincode BloomFilter
//! [meta]                        bincode SegmentMeta
//! [footer: 56 bytes]            six u64 offsets/lengths + magic
//! ```
//!
//! ## Entry Format
//! ```text
//! [seq: 8 (LE)][flags: 1][key_len: 4 (LE)][key][val_len: 4 (LE)][value][crc32: 4 (LE)]
//! ```
//!
//! Writes go to a temp file that is fsynced and then renamed into
//! place, so a crash can never expose a half-written segment.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::engine::bloom::BloomFilter;
use crate::error::{MartenError, Result};
use crate::types::{Key, Record, SeqNo};

/// "mrtnseg1" in LE bytes.
pub const SEGMENT_MAGIC: u64 = 0x3167_6573_6e74_726d;

const FLAG_TOMBSTONE: u8 = 0x01;
const ENTRY_OVERHEAD: usize = 8 + 1 + 4 + 4 + 4;
const FOOTER_SIZE: usize = 56;

/// One sparse index entry is recorded every this many data entries.
const SPARSE_INDEX_INTERVAL: usize = 16;

/// Persistent metadata describing one sorted segment. Stored both in
/// the segment file itself and in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Unique, monotonically assigned segment identifier.
    pub id: u64,
    /// Bytes of entry data (excludes index/filter/meta/footer).
    pub data_size: u64,
    /// Number of entries, tombstones included.
    pub entry_count: u64,
    /// Smallest key in the segment.
    pub min_key: Key,
    /// Largest key in the segment.
    pub max_key: Key,
    /// Lowest sequence number stored.
    pub min_seq: SeqNo,
    /// Highest sequence number stored.
    pub max_seq: SeqNo,
}

/// Path of the segment file for `id` inside `dir`.
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:020}.seg", id))
}

fn temp_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:020}.seg.tmp", id))
}

fn encode_entry(key: &[u8], seq: SeqNo, value: Option<&[u8]>) -> BytesMut {
    let val = value.unwrap_or(&[]);
    let mut buf = BytesMut::with_capacity(ENTRY_OVERHEAD + key.len() + val.len());
    buf.put_u64_le(seq);
    buf.put_u8(if value.is_none() { FLAG_TOMBSTONE } else { 0 });
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key);
    buf.put_u32_le(val.len() as u32);
    buf.put_slice(val);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf
}

/// Decode one entry from `buf`, returning the record and bytes consumed.
fn decode_entry(buf: &[u8]) -> Result<(Record, usize)> {
    if buf.len() < ENTRY_OVERHEAD {
        return Err(MartenError::Corruption(
            "segment entry truncated".into(),
        ));
    }
    let seq = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let flags = buf[8];
    let key_len = u32::from_le_bytes(buf[9..13].try_into().unwrap()) as usize;

    let mut pos = 13;
    if buf.len() < pos + key_len + 4 {
        return Err(MartenError::Corruption("segment key truncated".into()));
    }
    let key = buf[pos..pos + key_len].to_vec();
    pos += key_len;

    let val_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    if buf.len() < pos + val_len + 4 {
        return Err(MartenError::Corruption("segment value truncated".into()));
    }
    let value = buf[pos..pos + val_len].to_vec();
    pos += val_len;

    let stored_crc = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
    if stored_crc != crc32fast::hash(&buf[..pos]) {
        return Err(MartenError::Corruption(format!(
            "segment entry CRC mismatch for key {:?}",
            String::from_utf8_lossy(&key)
        )));
    }
    pos += 4;

    let record = if flags & FLAG_TOMBSTONE != 0 {
        Record::tombstone(key, seq)
    } else {
        Record::set(key, value, seq)
    };
    Ok((record, pos))
}

/// Builds one sorted segment from a stream of records already in key
/// order (a memtable's newest versions, or a compaction merge).
pub struct SegmentBuilder {
    dir: PathBuf,
    tmp: PathBuf,
    writer: BufWriter<File>,
    id: u64,
    offset: u64,
    index: Vec<(Key, u64)>,
    bloom: BloomFilter,
    entry_count: u64,
    min_key: Option<Key>,
    max_key: Option<Key>,
    min_seq: SeqNo,
    max_seq: SeqNo,
}

impl SegmentBuilder {
    /// Start building segment `id` in `dir`. `expected_entries` sizes
    /// the bloom filter.
    pub fn new(dir: &Path, id: u64, expected_entries: usize) -> Result<Self> {
        let tmp = temp_path(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            tmp,
            writer: BufWriter::new(file),
            id,
            offset: 0,
            index: Vec::new(),
            bloom: BloomFilter::new(expected_entries, 0.01),
            entry_count: 0,
            min_key: None,
            max_key: None,
            min_seq: SeqNo::MAX,
            max_seq: 0,
        })
    }

    /// Append one record. Keys MUST arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], seq: SeqNo, value: Option<&[u8]>) -> Result<()> {
        debug_assert!(self.max_key.as_deref().map_or(true, |last| last < key));

        if self.entry_count as usize % SPARSE_INDEX_INTERVAL == 0 {
            self.index.push((key.to_vec(), self.offset));
        }
        self.bloom.insert(key);

        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.max_key = Some(key.to_vec());
        self.min_seq = self.min_seq.min(seq);
        self.max_seq = self.max_seq.max(seq);
        self.entry_count += 1;

        let encoded = encode_entry(key, seq, value);
        self.writer.write_all(&encoded)?;
        self.offset += encoded.len() as u64;
        Ok(())
    }

    /// Number of entries added so far.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Discard the partially written segment (compaction abort path).
    pub fn abandon(self) -> Result<()> {
        drop(self.writer);
        fs::remove_file(&self.tmp)?;
        Ok(())
    }

    /// Finalize: write index, filter, meta and footer, fsync, then
    /// atomically rename the temp file into place.
    pub fn finish(mut self) -> Result<SegmentMeta> {
        let meta = SegmentMeta {
            id: self.id,
            data_size: self.offset,
            entry_count: self.entry_count,
            min_key: self.min_key.take().unwrap_or_default(),
            max_key: self.max_key.take().unwrap_or_default(),
            min_seq: if self.entry_count == 0 { 0 } else { self.min_seq },
            max_seq: self.max_seq,
        };

        let index_bytes = bincode::serialize(&self.index)?;
        let bloom_bytes = bincode::serialize(&self.bloom)?;
        let meta_bytes = bincode::serialize(&meta)?;

        let index_off = self.offset;
        let bloom_off = index_off + index_bytes.len() as u64;
        let meta_off = bloom_off + bloom_bytes.len() as u64;

        self.writer.write_all(&index_bytes)?;
        self.writer.write_all(&bloom_bytes)?;
        self.writer.write_all(&meta_bytes)?;

        let mut footer = BytesMut::with_capacity(FOOTER_SIZE);
        footer.put_u64_le(index_off);
        footer.put_u64_le(index_bytes.len() as u64);
        footer.put_u64_le(bloom_off);
        footer.put_u64_le(bloom_bytes.len() as u64);
        footer.put_u64_le(meta_off);
        footer.put_u64_le(meta_bytes.len() as u64);
        footer.put_u64_le(SEGMENT_MAGIC);
        debug_assert_eq!(footer.len(), FOOTER_SIZE);
        self.writer.write_all(&footer)?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        // Atomic visibility: a crash before this rename leaves only an
        // unreferenced temp file, cleaned up on the next open.
        let final_path = segment_path(&self.dir, self.id);
        fs::rename(&self.tmp, &final_path)?;

        log::info!(
            "wrote segment {} ({} entries, {} data bytes)",
            self.id,
            meta.entry_count,
            meta.data_size
        );
        Ok(meta)
    }
}

/// An opened, immutable sorted segment.
///
/// The sparse index and bloom filter live in memory; data entries are
/// read on demand. `get` locks the shared file handle only for the one
/// bounded window read it needs.
pub struct SegmentReader {
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<(Key, u64)>,
    bloom: BloomFilter,
    meta: SegmentMeta,
    /// Marks the file for deletion once the last reference drops.
    obsolete: AtomicBool,
}

impl SegmentReader {
    /// Open a segment file: read the footer, then load the sparse
    /// index, bloom filter and metadata into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_SIZE as u64 {
            return Err(MartenError::Corruption(format!(
                "segment {:?} too short for footer",
                path
            )));
        }

        file.seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;

        let word = |i: usize| u64::from_le_bytes(footer[i * 8..i * 8 + 8].try_into().unwrap());
        if word(6) != SEGMENT_MAGIC {
            return Err(MartenError::Corruption(format!(
                "segment {:?} has bad magic",
                path
            )));
        }

        let read_block = |file: &mut File, off: u64, len: u64| -> Result<Vec<u8>> {
            if off + len > file_len {
                return Err(MartenError::Corruption(format!(
                    "segment {:?} block out of bounds",
                    path
                )));
            }
            file.seek(SeekFrom::Start(off))?;
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf)?;
            Ok(buf)
        };

        let index: Vec<(Key, u64)> =
            bincode::deserialize(&read_block(&mut file, word(0), word(1))?)?;
        let bloom: BloomFilter =
            bincode::deserialize(&read_block(&mut file, word(2), word(3))?)?;
        let meta: SegmentMeta =
            bincode::deserialize(&read_block(&mut file, word(4), word(5))?)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index,
            bloom,
            meta,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Point lookup. Returns the stored version (sequence number plus
    /// value or tombstone), or `None` if this segment has no record
    /// for the key.
    pub fn get(&self, key: &[u8]) -> Result<Option<(SeqNo, Option<Vec<u8>>)>> {
        if self.meta.entry_count == 0
            || key < self.meta.min_key.as_slice()
            || key > self.meta.max_key.as_slice()
        {
            return Ok(None);
        }
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }

        // Last sparse index entry with index_key <= key bounds the scan
        // window to at most one index interval.
        let idx = self.index.partition_point(|(k, _)| k.as_slice() <= key);
        if idx == 0 {
            return Ok(None);
        }
        let start = self.index[idx - 1].1;
        let end = self
            .index
            .get(idx)
            .map(|(_, off)| *off)
            .unwrap_or(self.meta.data_size);

        let mut window = vec![0u8; (end - start) as usize];
        {
            let mut file = self.file.lock().expect("segment file lock poisoned");
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut window)?;
        }

        let mut pos = 0usize;
        while pos < window.len() {
            let (record, consumed) = decode_entry(&window[pos..])?;
            pos += consumed;
            match record.key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => {
                    return Ok(Some((record.seq, record.value)));
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Iterate every entry in key order. The iterator owns its own
    /// file handle, so it is independent of concurrent `get`s and can
    /// be recreated (restarted) at any time.
    pub fn iter(&self) -> Result<SegmentIter> {
        SegmentIter::new(&self.path, 0, self.meta.data_size, None, None)
    }

    /// Iterate entries with `start <= key < end` (either bound optional).
    pub fn iter_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<SegmentIter> {
        let start_off = match start {
            Some(key) => {
                let idx = self.index.partition_point(|(k, _)| k.as_slice() <= key);
                if idx == 0 {
                    0
                } else {
                    self.index[idx - 1].1
                }
            }
            None => 0,
        };
        SegmentIter::new(
            &self.path,
            start_off,
            self.meta.data_size,
            start.map(|k| k.to_vec()),
            end.map(|k| k.to_vec()),
        )
    }

    /// Mark the underlying file for deletion once every reference
    /// (current version, pinned snapshots) has been dropped.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            if let Err(err) = fs::remove_file(&self.path) {
                log::warn!("failed to delete obsolete segment {:?}: {}", self.path, err);
            } else {
                log::debug!("deleted obsolete segment {:?}", self.path);
            }
        }
    }
}

/// Lazy, finite, restartable iterator over a segment's entry stream.
pub struct SegmentIter {
    file: File,
    pos: u64,
    data_end: u64,
    /// Entries below this key are skipped (range start bound).
    skip_below: Option<Key>,
    /// Iteration stops at this key (range end bound, exclusive).
    stop_at: Option<Key>,
    done: bool,
}

impl SegmentIter {
    fn new(
        path: &Path,
        start: u64,
        data_end: u64,
        skip_below: Option<Key>,
        stop_at: Option<Key>,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            file,
            pos: start,
            data_end,
            skip_below,
            stop_at,
            done: false,
        })
    }

    fn read_one(&mut self) -> Result<Record> {
        // Header: seq + flags + key_len.
        let mut head = [0u8; 13];
        self.file.read_exact(&mut head)?;
        let key_len = u32::from_le_bytes(head[9..13].try_into().unwrap()) as usize;

        let mut rest = vec![0u8; key_len + 4];
        self.file.read_exact(&mut rest)?;
        let val_len =
            u32::from_le_bytes(rest[key_len..key_len + 4].try_into().unwrap()) as usize;

        let mut tail = vec![0u8; val_len + 4];
        self.file.read_exact(&mut tail)?;

        // Reassemble the exact byte stream for CRC verification.
        let mut entry = Vec::with_capacity(13 + rest.len() + tail.len());
        entry.extend_from_slice(&head);
        entry.extend_from_slice(&rest);
        entry.extend_from_slice(&tail);

        let (record, consumed) = decode_entry(&entry)?;
        self.pos += consumed as u64;
        Ok(record)
    }
}

impl Iterator for SegmentIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.pos >= self.data_end {
                self.done = true;
                return None;
            }
            let record = match self.read_one() {
                Ok(r) => r,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            if let Some(start) = &self.skip_below {
                if record.key.as_slice() < start.as_slice() {
                    continue;
                }
                self.skip_below = None;
            }
            if let Some(end) = &self.stop_at {
                if record.key.as_slice() >= end.as_slice() {
                    self.done = true;
                    return None;
                }
            }
            return Some(Ok(record));
        }
    }
}
