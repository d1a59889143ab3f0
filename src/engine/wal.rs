//! Marten - Write-Ahead Log (WAL)
//! Provides durability by logging every mutation to disk before it is
//! applied to the in-memory memtable.
//!
//! The log is segmented: a new segment file is started whenever the
//! memtable is frozen, and old segments are deleted only once the
//! corresponding memtable flush is durable. Recovery can therefore
//! always reconstruct unflushed state.
//!
//! ## Binary Format (per record)
//! ```text
//! [seq: 8 bytes (LE)][op: 1 byte][key_len: 4 bytes (LE)][key: N bytes]
//! [val_len: 4 bytes (LE)][value: M bytes][crc32: 4 bytes (LE)]
//! ```
//! The CRC covers every preceding byte of the record.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};

use crate::config::WalSyncMode;
use crate::error::{MartenError, Result};
use crate::types::{Record, SeqNo};

const OP_SET: u8 = 1;
const OP_DELETE: u8 = 2;

/// Fixed overhead of a record: seq + op + key_len + val_len + crc.
const RECORD_OVERHEAD: usize = 8 + 1 + 4 + 4 + 4;

/// Outcome of decoding a single record from a byte buffer.
enum Decoded {
    Ok(Record, usize),
    /// Buffer ended mid-record (torn tail after a crash).
    Truncated,
    /// CRC mismatch or invalid op byte.
    Corrupt(String),
}

/// Segmented write-ahead log.
pub struct WriteAheadLog {
    dir: PathBuf,
    file: File,
    active_id: u64,
    sync_mode: WalSyncMode,
}

impl WriteAheadLog {
    /// Open the WAL in `dir`, starting a fresh segment after any
    /// existing ones. Existing segments are left untouched for the
    /// caller to replay and later prune.
    pub fn open(dir: impl Into<PathBuf>, sync_mode: WalSyncMode) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let active_id = Self::list_segment_ids(&dir)?
            .last()
            .map(|id| id + 1)
            .unwrap_or(1);
        let file = Self::open_segment(&dir, active_id)?;

        Ok(Self {
            dir,
            file,
            active_id,
            sync_mode,
        })
    }

    /// Identifier of the segment currently being appended to.
    pub fn active_id(&self) -> u64 {
        self.active_id
    }

    /// Append one record. With `WalSyncMode::EveryWrite` the record is
    /// fsynced before this returns; once `append` succeeds the record
    /// survives a process crash.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let encoded = Self::encode(record);
        self.file.write_all(&encoded)?;
        if self.sync_mode == WalSyncMode::EveryWrite {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Force everything appended so far to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Seal the active segment and start a new one. Returns the id of
    /// the new active segment; every record appended before this call
    /// lives in a segment with a smaller id.
    pub fn rotate(&mut self) -> Result<u64> {
        self.file.sync_all()?;
        self.active_id += 1;
        self.file = Self::open_segment(&self.dir, self.active_id)?;
        Ok(self.active_id)
    }

    /// Delete every sealed segment with id below `floor`. Called after
    /// the memtable covering those segments has been durably flushed.
    pub fn prune_below(&mut self, floor: u64) -> Result<()> {
        for id in Self::list_segment_ids(&self.dir)? {
            if id < floor && id != self.active_id {
                let path = Self::segment_path(&self.dir, id);
                fs::remove_file(&path)?;
                log::debug!("pruned WAL segment {:?}", path);
            }
        }
        Ok(())
    }

    /// Replay all segments in `dir` in order, returning records with
    /// `seq > last_flushed`.
    ///
    /// A torn record at the very tail of the newest segment is the
    /// normal signature of a crash mid-append and is skipped with a
    /// warning. Corruption anywhere else aborts recovery unless
    /// `repair` is set, in which case the log is truncated at the last
    /// valid record and replay stops there.
    pub fn replay(dir: &Path, last_flushed: SeqNo, repair: bool) -> Result<Vec<Record>> {
        let ids = match Self::list_segment_ids(dir) {
            Ok(ids) => ids,
            Err(_) => return Ok(Vec::new()), // no WAL directory yet
        };

        let mut records = Vec::new();
        let last_idx = ids.len().saturating_sub(1);

        for (idx, id) in ids.iter().enumerate() {
            let path = Self::segment_path(dir, *id);
            let buf = fs::read(&path)?;
            let mut offset = 0usize;

            while offset < buf.len() {
                match Self::decode(&buf[offset..]) {
                    Decoded::Ok(record, consumed) => {
                        offset += consumed;
                        if record.seq > last_flushed {
                            records.push(record);
                        }
                    }
                    Decoded::Truncated => {
                        if idx == last_idx {
                            log::warn!(
                                "torn record at tail of WAL segment {:?} (offset {}), dropping",
                                path,
                                offset
                            );
                            break;
                        }
                        Self::repair_or_fail(
                            &path,
                            offset,
                            repair,
                            "truncated record in sealed WAL segment",
                        )?;
                        Self::remove_segments(dir, &ids[idx + 1..])?;
                        return Ok(records);
                    }
                    Decoded::Corrupt(why) => {
                        Self::repair_or_fail(&path, offset, repair, &why)?;
                        Self::remove_segments(dir, &ids[idx + 1..])?;
                        return Ok(records);
                    }
                }
            }
        }

        Ok(records)
    }

    /// Either abort recovery or truncate the damaged segment at the
    /// last valid record so replay can stop there.
    fn repair_or_fail(path: &Path, valid_len: usize, repair: bool, why: &str) -> Result<()> {
        if !repair {
            return Err(MartenError::RecoveryFailed(format!(
                "{} in {:?} at offset {}",
                why, path, valid_len
            )));
        }
        log::warn!(
            "repair: truncating WAL segment {:?} at offset {} ({})",
            path,
            valid_len,
            why
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len as u64)?;
        file.sync_all()?;
        Ok(())
    }

    /// Delete segments written after a repaired truncation point;
    /// replaying them would leave a gap in the mutation order.
    fn remove_segments(dir: &Path, ids: &[u64]) -> Result<()> {
        for id in ids {
            let path = Self::segment_path(dir, *id);
            log::warn!("repair: dropping WAL segment {:?} past the damage", path);
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn encode(record: &Record) -> BytesMut {
        let key = &record.key;
        let value = record.value.as_deref().unwrap_or(&[]);

        let mut buf = BytesMut::with_capacity(RECORD_OVERHEAD + key.len() + value.len());
        buf.put_u64_le(record.seq);
        buf.put_u8(if record.is_tombstone() {
            OP_DELETE
        } else {
            OP_SET
        });
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);

        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    fn decode(buf: &[u8]) -> Decoded {
        if buf.len() < RECORD_OVERHEAD {
            return Decoded::Truncated;
        }

        let seq = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let op = buf[8];
        let key_len = u32::from_le_bytes(buf[9..13].try_into().unwrap()) as usize;

        let mut pos = 13;
        if buf.len() < pos + key_len + 4 {
            return Decoded::Truncated;
        }
        let key = buf[pos..pos + key_len].to_vec();
        pos += key_len;

        let val_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if buf.len() < pos + val_len + 4 {
            return Decoded::Truncated;
        }
        let value = buf[pos..pos + val_len].to_vec();
        pos += val_len;

        let stored_crc = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        let actual_crc = crc32fast::hash(&buf[..pos]);
        pos += 4;

        if stored_crc != actual_crc {
            return Decoded::Corrupt(format!(
                "WAL record CRC mismatch (stored {:#x}, actual {:#x})",
                stored_crc, actual_crc
            ));
        }

        let record = match op {
            OP_SET => Record::set(key, value, seq),
            OP_DELETE => Record::tombstone(key, seq),
            other => return Decoded::Corrupt(format!("invalid WAL op byte {:#x}", other)),
        };
        Decoded::Ok(record, pos)
    }

    fn segment_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{:020}.wal", id))
    }

    /// All segment ids present on disk, ascending.
    fn list_segment_ids(dir: &Path) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = stem.parse::<u64>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn open_segment(dir: &Path, id: u64) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::segment_path(dir, id))?;
        Ok(file)
    }
}
