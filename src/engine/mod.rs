//! Marten - Storage Engine Module
//! Top-level module composing the LSM-tree components into the engine
//! facade: WAL, memtable, sorted segments, manifest, snapshots,
//! background flush/compaction.
//!
//! ## Write Path
//! `set`/`delete` take the single write mutex, assign a sequence
//! number, append to the WAL, and insert into the active memtable.
//! When the memtable exceeds its size threshold it is frozen (atomic
//! swap with a fresh one) and handed to the background worker, which
//! flushes it to a sorted segment and prunes the covered WAL segments.
//!
//! ## Read Path
//! `get` briefly read-locks the shared state to clone `Arc`s of the
//! live memtables and the current segment version, then reads without
//! blocking writers: active memtable, frozen memtables newest-first,
//! then segments newest-first. A tombstone anywhere stops the search.

pub mod bloom;
pub mod compaction;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod metrics;
pub mod snapshot;
pub mod sstable;
pub mod wal;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use crate::config::Config;
use crate::error::{MartenError, Result};
use crate::types::{Key, Record, SeqNo, Value};

use self::compaction::{CompactionStrategy, SizeTieredCompaction};
use self::manifest::{Manifest, Version};
use self::memtable::MemTable;
use self::merge::{MergeIterator, RecordStream};
use self::metrics::EngineMetrics;
use self::snapshot::{Snapshot, SnapshotRegistry};
use self::sstable::{segment_path, SegmentBuilder, SegmentReader};
use self::wal::WriteAheadLog;

/// Messages for the background worker.
enum Task {
    Flush,
    Shutdown,
}

/// A frozen memtable awaiting flush. WAL segments with id below
/// `wal_floor` contain only this memtable's records (and older,
/// already flushed ones), so they can be pruned once the flush is
/// durable.
struct FrozenMem {
    mem: Arc<RwLock<MemTable>>,
    wal_floor: u64,
}

/// Mutable memtable state: the active write buffer plus frozen
/// memtables not yet flushed, newest-first.
struct MemState {
    active: Arc<RwLock<MemTable>>,
    frozen: Vec<FrozenMem>,
}

/// State shared between the facade and the background worker.
struct Shared {
    config: Config,
    wal: Mutex<WriteAheadLog>,
    mem: RwLock<MemState>,
    manifest: Manifest,
    /// Next sequence number to assign.
    next_seq: AtomicU64,
    /// The mutation-serialization point: held for seq assignment, WAL
    /// append and memtable insert only (plus the whole read-modify-write
    /// for `atomic_update`).
    write_mutex: Mutex<()>,
    /// Serializes flush/compaction work between the background worker
    /// and foreground callers of `force_compact`/`close`.
    background: Mutex<()>,
    snapshots: Arc<SnapshotRegistry>,
    strategy: SizeTieredCompaction,
    metrics: EngineMetrics,
}

impl Shared {
    /// Clone the Arcs a reader needs: live memtables newest-first plus
    /// the current segment version. Cheap, and once cloned the reader
    /// proceeds without blocking writers.
    fn read_view(&self) -> (Vec<Arc<RwLock<MemTable>>>, Arc<Version>) {
        let mem = self.mem.read().expect("mem state lock poisoned");
        let mut tables = Vec::with_capacity(1 + mem.frozen.len());
        tables.push(mem.active.clone());
        tables.extend(mem.frozen.iter().map(|f| f.mem.clone()));
        drop(mem);
        (tables, self.manifest.current())
    }

    fn get_inner(&self, key: &[u8]) -> Result<Option<Value>> {
        let (tables, version) = self.read_view();
        for table in &tables {
            let guard = table.read().expect("memtable lock poisoned");
            if let Some((_, value)) = guard.get(key) {
                return Ok(value.cloned());
            }
        }
        for segment in version.segments() {
            if let Some((_, value)) = segment.get(key)? {
                // A tombstone here shadows everything older.
                return Ok(value);
            }
        }
        Ok(None)
    }

    /// Apply one mutation. Caller must hold `write_mutex`. Returns
    /// true if the active memtable was frozen.
    fn apply_locked(&self, key: Key, value: Option<Value>) -> Result<bool> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = Record { key, value, seq };

        // WAL first: if the append fails the mutation never becomes
        // visible in the memtable.
        self.wal
            .lock()
            .expect("wal lock poisoned")
            .append(&record)?;

        let mem = self.mem.read().expect("mem state lock poisoned");
        mem.active
            .write()
            .expect("memtable lock poisoned")
            .insert(record);
        let full = mem
            .active
            .read()
            .expect("memtable lock poisoned")
            .size()
            >= self.config.memtable_max_size;
        drop(mem);

        if full {
            self.freeze_active()?;
        }
        Ok(full)
    }

    /// Freeze the active memtable: rotate the WAL and swap in a fresh
    /// empty memtable. Caller must hold `write_mutex`. No-op when the
    /// active memtable is empty.
    fn freeze_active(&self) -> Result<bool> {
        let mut wal = self.wal.lock().expect("wal lock poisoned");
        let mut mem = self.mem.write().expect("mem state lock poisoned");
        if mem
            .active
            .read()
            .expect("memtable lock poisoned")
            .is_empty()
        {
            return Ok(false);
        }
        let wal_floor = wal.rotate()?;
        let old = std::mem::replace(&mut mem.active, Arc::new(RwLock::new(MemTable::new())));
        mem.frozen.insert(0, FrozenMem { mem: old, wal_floor });
        log::debug!("froze memtable (wal floor {})", wal_floor);
        Ok(true)
    }

    /// Flush the oldest frozen memtable to a sorted segment. Returns
    /// false when there is nothing to flush.
    fn flush_oldest_frozen(&self) -> Result<bool> {
        let _bg = self.background.lock().expect("background lock poisoned");

        let (mem_arc, wal_floor) = {
            let mem = self.mem.read().expect("mem state lock poisoned");
            match mem.frozen.last() {
                Some(frozen) => (frozen.mem.clone(), frozen.wal_floor),
                None => return Ok(false),
            }
        };

        let (records, max_seq) = {
            let guard = mem_arc.read().expect("memtable lock poisoned");
            (guard.newest_records(), guard.max_seq())
        };

        if !records.is_empty() {
            let id = self.manifest.allocate_segment_id();
            let segment_dir = self.config.segment_dir();
            let mut builder = SegmentBuilder::new(&segment_dir, id, records.len())?;
            for record in &records {
                if let Err(err) = builder.add(&record.key, record.seq, record.value.as_deref())
                {
                    builder.abandon()?;
                    return Err(err);
                }
            }
            builder.finish()?;
            let reader = Arc::new(SegmentReader::open(&segment_path(&segment_dir, id))?);
            self.manifest.install(vec![reader], &[], Some(max_seq))?;
            self.metrics.record_flush();
        }

        {
            let mut mem = self.mem.write().expect("mem state lock poisoned");
            if let Some(pos) = mem.frozen.iter().position(|f| Arc::ptr_eq(&f.mem, &mem_arc)) {
                mem.frozen.remove(pos);
            }
        }
        self.wal
            .lock()
            .expect("wal lock poisoned")
            .prune_below(wal_floor)?;
        Ok(true)
    }

    /// Run one round of compaction if the strategy (or `force`) says
    /// so. Tombstones are purged only below both the oldest pinned
    /// snapshot and the oldest sequence held by segments outside the
    /// merge inputs.
    fn maybe_compact(&self, force: bool) -> Result<bool> {
        let _bg = self.background.lock().expect("background lock poisoned");

        let version = self.manifest.current();
        let metas = version.metas();

        let selected = if force {
            if metas.len() < 2 {
                return Ok(false);
            }
            metas.iter().map(|m| m.id).collect::<Vec<_>>()
        } else {
            match self.strategy.select(&metas) {
                Some(ids) => ids,
                None => return Ok(false),
            }
        };

        let inputs: Vec<Arc<SegmentReader>> = version
            .segments()
            .iter()
            .filter(|s| selected.contains(&s.id()))
            .cloned()
            .collect();

        let outside_floor = metas
            .iter()
            .filter(|m| !selected.contains(&m.id))
            .map(|m| m.min_seq)
            .min()
            .unwrap_or(SeqNo::MAX);
        let snapshot_floor = self.snapshots.min_pinned().unwrap_or(SeqNo::MAX);
        let gc_before = outside_floor.min(snapshot_floor);

        log::info!(
            "{}: merging {} segments (gc watermark {})",
            self.strategy.name(),
            inputs.len(),
            gc_before
        );

        let segment_dir = self.config.segment_dir();
        let output_id = self.manifest.allocate_segment_id();
        let new_segments =
            match compaction::compact_segments(&segment_dir, output_id, &inputs, gc_before)? {
                Some(meta) => vec![Arc::new(SegmentReader::open(&segment_path(
                    &segment_dir,
                    meta.id,
                ))?)],
                None => Vec::new(),
            };

        self.manifest.install(new_segments, &selected, None)?;
        self.metrics.record_compaction();
        Ok(true)
    }
}

/// The Marten storage engine facade.
///
/// All methods take `&self`; wrap the engine in an `Arc` to share it
/// across threads. Reads never block writers and vice versa; flush and
/// compaction run on a background thread.
pub struct Marten {
    shared: Arc<Shared>,
    tasks: Sender<Task>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Marten {
    /// Open or create a Marten engine at the configured path.
    ///
    /// Startup: read the manifest, reopen live segments, replay WAL
    /// records newer than the last flushed sequence into a fresh
    /// memtable, then start the background worker.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let manifest = Manifest::open(&config.manifest_path(), &config.segment_dir())?;
        let last_flushed = manifest.last_flushed_seq();

        let replayed =
            WriteAheadLog::replay(&config.wal_dir(), last_flushed, config.repair_wal)?;
        let metrics = EngineMetrics::new();
        metrics.record_replay(replayed.len() as u64);

        let mut active = MemTable::new();
        let mut max_seq = last_flushed;
        for meta in manifest.current().metas() {
            max_seq = max_seq.max(meta.max_seq);
        }
        for record in replayed {
            max_seq = max_seq.max(record.seq);
            active.insert(record);
        }

        let wal = WriteAheadLog::open(config.wal_dir(), config.wal_sync)?;

        log::info!(
            "Marten engine opened at {:?} ({} segments, {} WAL records replayed)",
            config.data_dir,
            manifest.segment_count(),
            active.len()
        );

        let strategy = SizeTieredCompaction::new(
            config.compaction_trigger,
            2 * config.compaction_trigger,
            512 * 1024 * 1024,
        );
        let snapshots = Arc::new(SnapshotRegistry::new(config.snapshot_retention));

        let shared = Arc::new(Shared {
            config,
            wal: Mutex::new(wal),
            mem: RwLock::new(MemState {
                active: Arc::new(RwLock::new(active)),
                frozen: Vec::new(),
            }),
            manifest,
            next_seq: AtomicU64::new(max_seq + 1),
            write_mutex: Mutex::new(()),
            background: Mutex::new(()),
            snapshots,
            strategy,
            metrics,
        });

        let (tx, rx) = unbounded::<Task>();
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("marten-bg".into())
            .spawn(move || {
                for task in rx {
                    match task {
                        Task::Shutdown => break,
                        Task::Flush => {
                            loop {
                                match worker_shared.flush_oldest_frozen() {
                                    Ok(true) => continue,
                                    Ok(false) => break,
                                    Err(err) => {
                                        log::error!("background flush failed: {}", err);
                                        break;
                                    }
                                }
                            }
                            if let Err(err) = worker_shared.maybe_compact(false) {
                                log::warn!("compaction failed, will retry: {}", err);
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            shared,
            tasks: tx,
            worker: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MartenError::Closed);
        }
        Ok(())
    }

    /// Store a key-value pair. Durable once this returns (subject to
    /// the configured WAL sync mode).
    pub fn set(&self, key: Key, value: Value) -> Result<()> {
        self.ensure_open()?;
        self.shared.metrics.record_set(key.len(), value.len());
        let froze = {
            let _guard = self.shared.write_mutex.lock().expect("write mutex poisoned");
            self.shared.apply_locked(key, Some(value))?
        };
        if froze {
            let _ = self.tasks.send(Task::Flush);
        }
        Ok(())
    }

    /// Delete a key by writing a tombstone. Deleting an absent key is
    /// not an error.
    pub fn delete(&self, key: Key) -> Result<()> {
        self.ensure_open()?;
        self.shared.metrics.record_delete();
        let froze = {
            let _guard = self.shared.write_mutex.lock().expect("write mutex poisoned");
            self.shared.apply_locked(key, None)?
        };
        if froze {
            let _ = self.tasks.send(Task::Flush);
        }
        Ok(())
    }

    /// Look up a key. `Ok(None)` means the key is absent or deleted;
    /// it is a normal outcome, not an error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let value = self.shared.get_inner(key)?;
        self.shared
            .metrics
            .record_get(value.as_ref().map(|v| v.len()));
        Ok(value)
    }

    /// Single-key atomic read-modify-write. The mutation function sees
    /// the current value (or `None`) and returns the new value, where
    /// `None` deletes the key. No other write to any key interleaves
    /// between the read and the write.
    pub fn atomic_update<F>(&self, key: &[u8], mutate: F) -> Result<Option<Value>>
    where
        F: FnOnce(Option<Value>) -> Option<Value>,
    {
        self.ensure_open()?;
        let (next, froze) = {
            let _guard = self.shared.write_mutex.lock().expect("write mutex poisoned");
            let current = self.shared.get_inner(key)?;
            let next = mutate(current);
            match &next {
                Some(value) => self.shared.metrics.record_set(key.len(), value.len()),
                None => self.shared.metrics.record_delete(),
            }
            let froze = self.shared.apply_locked(key.to_vec(), next.clone())?;
            (next, froze)
        };
        if froze {
            let _ = self.tasks.send(Task::Flush);
        }
        Ok(next)
    }

    /// Open a consistent point-in-time view. Later writes, flushes and
    /// compactions are invisible through it. Fails when the configured
    /// snapshot retention cap is reached.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let shared = &self.shared;
        let _guard = shared.write_mutex.lock().expect("write mutex poisoned");
        let seq = shared.next_seq.load(Ordering::SeqCst).saturating_sub(1);
        shared.snapshots.register(seq)?;
        let (tables, version) = shared.read_view();
        shared.metrics.record_snapshot();
        Ok(Snapshot::new(seq, tables, version, shared.snapshots.clone()))
    }

    /// All live key-value pairs in sorted key order (tombstoned keys
    /// excluded).
    pub fn scan(&self) -> Result<Vec<(Key, Value)>> {
        self.shared.metrics.record_scan();
        let (tables, version) = self.shared.read_view();

        let mut streams: Vec<RecordStream<'static>> = Vec::new();
        for table in &tables {
            let records = table
                .read()
                .expect("memtable lock poisoned")
                .newest_records();
            streams.push(Box::new(records.into_iter().map(Ok)));
        }
        for segment in version.segments() {
            streams.push(Box::new(segment.iter()?));
        }

        let mut out = Vec::new();
        for item in MergeIterator::new(streams)? {
            let record = item?;
            if let Some(value) = record.value {
                out.push((record.key, value));
            }
        }
        Ok(out)
    }

    /// Freeze the active memtable and flush everything buffered to
    /// sorted segments, synchronously.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        {
            let _guard = self.shared.write_mutex.lock().expect("write mutex poisoned");
            self.shared.freeze_active()?;
        }
        while self.shared.flush_oldest_frozen()? {}
        Ok(())
    }

    /// Flush everything buffered and merge all live segments into one.
    pub fn force_compact(&self) -> Result<()> {
        self.flush()?;
        self.shared.maybe_compact(true)?;
        Ok(())
    }

    /// Approximate size of the active memtable in bytes.
    pub fn memtable_size(&self) -> usize {
        let mem = self.shared.mem.read().expect("mem state lock poisoned");
        let active = mem.active.read().expect("memtable lock poisoned");
        active.size()
    }

    /// Number of live sorted segments.
    pub fn segment_count(&self) -> usize {
        self.shared.manifest.segment_count()
    }

    /// Engine metrics.
    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }

    /// Shut down: stop the background worker, flush the active
    /// memtable and fsync the WAL. Every previously successful
    /// `set`/`delete` is durable in a segment when this returns.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.tasks.send(Task::Shutdown);
        if let Some(handle) = self
            .worker
            .lock()
            .expect("worker handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }

        {
            let _guard = self.shared.write_mutex.lock().expect("write mutex poisoned");
            self.shared.freeze_active()?;
        }
        while self.shared.flush_oldest_frozen()? {}
        self.shared.wal.lock().expect("wal lock poisoned").sync()?;
        log::info!("Marten engine closed");
        Ok(())
    }
}

impl Drop for Marten {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("error while closing engine on drop: {}", err);
        }
    }
}
