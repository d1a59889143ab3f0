//! Marten - Engine Metrics & Observability
//! Lock-free atomic counters for runtime introspection. All counters
//! use `Ordering::Relaxed`: they are observability, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the Marten engine.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Total number of `set` operations.
    pub sets: AtomicU64,
    /// Total number of `get` operations.
    pub gets: AtomicU64,
    /// Total number of `delete` operations.
    pub deletes: AtomicU64,
    /// Total number of `scan` operations.
    pub scans: AtomicU64,
    /// Total number of open snapshots ever created.
    pub snapshots: AtomicU64,
    /// Memtable flush events.
    pub flushes: AtomicU64,
    /// Completed compactions.
    pub compactions: AtomicU64,
    /// Total bytes written (keys + values).
    pub bytes_written: AtomicU64,
    /// Total bytes read (values returned by get).
    pub bytes_read: AtomicU64,
    /// WAL records replayed at startup.
    pub wal_records_replayed: AtomicU64,
    /// When the engine was opened.
    engine_started: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            sets: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            snapshots: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            wal_records_replayed: AtomicU64::new(0),
            engine_started: Instant::now(),
        }
    }

    pub fn record_set(&self, key_size: usize, value_size: usize) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add((key_size + value_size) as u64, Ordering::Relaxed);
    }

    pub fn record_get(&self, value_size: Option<usize>) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(size) = value_size {
            self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self, records: u64) {
        self.wal_records_replayed
            .fetch_add(records, Ordering::Relaxed);
    }

    /// Engine uptime in seconds.
    pub fn uptime_secs(&self) -> f64 {
        self.engine_started.elapsed().as_secs_f64()
    }

    /// Total foreground operations.
    pub fn total_ops(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
            + self.gets.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
            + self.scans.load(Ordering::Relaxed)
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ Marten Engine Metrics ═══\n\
             Operations:\n\
               sets:        {}\n\
               gets:        {}\n\
               deletes:     {}\n\
               scans:       {}\n\
               snapshots:   {}\n\
             Background:\n\
               flushes:     {}\n\
               compactions: {}\n\
             I/O:\n\
               written:     {} bytes\n\
               read:        {} bytes\n\
             Recovery:\n\
               wal records replayed: {}\n\
             Uptime: {:.2}s",
            self.sets.load(Ordering::Relaxed),
            self.gets.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.scans.load(Ordering::Relaxed),
            self.snapshots.load(Ordering::Relaxed),
            self.flushes.load(Ordering::Relaxed),
            self.compactions.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
            self.wal_records_replayed.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
