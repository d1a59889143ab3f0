//! Marten - Engine Configuration
//! Defines tunable parameters for the LSM storage engine.

use std::path::PathBuf;

/// Controls when WAL appends are pushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncMode {
    /// fsync after every append. Slowest, strongest durability:
    /// a successful write survives process *and* OS crash.
    EveryWrite,
    /// Appends stay in the OS buffer; fsync happens on segment
    /// rotation and on `close()`. Survives process crash only.
    Periodic,
}

/// Configuration for the Marten storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all data files (WAL segments, sorted segments, manifest).
    pub data_dir: PathBuf,

    /// Maximum size of the memtable in bytes before it is frozen and
    /// handed to the background flush task.
    pub memtable_max_size: usize,

    /// Number of live sorted segments that triggers background compaction.
    pub compaction_trigger: usize,

    /// WAL durability mode.
    pub wal_sync: WalSyncMode,

    /// Maximum number of concurrently open snapshots.
    pub snapshot_retention: usize,

    /// When true, WAL replay truncates at the last valid record instead
    /// of failing on a mid-log CRC mismatch.
    pub repair_wal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memtable_max_size: 4 * 1024 * 1024, // 4 MB
            compaction_trigger: 4,
            wal_sync: WalSyncMode::EveryWrite,
            snapshot_retention: 64,
            repair_wal: false,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the maximum memtable size before freeze/flush.
    pub fn with_memtable_max_size(mut self, size: usize) -> Self {
        self.memtable_max_size = size;
        self
    }

    /// Set the segment count that triggers background compaction.
    pub fn with_compaction_trigger(mut self, segments: usize) -> Self {
        self.compaction_trigger = segments;
        self
    }

    /// Set the WAL sync mode.
    pub fn with_wal_sync(mut self, mode: WalSyncMode) -> Self {
        self.wal_sync = mode;
        self
    }

    /// Set the maximum number of concurrently open snapshots.
    pub fn with_snapshot_retention(mut self, max: usize) -> Self {
        self.snapshot_retention = max;
        self
    }

    /// Enable WAL repair mode during startup replay.
    pub fn with_repair_wal(mut self, repair: bool) -> Self {
        self.repair_wal = repair;
        self
    }

    /// Directory holding WAL segment files.
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    /// Directory holding immutable sorted segment files.
    pub fn segment_dir(&self) -> PathBuf {
        self.data_dir.join("segments")
    }

    /// Path of the manifest file.
    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("MANIFEST")
    }

    /// Ensure all on-disk directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.wal_dir())?;
        std::fs::create_dir_all(self.segment_dir())
    }

    /// Validate option combinations before opening the engine.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.memtable_max_size == 0 {
            return Err(crate::error::MartenError::Config(
                "memtable_max_size must be non-zero".into(),
            ));
        }
        if self.compaction_trigger < 2 {
            return Err(crate::error::MartenError::Config(
                "compaction_trigger must be at least 2".into(),
            ));
        }
        if self.snapshot_retention == 0 {
            return Err(crate::error::MartenError::Config(
                "snapshot_retention must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
