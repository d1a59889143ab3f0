//! Marten - Manifest / Version Set
//! The authoritative record of which sorted segments constitute the
//! live database state.
//!
//! A `Version` is an immutable, newest-first list of open segment
//! readers. Installing a new version is a single atomic swap of an
//! `Arc`, so concurrent readers keep iterating a stable set of
//! segments while flushes and compactions publish new ones. The state
//! is persisted to the `MANIFEST` file via temp-file-then-rename, so a
//! crash recovers the last installed version and WAL replay covers the
//! rest.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::engine::sstable::{segment_path, SegmentMeta, SegmentReader};
use crate::error::{MartenError, Result};
use crate::types::SeqNo;

/// Persisted manifest contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestState {
    /// Next segment id to hand out.
    next_segment_id: u64,
    /// Every mutation with `seq <= last_flushed_seq` is durable in a
    /// segment; WAL replay skips them.
    last_flushed_seq: SeqNo,
    /// Live segments, newest first (descending `max_seq`).
    segments: Vec<SegmentMeta>,
}

impl Default for ManifestState {
    fn default() -> Self {
        Self {
            next_segment_id: 1,
            last_flushed_seq: 0,
            segments: Vec::new(),
        }
    }
}

/// One consistent, immutable set of segments. Readers clone the
/// current `Arc<Version>` and keep it for as long as they need; the
/// segments it references cannot be deleted underneath them.
pub struct Version {
    segments: Vec<Arc<SegmentReader>>,
}

impl Version {
    pub fn empty() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Segments newest-first.
    pub fn segments(&self) -> &[Arc<SegmentReader>] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Metadata of every live segment, newest-first.
    pub fn metas(&self) -> Vec<SegmentMeta> {
        self.segments.iter().map(|s| s.meta().clone()).collect()
    }
}

/// Tracks and persists which segments are current.
pub struct Manifest {
    path: PathBuf,
    segment_dir: PathBuf,
    /// Guards state mutation and persistence; installs are serialized.
    state: Mutex<ManifestState>,
    /// The linearization point for readers: swapped atomically.
    current: RwLock<Arc<Version>>,
}

impl Manifest {
    /// Open the manifest, reopen readers for every listed segment, and
    /// delete stray files left behind by crashed flushes/compactions.
    pub fn open(manifest_path: &Path, segment_dir: &Path) -> Result<Self> {
        fs::create_dir_all(segment_dir)?;

        let mut state = if manifest_path.exists() {
            let bytes = fs::read(manifest_path)?;
            bincode::deserialize::<ManifestState>(&bytes).map_err(|err| {
                MartenError::Corruption(format!("manifest unreadable: {}", err))
            })?
        } else {
            ManifestState::default()
        };

        Self::remove_orphans(segment_dir, &state)?;

        let mut segments = Vec::with_capacity(state.segments.len());
        for meta in &state.segments {
            let reader = SegmentReader::open(&segment_path(segment_dir, meta.id))?;
            segments.push(Arc::new(reader));
        }
        segments.sort_by(|a, b| b.meta().max_seq.cmp(&a.meta().max_seq));

        let max_id = state.segments.iter().map(|m| m.id).max().unwrap_or(0);
        state.next_segment_id = state.next_segment_id.max(max_id + 1);

        log::info!(
            "manifest opened: {} segments, last_flushed_seq={}",
            segments.len(),
            state.last_flushed_seq
        );

        Ok(Self {
            path: manifest_path.to_path_buf(),
            segment_dir: segment_dir.to_path_buf(),
            state: Mutex::new(state),
            current: RwLock::new(Arc::new(Version { segments })),
        })
    }

    /// Delete segment files the manifest does not reference (crashed
    /// compaction outputs and temp files). They were never visible, so
    /// removing them is safe.
    fn remove_orphans(segment_dir: &Path, state: &ManifestState) -> Result<()> {
        let live: HashSet<u64> = state.segments.iter().map(|m| m.id).collect();
        for entry in fs::read_dir(segment_dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let orphan = if name.ends_with(".seg.tmp") {
                true
            } else if let Some(stem) = name.strip_suffix(".seg") {
                stem.parse::<u64>().map_or(true, |id| !live.contains(&id))
            } else {
                false
            };
            if orphan {
                log::warn!("removing orphaned segment file {:?}", path);
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// The current version. Cheap: one read-lock plus an Arc clone.
    pub fn current(&self) -> Arc<Version> {
        self.current.read().expect("version lock poisoned").clone()
    }

    /// Highest sequence number known durable in a segment.
    pub fn last_flushed_seq(&self) -> SeqNo {
        self.state.lock().expect("manifest lock poisoned").last_flushed_seq
    }

    /// Number of live segments.
    pub fn segment_count(&self) -> usize {
        self.current().len()
    }

    /// Hand out a fresh segment id. Ids are never reused within a
    /// manifest lifetime; an id allocated for a build that never gets
    /// installed just leaves a gap.
    pub fn allocate_segment_id(&self) -> u64 {
        let mut state = self.state.lock().expect("manifest lock poisoned");
        let id = state.next_segment_id;
        state.next_segment_id += 1;
        id
    }

    /// Atomically install a new version: add `new_segments`, drop the
    /// segments in `obsolete`, persist, then swap the current version.
    /// Dropped segments are marked obsolete and their files disappear
    /// once the last referencing version/snapshot releases them.
    ///
    /// `flushed_through`, when set, advances `last_flushed_seq` (flush
    /// installs pass it; compaction installs do not).
    pub fn install(
        &self,
        new_segments: Vec<Arc<SegmentReader>>,
        obsolete: &[u64],
        flushed_through: Option<SeqNo>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("manifest lock poisoned");

        let current = self.current();
        let mut removed = Vec::new();
        let mut segments: Vec<Arc<SegmentReader>> = Vec::with_capacity(
            current.len() + new_segments.len(),
        );
        for segment in current.segments() {
            if obsolete.contains(&segment.id()) {
                removed.push(segment.clone());
            } else {
                segments.push(segment.clone());
            }
        }
        segments.extend(new_segments);
        segments.sort_by(|a, b| b.meta().max_seq.cmp(&a.meta().max_seq));

        state.segments = segments.iter().map(|s| s.meta().clone()).collect();
        if let Some(seq) = flushed_through {
            state.last_flushed_seq = state.last_flushed_seq.max(seq);
        }

        // Persist before publishing: a crash here leaves the old
        // manifest and at worst an unreferenced new segment file.
        self.persist(&state)?;

        *self.current.write().expect("version lock poisoned") = Arc::new(Version { segments });
        for segment in removed {
            segment.mark_obsolete();
        }

        log::debug!(
            "installed version: {} segments, last_flushed_seq={}",
            state.segments.len(),
            state.last_flushed_seq
        );
        Ok(())
    }

    /// Write the manifest via temp file + atomic rename.
    fn persist(&self, state: &ManifestState) -> Result<()> {
        let bytes = bincode::serialize(state)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn segment_dir(&self) -> &Path {
        &self.segment_dir
    }
}
