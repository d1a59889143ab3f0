//! Marten - Embedded LSM-Tree Key-Value Storage Engine
//!
//! A crash-safe, ordered key-value store based on the Log-Structured
//! Merge-Tree (LSM-Tree) architecture.
//!
//! ## Features
//! - **Write-Ahead Log (WAL)**: Segmented, CRC32-checked, torn-tail tolerant
//! - **MemTable**: In-memory BTreeMap with per-key version chains
//! - **Sorted Segments**: Immutable on-disk runs with sparse index + bloom filter
//! - **Manifest**: Atomic version swaps, crash-safe segment lifecycle
//! - **Snapshots**: Refcounted point-in-time consistent reads
//! - **Compaction**: Size-tiered background merging with safe tombstone GC
//! - **Metrics**: Lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use marten::{Config, Marten};
//!
//! let engine = Marten::open(Config::new("./data")).unwrap();
//!
//! engine.set(b"key".to_vec(), b"value".to_vec()).unwrap();
//! assert_eq!(engine.get(b"key").unwrap(), Some(b"value".to_vec()));
//!
//! engine.delete(b"key".to_vec()).unwrap();
//! assert_eq!(engine.get(b"key").unwrap(), None);
//!
//! engine.close().unwrap();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use config::{Config, WalSyncMode};
pub use engine::snapshot::Snapshot;
pub use engine::Marten;
pub use error::{MartenError, Result};
pub use types::{Key, SeqNo, Value};
