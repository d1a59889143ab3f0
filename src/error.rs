//! Marten - Custom Error Types
//! Defines the error hierarchy for the LSM storage engine.
//!
//! Key absence is deliberately *not* an error: `get` on a missing key
//! returns `Ok(None)`. Only genuine failures (I/O, corruption, bad
//! configuration) travel through `MartenError`.

use thiserror::Error;

/// Custom Result type for the Marten engine.
pub type Result<T> = std::result::Result<T, MartenError>;

/// Error types for the Marten storage engine.
#[derive(Error, Debug)]
pub enum MartenError {
    /// I/O errors from file operations (WAL, segments, manifest).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors (manifest, filter blocks).
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (CRC mismatch, bad magic, torn block).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// WAL recovery failure during startup replay.
    #[error("WAL recovery failed: {0}")]
    RecoveryFailed(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted after the engine was closed.
    #[error("Engine is closed")]
    Closed,
}

impl From<bincode::Error> for MartenError {
    fn from(err: bincode::Error) -> Self {
        MartenError::Serialization(err.to_string())
    }
}
