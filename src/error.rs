//! Error types for tidemark.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TidemarkError>;

/// The error type surfaced by every fallible tidemark operation.
#[derive(Error, Debug)]
pub enum TidemarkError {
    #[error("no data points for metric {metric:?} in range [{start}, {end})")]
    NoDataPoints {
        metric: String,
        start: i64,
        end: i64,
    },

    #[error("metric name is required")]
    MetricRequired,

    #[error("no rows given")]
    NoRows,

    #[error("invalid label: {0}")]
    InvalidLabel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid partition at {path:?}: metadata file is missing")]
    InvalidPartition { path: PathBuf },

    #[error("cannot insert rows into disk partition at {path:?}")]
    ReadOnlyPartition { path: PathBuf },

    #[error("partition with min timestamp {min_timestamp} not found in list")]
    PartitionNotFound { min_timestamp: i64 },

    #[error("write timed out after {timeout_ms}ms with all {workers} workers busy")]
    WriteTimeout { timeout_ms: u64, workers: usize },

    #[error("storage is shutting down")]
    StorageShuttingDown,

    #[error("storage already closed")]
    StorageClosed,

    #[error("WAL {operation} failed: {details}")]
    Wal { operation: String, details: String },

    #[error("sample timestamps must be non-decreasing for encoding")]
    UnorderedTimestamps,

    #[error("corrupted sample stream: {0}")]
    Corruption(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TidemarkError {
    /// Wraps an I/O failure from the write-ahead log.
    pub(crate) fn wal(operation: &str, err: impl std::fmt::Display) -> Self {
        TidemarkError::Wal {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}
