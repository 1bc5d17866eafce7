//! tidemark - an embedded time-series storage engine.
//!
//! Samples are keyed by metric name, an optional set of string labels and a
//! timestamp. Inserts land in a write-ahead-logged in-memory partition; once a
//! partition's timestamp span is exhausted it is compressed with a
//! Gorilla-style codec and memory-mapped back in as an immutable disk
//! partition. Range queries fan out across every partition whose window
//! overlaps the request.

pub mod bitstream;
pub mod cgroup;
pub mod clock;
pub mod concurrency;
pub mod error;
pub mod gorilla;
pub mod label;
pub mod partition;
pub mod storage;
mod varint;
pub mod wal;

pub use clock::TimestampPrecision;
pub use error::{Result, TidemarkError};
pub use label::Label;
pub use storage::{Storage, StorageBuilder};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The smallest unit of time-series data: one sampled value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Unix timestamp in the storage's configured precision.
    pub timestamp: i64,
    /// The sampled value.
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.value)
    }
}

/// A data point together with the identity of the series it belongs to.
///
/// A row whose timestamp is zero is stamped with the current time, in the
/// storage's precision, when it is inserted.
#[derive(Debug, Clone)]
pub struct Row {
    /// Name of the metric. Required.
    pub metric: String,
    /// Optional labels refining the series identity.
    pub labels: Vec<Label>,
    /// The sample itself.
    pub data_point: DataPoint,
}

impl Row {
    pub fn new(metric: impl Into<String>, data_point: DataPoint) -> Self {
        Self {
            metric: metric.into(),
            labels: Vec::new(),
            data_point,
        }
    }

    pub fn with_labels(
        metric: impl Into<String>,
        labels: Vec<Label>,
        data_point: DataPoint,
    ) -> Self {
        Self {
            metric: metric.into(),
            labels,
            data_point,
        }
    }
}
