//! The immutable, memory-mapped on-disk partition.

use crate::gorilla::GorillaDecoder;
use crate::label::marshal_series_key;
use crate::partition::Partition;
use crate::{DataPoint, Label, Result, Row, TidemarkError};
use chrono::{DateTime, Utc};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Name of the raw encoded sample file inside a partition directory.
pub const DATA_FILE_NAME: &str = "data";

/// Name of the partition metadata file. Written last, so its presence marks
/// a complete partition.
pub const META_FILE_NAME: &str = "meta.json";

/// Contents of `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMeta {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub num_data_points: usize,
    pub created_at: DateTime<Utc>,
    pub metrics: HashMap<String, SeriesMeta>,
}

/// Location and bounds of one encoded series inside the data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesMeta {
    pub name: String,
    pub offset: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub num_data_points: usize,
}

/// Renders a binary series key as the string used in `meta.json`.
pub(crate) fn render_series_key(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// A partition whose samples live in an immutable memory-mapped file.
///
/// Field order matters for drop: the map is released before the file it
/// covers is closed.
#[derive(Debug)]
pub struct DiskPartition {
    dir: PathBuf,
    meta: PartitionMeta,
    mapped: Mmap,
    #[allow(dead_code)]
    data_file: File,
    retention: Duration,
}

impl DiskPartition {
    /// Opens a partition directory: checks `meta.json`, maps `data`
    /// read-only and parses the metadata.
    pub fn open(dir: impl AsRef<Path>, retention: Duration) -> Result<Self> {
        let dir = dir.as_ref();

        let meta_path = dir.join(META_FILE_NAME);
        if !meta_path.exists() {
            return Err(TidemarkError::InvalidPartition {
                path: dir.to_path_buf(),
            });
        }

        let data_path = dir.join(DATA_FILE_NAME);
        let data_file = File::open(&data_path)?;
        if data_file.metadata()?.len() == 0 {
            return Err(TidemarkError::NoDataPoints {
                metric: String::new(),
                start: 0,
                end: 0,
            });
        }
        // Safety: the file is written once by the flush path and never
        // modified afterwards; no live writer can change the mapping.
        let mapped = unsafe { Mmap::map(&data_file)? };

        let meta: PartitionMeta = serde_json::from_reader(File::open(&meta_path)?)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            mapped,
            data_file,
            retention,
        })
    }

    /// Materializes a new partition directory from encoded data and
    /// metadata, fsyncing both files, then opens it.
    pub fn create(
        dir: impl AsRef<Path>,
        meta: &PartitionMeta,
        data: &[u8],
        retention: Duration,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let data_path = dir.join(DATA_FILE_NAME);
        let mut data_file = File::create(&data_path)?;
        std::io::Write::write_all(&mut data_file, data)?;
        data_file.sync_all()?;

        let meta_path = dir.join(META_FILE_NAME);
        let meta_file = File::create(&meta_path)?;
        serde_json::to_writer_pretty(&meta_file, meta)?;
        meta_file.sync_all()?;

        Self::open(dir, retention)
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.meta.created_at
    }

    fn no_data(&self, metric: &str, start: i64, end: i64) -> TidemarkError {
        TidemarkError::NoDataPoints {
            metric: metric.to_string(),
            start,
            end,
        }
    }
}

impl Partition for DiskPartition {
    fn insert_rows(&self, _rows: &[Row]) -> Result<Vec<Row>> {
        Err(TidemarkError::ReadOnlyPartition {
            path: self.dir.clone(),
        })
    }

    fn select_data_points(
        &self,
        metric: &str,
        labels: &[Label],
        start: i64,
        end: i64,
    ) -> Result<Vec<DataPoint>> {
        if self.expired() {
            return Err(self.no_data(metric, start, end));
        }

        let key = render_series_key(&marshal_series_key(metric, labels));
        let Some(series) = self.meta.metrics.get(&key) else {
            return Err(self.no_data(metric, start, end));
        };

        if end <= series.min_timestamp || start > series.max_timestamp {
            return Ok(Vec::new());
        }

        let offset = series.offset as usize;
        if offset >= self.mapped.len() {
            return Err(TidemarkError::Corruption(format!(
                "series offset {offset} beyond data file of {} bytes",
                self.mapped.len()
            )));
        }

        // Delta encoding forces a sequential decode from the series start.
        let mut decoder = GorillaDecoder::new(&self.mapped[offset..]);
        let mut points = Vec::with_capacity(series.num_data_points.min(1024));
        for _ in 0..series.num_data_points {
            let point = decoder.decode_point()?;
            if point.timestamp < start {
                continue;
            }
            if point.timestamp >= end {
                break;
            }
            points.push(point);
        }

        Ok(points)
    }

    fn min_timestamp(&self) -> i64 {
        self.meta.min_timestamp
    }

    fn max_timestamp(&self) -> i64 {
        self.meta.max_timestamp
    }

    fn size(&self) -> usize {
        self.meta.num_data_points
    }

    fn active(&self) -> bool {
        false
    }

    fn expired(&self) -> bool {
        let created: SystemTime = self.meta.created_at.into();
        match created.elapsed() {
            Ok(age) => age > self.retention,
            Err(_) => false,
        }
    }

    fn clean(&self) -> Result<()> {
        // The list removes the partition before cleaning, so no reader can
        // still reach the mapping; the map itself is released on drop.
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}
