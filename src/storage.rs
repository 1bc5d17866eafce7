//! The storage façade: insert routing, query fan-out, background flush and
//! retention, and lifecycle management.

use crate::cgroup;
use crate::clock::TimestampPrecision;
use crate::concurrency::Semaphore;
use crate::partition::disk::DiskPartition;
use crate::partition::list::PartitionList;
use crate::partition::memory::MemoryPartition;
use crate::partition::SharedPartition;
use crate::wal::{DiskWal, NopWal, Wal, WalReader};
use crate::{DataPoint, Label, Result, Row, TidemarkError};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

// The head plus the partition right behind it accept writes, so slightly
// late rows can still land in their original window.
const WRITABLE_PARTITIONS: usize = 2;

const PARTITION_DIR_PREFIX: &str = "p-";
const WAL_DIR_NAME: &str = "wal";

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Configures and opens a [`Storage`].
///
/// Without a data path the storage runs memory-only: nothing is persisted
/// and partitions are reclaimed once they outlive the retention window.
pub struct StorageBuilder {
    data_path: Option<PathBuf>,
    partition_duration: Duration,
    retention: Duration,
    timestamp_precision: TimestampPrecision,
    write_timeout: Duration,
    wal_buffered_size: isize,
}

impl Default for StorageBuilder {
    fn default() -> Self {
        Self {
            data_path: None,
            partition_duration: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(14 * 24 * 60 * 60),
            timestamp_precision: TimestampPrecision::Nanoseconds,
            write_timeout: Duration::from_secs(30),
            wal_buffered_size: 4096,
        }
    }
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists partitions under this directory.
    pub fn with_data_path(mut self, path: impl AsRef<Path>) -> Self {
        self.data_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Timestamp span after which the head partition rotates.
    pub fn with_partition_duration(mut self, duration: Duration) -> Self {
        self.partition_duration = duration;
        self
    }

    /// Partitions older than this are removed by the background loop.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Unit for all timestamps on this instance.
    pub fn with_timestamp_precision(mut self, precision: TimestampPrecision) -> Self {
        self.timestamp_precision = precision;
        self
    }

    /// Longest an insert waits for a worker slot before timing out.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// WAL buffering: positive sizes buffer, zero writes through on every
    /// append, negative disables the WAL entirely.
    pub fn with_wal_buffered_size(mut self, size: isize) -> Self {
        self.wal_buffered_size = size;
        self
    }

    pub fn build(self) -> Result<Storage> {
        if self
            .timestamp_precision
            .units_in(self.partition_duration)
            <= 0
        {
            return Err(TidemarkError::InvalidConfig(
                "partition duration is zero in the configured precision".to_string(),
            ));
        }
        if self.retention.is_zero() {
            return Err(TidemarkError::InvalidConfig(
                "retention must be positive".to_string(),
            ));
        }

        if let Some(dir) = &self.data_path {
            fs::create_dir_all(dir)?;
        }

        let use_disk_wal = self.data_path.is_some() && self.wal_buffered_size >= 0;
        let wal: Arc<dyn Wal> = match (&self.data_path, use_disk_wal) {
            (Some(dir), true) => Arc::new(DiskWal::new(
                dir.join(WAL_DIR_NAME),
                self.wal_buffered_size as usize,
            )?),
            _ => Arc::new(NopWal),
        };

        let inner = Arc::new(StorageInner {
            partitions: PartitionList::new(),
            data_path: self.data_path,
            partition_duration: self.partition_duration,
            retention: self.retention,
            precision: self.timestamp_precision,
            write_timeout: self.write_timeout,
            wal,
            workers: Semaphore::new(cgroup::default_workers_limit()),
            state: AtomicU8::new(STATE_OPEN),
            rotation: Mutex::new(()),
            flush_worker: Mutex::new(None),
            retention_worker: Mutex::new(None),
            retention_stop: Mutex::new(None),
        });

        if let Some(dir) = inner.data_path.clone() {
            inner.load_disk_partitions(&dir)?;
        }

        // Rows an earlier process journaled but never flushed. Read before
        // the fresh head opens its own segment.
        let recovered = match (&inner.data_path, use_disk_wal) {
            (Some(dir), true) => WalReader::new(dir.join(WAL_DIR_NAME)).read_all()?,
            _ => Vec::new(),
        };

        let head = inner.rotate_head()?;

        if !recovered.is_empty() {
            info!(rows = recovered.len(), "recovering rows from WAL");
            // One batch, so the head's minimum is the recovered minimum and
            // no recovered row is dropped as outdated.
            match head.insert_rows_recovery(&recovered) {
                Ok(dropped) if !dropped.is_empty() => warn!(
                    count = dropped.len(),
                    "dropped recovered rows older than the recovered window"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "WAL replay failed"),
            }
        }

        let storage = Storage { inner };
        storage.start_retention_worker();
        Ok(storage)
    }
}

/// Thread-safe handle to an open time-series storage.
///
/// Cloning is cheap and every clone refers to the same storage.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    partitions: PartitionList,
    data_path: Option<PathBuf>,
    partition_duration: Duration,
    retention: Duration,
    precision: TimestampPrecision,
    write_timeout: Duration,
    wal: Arc<dyn Wal>,
    workers: Semaphore,
    state: AtomicU8,
    // Serializes head rotation so concurrent inserts create one new head.
    rotation: Mutex<()>,
    flush_worker: Mutex<Option<JoinHandle<()>>>,
    retention_worker: Mutex<Option<JoinHandle<()>>>,
    retention_stop: Mutex<Option<Sender<()>>>,
}

impl Storage {
    /// Inserts a batch of rows.
    ///
    /// The batch lands in the head partition; rows older than the head's
    /// window cascade to the next writable partition, and rows older than
    /// every writable partition are dropped with a warning. Blocks up to the
    /// configured write timeout for a worker slot.
    pub fn insert_rows(&self, rows: &[Row]) -> Result<()> {
        self.inner.ensure_open()?;
        StorageInner::validate_rows(rows)?;

        let _permit = match self.inner.workers.try_acquire_for(self.inner.write_timeout) {
            Ok(permit) => permit,
            Err(timeout @ TidemarkError::WriteTimeout { .. }) => {
                return Err(match self.inner.state.load(Ordering::SeqCst) {
                    STATE_CLOSING => TidemarkError::StorageShuttingDown,
                    STATE_CLOSED => TidemarkError::StorageClosed,
                    _ => timeout,
                });
            }
            Err(e) => return Err(e),
        };
        self.inner.ensure_open()?;

        let rotated = self.inner.insert_rows_internal(rows)?;
        if rotated {
            self.schedule_flush();
        }
        Ok(())
    }

    /// Returns every stored point of the series with `start <= ts < end`,
    /// ordered oldest to newest. An inverted range yields an empty result;
    /// a series with nothing in the range is `NoDataPoints`.
    pub fn select(
        &self,
        metric: &str,
        labels: &[Label],
        start: i64,
        end: i64,
    ) -> Result<Vec<DataPoint>> {
        self.inner.ensure_open()?;
        if metric.is_empty() {
            return Err(TidemarkError::MetricRequired);
        }
        StorageInner::validate_labels(labels)?;

        self.inner.select_internal(metric, labels, start, end)
    }

    /// Flushes what can be flushed, stops background work and closes the
    /// storage. Returns the first error observed; on failure the storage
    /// stays open so the close can be retried.
    pub fn close(&self) -> Result<()> {
        if self
            .inner
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(match self.inner.state.load(Ordering::SeqCst) {
                STATE_CLOSING => TidemarkError::StorageShuttingDown,
                _ => TidemarkError::StorageClosed,
            });
        }

        self.stop_retention_worker();

        match self.close_impl() {
            Ok(()) => {
                self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.inner.state.store(STATE_OPEN, Ordering::SeqCst);
                self.start_retention_worker();
                Err(e)
            }
        }
    }

    fn close_impl(&self) -> Result<()> {
        // Drain in-flight writers before touching partition state.
        let _writers = self.inner.workers.acquire_all(self.inner.write_timeout)?;

        if let Some(handle) = self.inner.flush_worker.lock().take() {
            let _ = handle.join();
        }

        self.inner.wal.flush()?;

        if self.inner.data_path.is_none() {
            return Ok(());
        }

        // Rotate fresh heads in so every data-bearing partition falls out of
        // the writable window and gets flushed.
        {
            let _guard = self.inner.rotation.lock();
            for _ in 0..WRITABLE_PARTITIONS {
                self.inner.rotate_head()?;
            }
        }
        self.inner.flush_partitions(WRITABLE_PARTITIONS)?;
        self.inner.remove_expired_partitions();
        self.inner.wal.remove_all()?;
        Ok(())
    }

    fn schedule_flush(&self) {
        if self.inner.data_path.is_none() {
            return;
        }

        let mut slot = self.inner.flush_worker.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        if let Some(handle) = slot.take() {
            let _ = handle.join();
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("tidemark-flush".to_string())
            .spawn(move || {
                if let Err(e) = inner.flush_partitions(WRITABLE_PARTITIONS) {
                    error!(error = %e, "background flush failed; will retry on the next rotation");
                }
            });
        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(e) => error!(error = %e, "failed to spawn flush worker"),
        }
    }

    fn start_retention_worker(&self) {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = retention_tick(self.inner.retention);
        // The worker holds only a weak reference: dropping the last Storage
        // handle without close() still lets the storage deallocate.
        let weak = Arc::downgrade(&self.inner);

        let spawned = thread::Builder::new()
            .name("tidemark-retention".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if inner.state.load(Ordering::SeqCst) != STATE_OPEN {
                            break;
                        }
                        inner.remove_expired_partitions();
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                *self.inner.retention_worker.lock() = Some(handle);
                *self.inner.retention_stop.lock() = Some(stop_tx);
            }
            Err(e) => error!(error = %e, "failed to spawn retention worker"),
        }
    }

    fn stop_retention_worker(&self) {
        if let Some(stop) = self.inner.retention_stop.lock().take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.inner.retention_worker.lock().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    fn partition_count(&self) -> usize {
        self.inner.partitions.len()
    }
}

impl StorageInner {
    fn ensure_open(&self) -> Result<()> {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => Ok(()),
            STATE_CLOSING => Err(TidemarkError::StorageShuttingDown),
            _ => Err(TidemarkError::StorageClosed),
        }
    }

    fn validate_rows(rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Err(TidemarkError::NoRows);
        }
        for row in rows {
            if row.metric.is_empty() {
                return Err(TidemarkError::MetricRequired);
            }
            Self::validate_labels(&row.labels)?;
        }
        Ok(())
    }

    fn validate_labels(labels: &[Label]) -> Result<()> {
        for label in labels {
            if !label.is_valid() {
                return Err(TidemarkError::InvalidLabel(format!(
                    "label {:?}={:?} has an empty name or value",
                    label.name, label.value
                )));
            }
        }
        Ok(())
    }

    fn load_disk_partitions(&self, dir: &Path) -> Result<()> {
        let mut loaded: Vec<Arc<DiskPartition>> = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let is_partition = path
                .file_name()
                .map(|name| name.to_string_lossy().starts_with(PARTITION_DIR_PREFIX))
                .unwrap_or(false);
            if !is_partition {
                continue;
            }

            match DiskPartition::open(&path, self.retention) {
                Ok(partition) => loaded.push(Arc::new(partition)),
                Err(TidemarkError::InvalidPartition { .. }) => {
                    warn!(dir = %path.display(), "skipping partition without metadata");
                }
                Err(TidemarkError::NoDataPoints { .. }) => {
                    warn!(dir = %path.display(), "skipping empty partition");
                }
                Err(e) => return Err(e),
            }
        }

        // Oldest first, so the head ends up the newest partition.
        loaded.sort_by_key(|p| p.created_at());
        for partition in loaded {
            self.partitions.insert(partition as SharedPartition);
        }
        Ok(())
    }

    /// Puts a fresh memory partition at the head, rotating the WAL first so
    /// a rotation failure leaves the list untouched.
    fn rotate_head(&self) -> Result<Arc<MemoryPartition>> {
        let head = Arc::new(MemoryPartition::new(
            self.wal.clone(),
            self.partition_duration,
            self.precision,
            self.retention,
        ));
        self.wal.punctuate()?;
        self.partitions.insert(head.clone());
        Ok(head)
    }

    /// Rotates the head if it is missing or its window is exhausted.
    /// Returns whether a rotation happened.
    fn ensure_writable_head(&self) -> Result<bool> {
        let head_full = |list: &PartitionList| match list.head() {
            None => true,
            Some(head) => !head.active(),
        };

        if !head_full(&self.partitions) {
            return Ok(false);
        }

        let _guard = self.rotation.lock();
        if head_full(&self.partitions) {
            self.rotate_head()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn insert_rows_internal(&self, rows: &[Row]) -> Result<bool> {
        let rotated = self.ensure_writable_head()?;

        let mut remaining = rows.to_vec();
        let mut attempts = 0usize;
        for partition in self.partitions.iter() {
            if remaining.is_empty() || attempts >= WRITABLE_PARTITIONS {
                break;
            }
            if partition.expired() {
                continue;
            }
            attempts += 1;

            match partition.insert_rows(&remaining) {
                Ok(outdated) => remaining = outdated,
                // Reached the disk partitions: nothing older is writable.
                Err(TidemarkError::ReadOnlyPartition { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        if !remaining.is_empty() {
            let oldest = remaining
                .iter()
                .map(|row| row.data_point.timestamp)
                .min()
                .unwrap_or(0);
            warn!(
                count = remaining.len(),
                oldest, "dropping rows older than every writable partition"
            );
        }
        Ok(rotated)
    }

    fn select_internal(
        &self,
        metric: &str,
        labels: &[Label],
        start: i64,
        end: i64,
    ) -> Result<Vec<DataPoint>> {
        if start >= end {
            return Ok(Vec::new());
        }

        let mut newest_first: Vec<Vec<DataPoint>> = Vec::new();
        for partition in self.partitions.iter() {
            if partition.size() == 0 || partition.expired() {
                continue;
            }
            if end <= partition.min_timestamp() || start > partition.max_timestamp() {
                continue;
            }

            match partition.select_data_points(metric, labels, start, end) {
                Ok(points) => {
                    if !points.is_empty() {
                        newest_first.push(points);
                    }
                }
                Err(TidemarkError::NoDataPoints { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        if newest_first.is_empty() {
            return Err(TidemarkError::NoDataPoints {
                metric: metric.to_string(),
                start,
                end,
            });
        }

        let total = newest_first.iter().map(Vec::len).sum();
        let mut points = Vec::with_capacity(total);
        for chunk in newest_first.into_iter().rev() {
            points.extend(chunk);
        }
        Ok(points)
    }

    /// Flushes every data-bearing partition beyond the newest `skip_newest`
    /// to disk, swapping each for its disk partition and retiring one WAL
    /// segment per success. Keeps going past failures and reports the first.
    fn flush_partitions(&self, skip_newest: usize) -> Result<()> {
        let Some(data_path) = self.data_path.clone() else {
            return Ok(());
        };

        let candidates: Vec<SharedPartition> = self
            .partitions
            .iter()
            .skip(skip_newest)
            .filter(|p| p.size() > 0)
            .collect();

        let mut first_error = None;
        // Oldest first, so retiring the oldest WAL segment after each swap
        // matches the partition that was just persisted.
        for partition in candidates.into_iter().rev() {
            if !partition.begin_flush() {
                // Already immutable (a disk partition) or being flushed.
                continue;
            }

            match self.persist_partition(&partition, &data_path) {
                Ok(Some(disk)) => match self.partitions.swap(&partition, disk.clone()) {
                    Ok(()) => {
                        if let Err(e) = self.wal.remove_oldest() {
                            warn!(error = %e, "failed to retire flushed WAL segment");
                        }
                    }
                    Err(e) => {
                        // Retention beat us to this partition; drop the
                        // orphaned directory we just wrote.
                        partition.end_flush();
                        let _ = disk.clean();
                        warn!(error = %e, "partition vanished during flush");
                    }
                },
                Ok(None) => partition.end_flush(),
                Err(e) => {
                    partition.end_flush();
                    error!(error = %e, "failed to persist partition");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn persist_partition(
        &self,
        partition: &SharedPartition,
        data_path: &Path,
    ) -> Result<Option<SharedPartition>> {
        let Some((data, meta)) = partition.flush_payload()? else {
            return Ok(None);
        };
        if meta.num_data_points == 0 {
            return Ok(None);
        }

        let dir = unique_partition_dir(data_path, meta.min_timestamp, meta.max_timestamp);
        let disk = DiskPartition::create(&dir, &meta, &data, self.retention)?;
        info!(
            dir = %dir.display(),
            points = meta.num_data_points,
            "flushed partition to disk"
        );
        Ok(Some(Arc::new(disk) as SharedPartition))
    }

    fn remove_expired_partitions(&self) {
        let expired: Vec<SharedPartition> =
            self.partitions.iter().filter(|p| p.expired()).collect();

        for partition in expired {
            info!(
                min = partition.min_timestamp(),
                max = partition.max_timestamp(),
                "removing expired partition"
            );
            if let Err(e) = self.partitions.remove(&partition) {
                error!(error = %e, "failed to remove expired partition");
            }
        }
    }
}

fn unique_partition_dir(data_path: &Path, min: i64, max: i64) -> PathBuf {
    let base = format!("{PARTITION_DIR_PREFIX}{min}-{max}");
    let mut candidate = data_path.join(&base);
    let mut suffix = 1u64;
    while candidate.exists() {
        candidate = data_path.join(format!("{base}-{suffix}"));
        suffix += 1;
    }
    candidate
}

fn retention_tick(retention: Duration) -> Duration {
    (retention / 10).clamp(Duration::from_millis(100), Duration::from_secs(3600))
}
