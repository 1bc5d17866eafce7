//! The writable in-memory partition.

use crate::clock::TimestampPrecision;
use crate::gorilla::GorillaEncoder;
use crate::label::marshal_series_key;
use crate::partition::disk::{self, PartitionMeta, SeriesMeta};
use crate::partition::Partition;
use crate::wal::Wal;
use crate::{DataPoint, Result, Row, TidemarkError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// A partition holding its samples on the heap, guarded for concurrent
/// writers. The head of the partition list is always one of these.
pub struct MemoryPartition {
    num_points: AtomicUsize,
    // Set exactly once, from the first accepted batch's minimum timestamp.
    min_t: AtomicI64,
    min_t_once: Once,
    max_t: AtomicI64,
    series: DashMap<Vec<u8>, Arc<MemorySeries>>,
    wal: Arc<dyn Wal>,
    // Timestamp span, in precision units, after which the partition is full.
    span: i64,
    precision: TimestampPrecision,
    retention: Duration,
    created_at: SystemTime,
    // Flush coordination: no insert may run once the seal is set.
    sealed: AtomicBool,
    inflight: AtomicUsize,
}

impl MemoryPartition {
    pub fn new(
        wal: Arc<dyn Wal>,
        partition_duration: Duration,
        precision: TimestampPrecision,
        retention: Duration,
    ) -> Self {
        Self {
            num_points: AtomicUsize::new(0),
            min_t: AtomicI64::new(i64::MAX),
            min_t_once: Once::new(),
            max_t: AtomicI64::new(i64::MIN),
            series: DashMap::new(),
            wal,
            span: precision.units_in(partition_duration),
            precision,
            retention,
            created_at: SystemTime::now(),
            sealed: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
        }
    }

    /// Inserts rows during WAL replay: identical to a normal insert except
    /// the rows are not appended to the WAL again.
    pub fn insert_rows_recovery(&self, rows: &[Row]) -> Result<Vec<Row>> {
        self.insert(rows, false)
    }

    fn insert(&self, rows: &[Row], append_wal: bool) -> Result<Vec<Row>> {
        if rows.is_empty() {
            return Err(TidemarkError::NoRows);
        }

        if self.sealed.load(Ordering::Acquire) {
            // A flush owns this partition now; pass the batch along.
            return Ok(rows.to_vec());
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let _inflight = InflightGuard(&self.inflight);
        if self.sealed.load(Ordering::Acquire) {
            return Ok(rows.to_vec());
        }

        let rows = self.stamp_zero_timestamps(rows);

        // The first batch to arrive pins the partition's minimum.
        let batch_min = rows
            .iter()
            .map(|row| row.data_point.timestamp)
            .min()
            .unwrap_or(i64::MAX);
        self.min_t_once
            .call_once(|| self.min_t.store(batch_min, Ordering::Release));

        let min_t = self.min_t.load(Ordering::Acquire);
        let mut accepted = Vec::with_capacity(rows.len());
        let mut outdated = Vec::new();
        for row in rows {
            if row.data_point.timestamp < min_t {
                outdated.push(row);
            } else {
                accepted.push(row);
            }
        }

        if accepted.is_empty() {
            return Ok(outdated);
        }

        // The batch becomes durable before any series state changes; a WAL
        // failure aborts it with no side effects.
        if append_wal {
            self.wal.append_rows(&accepted)?;
        }

        let mut batch_max = i64::MIN;
        for row in &accepted {
            let timestamp = row.data_point.timestamp;
            batch_max = batch_max.max(timestamp);

            let series = self.series_for(marshal_series_key(&row.metric, &row.labels));
            series.insert_point(DataPoint::new(timestamp, row.data_point.value));
        }

        self.num_points.fetch_add(accepted.len(), Ordering::AcqRel);
        self.max_t.fetch_max(batch_max, Ordering::AcqRel);

        Ok(outdated)
    }

    fn stamp_zero_timestamps(&self, rows: &[Row]) -> Vec<Row> {
        let mut stamped = 0usize;
        let mut now = None;
        let rows: Vec<Row> = rows
            .iter()
            .map(|row| {
                if row.data_point.timestamp != 0 {
                    return row.clone();
                }
                stamped += 1;
                let now = *now.get_or_insert_with(|| self.precision.now());
                let mut row = row.clone();
                row.data_point.timestamp = now;
                row
            })
            .collect();

        if stamped > 0 {
            debug!(count = stamped, "stamped zero timestamps with current time");
        }
        rows
    }

    fn series_for(&self, key: Vec<u8>) -> Arc<MemorySeries> {
        let entry = self
            .series
            .entry(key)
            .or_insert_with(|| Arc::new(MemorySeries::new()));
        Arc::clone(entry.value())
    }
}

struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Partition for MemoryPartition {
    fn insert_rows(&self, rows: &[Row]) -> Result<Vec<Row>> {
        self.insert(rows, true)
    }

    fn select_data_points(
        &self,
        metric: &str,
        labels: &[crate::Label],
        start: i64,
        end: i64,
    ) -> Result<Vec<DataPoint>> {
        if self.size() == 0 {
            return Ok(Vec::new());
        }
        let min = self.min_t.load(Ordering::Acquire);
        let max = self.max_t.load(Ordering::Acquire);
        if end <= min || start > max {
            return Ok(Vec::new());
        }

        let key = marshal_series_key(metric, labels);
        match self.series.get(&key) {
            Some(series) => Ok(series.select(start, end)),
            None => Ok(Vec::new()),
        }
    }

    fn min_timestamp(&self) -> i64 {
        self.min_t.load(Ordering::SeqCst)
    }

    fn max_timestamp(&self) -> i64 {
        self.max_t.load(Ordering::SeqCst)
    }

    fn size(&self) -> usize {
        self.num_points.load(Ordering::SeqCst)
    }

    fn active(&self) -> bool {
        if self.size() == 0 {
            return true;
        }
        let span = self
            .max_timestamp()
            .saturating_sub(self.min_timestamp())
            .saturating_add(1);
        span < self.span
    }

    fn expired(&self) -> bool {
        // Wall-clock expiry lets memory-only storages reclaim partitions;
        // persistent storages flush long before this trips.
        match self.created_at.elapsed() {
            Ok(age) => age > self.retention,
            Err(_) => false,
        }
    }

    fn clean(&self) -> Result<()> {
        // Heap memory; dropping the partition is the cleanup.
        Ok(())
    }

    fn flush_payload(&self) -> Result<Option<(Vec<u8>, PartitionMeta)>> {
        self.wal.flush()?;

        let mut data = Vec::new();
        let mut metrics = HashMap::with_capacity(self.series.len());

        for entry in self.series.iter() {
            let (key, series) = entry.pair();
            let offset = data.len() as u64;

            let mut encoder = GorillaEncoder::new(&mut data);
            series.encode_all_points(&mut encoder)?;
            encoder.finish()?;

            let name = disk::render_series_key(key);
            metrics.insert(
                name.clone(),
                SeriesMeta {
                    name,
                    offset,
                    min_timestamp: series.min_timestamp(),
                    max_timestamp: series.max_timestamp(),
                    num_data_points: series.len(),
                },
            );
        }

        let meta = PartitionMeta {
            min_timestamp: self.min_timestamp(),
            max_timestamp: self.max_timestamp(),
            num_data_points: self.size(),
            created_at: DateTime::<Utc>::from(self.created_at),
            metrics,
        };

        Ok(Some((data, meta)))
    }

    fn begin_flush(&self) -> bool {
        if self
            .sealed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Wait out writers that slipped in before the seal.
        while self.inflight.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
        true
    }

    fn end_flush(&self) {
        self.sealed.store(false, Ordering::Release);
    }
}

/// All samples of one series within a memory partition: an in-order vector
/// with a fast append path plus an overflow vector for out-of-order arrivals.
struct MemorySeries {
    count: AtomicUsize,
    min_t: AtomicI64,
    max_t: AtomicI64,
    points: RwLock<Vec<DataPoint>>,
    out_of_order: Mutex<Vec<DataPoint>>,
}

impl MemorySeries {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            min_t: AtomicI64::new(i64::MAX),
            max_t: AtomicI64::new(i64::MIN),
            points: RwLock::new(Vec::new()),
            out_of_order: Mutex::new(Vec::new()),
        }
    }

    fn insert_point(&self, point: DataPoint) {
        if self.count.load(Ordering::Acquire) == 0 {
            let mut points = self.points.write();
            if self.count.load(Ordering::Acquire) == 0 {
                points.push(point);
                self.min_t.store(point.timestamp, Ordering::Release);
                self.max_t.store(point.timestamp, Ordering::Release);
                self.count.store(1, Ordering::Release);
                return;
            }
            // Lost the race for first insert; fall through to the usual path.
        }

        // The upgradable read excludes writers, so the tail check stays valid
        // across the upgrade. Ties append in order; the ordered vector is
        // non-strictly increasing.
        let points = self.points.upgradable_read();
        let last_ts = points.last().map(|p| p.timestamp);
        match last_ts {
            Some(last) if last <= point.timestamp => {
                let mut points = RwLockUpgradableReadGuard::upgrade(points);
                points.push(point);
                self.max_t.fetch_max(point.timestamp, Ordering::AcqRel);
                self.count.fetch_add(1, Ordering::AcqRel);
            }
            _ => {
                drop(points);
                // Out of order: kept aside until flush.
                self.out_of_order.lock().push(point);
                self.min_t.fetch_min(point.timestamp, Ordering::AcqRel);
                self.max_t.fetch_max(point.timestamp, Ordering::AcqRel);
                self.count.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Returns the in-order points within `[start, end)`. Out-of-order
    /// points are not visible until the partition is flushed.
    fn select(&self, start: i64, end: i64) -> Vec<DataPoint> {
        let points = self.points.read();
        let lo = points.partition_point(|p| p.timestamp < start);
        let hi = points.partition_point(|p| p.timestamp < end);
        points[lo..hi].to_vec()
    }

    /// Encodes every point, merging the sorted overflow into the in-order
    /// vector with a two-pointer walk.
    fn encode_all_points<W: Write>(&self, encoder: &mut GorillaEncoder<W>) -> Result<()> {
        let mut out_of_order = self.out_of_order.lock();
        out_of_order.sort_by_key(|p| p.timestamp);

        let points = self.points.read();
        let (mut oi, mut pi) = (0usize, 0usize);

        while oi < out_of_order.len() && pi < points.len() {
            if out_of_order[oi].timestamp < points[pi].timestamp {
                encoder.encode_point(&out_of_order[oi])?;
                oi += 1;
            } else {
                encoder.encode_point(&points[pi])?;
                pi += 1;
            }
        }
        while oi < out_of_order.len() {
            encoder.encode_point(&out_of_order[oi])?;
            oi += 1;
        }
        while pi < points.len() {
            encoder.encode_point(&points[pi])?;
            pi += 1;
        }

        Ok(())
    }

    fn min_timestamp(&self) -> i64 {
        self.min_t.load(Ordering::SeqCst)
    }

    fn max_timestamp(&self) -> i64 {
        self.max_t.load(Ordering::SeqCst)
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}
