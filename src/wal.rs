//! Write-ahead log for the in-memory head partition.
//!
//! The log is a directory of numbered segment files. A segment holds a flat
//! sequence of insert records; a new segment is started every time the head
//! partition rotates, and segments are deleted once the data they cover has
//! been flushed to a disk partition.

use crate::varint::{self, MAX_VARINT_LEN};
use crate::{DataPoint, Label, Result, Row, TidemarkError};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

const SEGMENT_EXTENSION: &str = ".wal";

// Decode-time sanity limits; anything larger is treated as a garbled record.
const MAX_FIELD_LEN: u64 = 1 << 20;
const MAX_LABELS_PER_ROW: u64 = 1 << 16;

/// Operation tag prefixed to every WAL record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOperation {
    Insert = 1,
}

impl WalOperation {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(WalOperation::Insert),
            _ => None,
        }
    }
}

/// Crash-durability journal consumed by the head memory partition.
pub trait Wal: Send + Sync {
    /// Appends a batch of insert operations.
    fn append_rows(&self, rows: &[Row]) -> Result<()>;

    /// Pushes buffered data down to the operating system and fsyncs.
    fn flush(&self) -> Result<()>;

    /// Ends the current segment; the next append starts a new one.
    fn punctuate(&self) -> Result<()>;

    /// Deletes the oldest segment, always keeping the newest one alive.
    fn remove_oldest(&self) -> Result<()>;

    /// Deletes every segment.
    fn remove_all(&self) -> Result<()>;
}

/// WAL that drops everything. Used when persistence is disabled.
pub struct NopWal;

impl Wal for NopWal {
    fn append_rows(&self, _rows: &[Row]) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn punctuate(&self) -> Result<()> {
        Ok(())
    }

    fn remove_oldest(&self) -> Result<()> {
        Ok(())
    }

    fn remove_all(&self) -> Result<()> {
        Ok(())
    }
}

struct Segment {
    #[allow(dead_code)]
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Disk-backed WAL writing numbered segment files.
pub struct DiskWal {
    dir: PathBuf,
    // 0 means write-through: every append is flushed to the OS immediately.
    buffer_size: usize,
    active: Mutex<Option<Segment>>,
    next_index: AtomicU32,
}

impl DiskWal {
    pub fn new(dir: impl AsRef<Path>, buffer_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| TidemarkError::wal("open", e))?;

        let max_index = list_segments(&dir)
            .map_err(|e| TidemarkError::wal("open", e))?
            .last()
            .map(|(index, _)| *index)
            .unwrap_or(0);

        Ok(Self {
            dir,
            buffer_size,
            active: Mutex::new(None),
            next_index: AtomicU32::new(max_index + 1),
        })
    }

    fn open_segment(&self) -> io::Result<Segment> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{index:08}{SEGMENT_EXTENSION}"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = if self.buffer_size > 0 {
            BufWriter::with_capacity(self.buffer_size, file)
        } else {
            BufWriter::new(file)
        };
        Ok(Segment { path, writer })
    }

    fn sync_segment(segment: &mut Segment) -> io::Result<()> {
        segment.writer.flush()?;
        segment.writer.get_ref().sync_all()
    }
}

impl Wal for DiskWal {
    fn append_rows(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        // Encode the whole batch up front so it hits the segment in one
        // contiguous write.
        let mut record = Vec::with_capacity(rows.len() * 32);
        for row in rows {
            encode_row(&mut record, row);
        }

        let mut active = self.active.lock();
        if active.is_none() {
            *active = Some(
                self.open_segment()
                    .map_err(|e| TidemarkError::wal("append", e))?,
            );
        }

        if let Some(segment) = active.as_mut() {
            segment
                .writer
                .write_all(&record)
                .map_err(|e| TidemarkError::wal("append", e))?;

            if self.buffer_size == 0 {
                segment
                    .writer
                    .flush()
                    .map_err(|e| TidemarkError::wal("append", e))?;
            }
        }

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if let Some(segment) = self.active.lock().as_mut() {
            Self::sync_segment(segment).map_err(|e| TidemarkError::wal("flush", e))?;
        }
        Ok(())
    }

    fn punctuate(&self) -> Result<()> {
        let mut active = self.active.lock();
        if let Some(segment) = active.as_mut() {
            Self::sync_segment(segment).map_err(|e| TidemarkError::wal("punctuate", e))?;
        }
        *active = None;
        Ok(())
    }

    fn remove_oldest(&self) -> Result<()> {
        let segments = list_segments(&self.dir).map_err(|e| TidemarkError::wal("remove", e))?;
        if segments.len() <= 1 {
            return Ok(());
        }
        let (index, oldest) = &segments[0];
        debug!(segment = *index, "removing flushed WAL segment");
        fs::remove_file(oldest).map_err(|e| TidemarkError::wal("remove", e))?;
        Ok(())
    }

    fn remove_all(&self) -> Result<()> {
        // Drop the open writer before unlinking its file.
        self.active.lock().take();

        for (_, path) in list_segments(&self.dir).map_err(|e| TidemarkError::wal("remove", e))? {
            fs::remove_file(path).map_err(|e| TidemarkError::wal("remove", e))?;
        }
        Ok(())
    }
}

fn parse_segment_index(name: &OsStr) -> Option<u32> {
    let name = name.to_str()?;
    let stem = name.strip_suffix(SEGMENT_EXTENSION)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn list_segments(dir: &Path) -> io::Result<Vec<(u32, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            if let Some(index) = path.file_name().and_then(parse_segment_index) {
                segments.push((index, path));
            }
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

fn encode_row(out: &mut Vec<u8>, row: &Row) {
    let mut buf = [0u8; MAX_VARINT_LEN];

    out.push(WalOperation::Insert as u8);

    let len = varint::encode_uvarint(row.metric.len() as u64, &mut buf);
    out.extend_from_slice(&buf[..len]);
    out.extend_from_slice(row.metric.as_bytes());

    let len = varint::encode_uvarint(row.labels.len() as u64, &mut buf);
    out.extend_from_slice(&buf[..len]);
    for label in &row.labels {
        let len = varint::encode_uvarint(label.name.len() as u64, &mut buf);
        out.extend_from_slice(&buf[..len]);
        out.extend_from_slice(label.name.as_bytes());

        let len = varint::encode_uvarint(label.value.len() as u64, &mut buf);
        out.extend_from_slice(&buf[..len]);
        out.extend_from_slice(label.value.as_bytes());
    }

    let len = varint::encode_varint(row.data_point.timestamp, &mut buf);
    out.extend_from_slice(&buf[..len]);

    let len = varint::encode_uvarint(row.data_point.value.to_bits(), &mut buf);
    out.extend_from_slice(&buf[..len]);
}

/// Replays WAL segments left behind by a previous process.
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Reads every segment in index order and returns the decoded rows.
    /// A garbled or truncated tail ends that segment's replay with a warning
    /// rather than failing recovery.
    pub fn read_all(&self) -> Result<Vec<Row>> {
        let segments = list_segments(&self.dir).map_err(|e| TidemarkError::wal("replay", e))?;
        debug!(
            segments = segments.len(),
            dir = %self.dir.display(),
            "replaying WAL segments"
        );

        let mut rows = Vec::new();
        for (index, path) in segments {
            match read_segment(&path, &mut rows) {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        segment = index,
                        path = %path.display(),
                        error = %e,
                        "stopping WAL segment replay at damaged record"
                    );
                }
            }
        }

        Ok(rows)
    }
}

fn read_segment(path: &Path, rows: &mut Vec<Row>) -> Result<()> {
    let file = File::open(path).map_err(|e| TidemarkError::wal("replay", e))?;
    let mut reader = BufReader::new(file);

    loop {
        let mut op = [0u8; 1];
        match reader.read_exact(&mut op) {
            Ok(()) => {}
            // A clean end between records.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(TidemarkError::wal("replay", e)),
        }

        if WalOperation::from_u8(op[0]).is_none() {
            return Err(TidemarkError::wal(
                "replay",
                format!("unknown operation byte {}", op[0]),
            ));
        }

        match decode_row(&mut reader) {
            Ok(row) => rows.push(row),
            // A record cut short by a crash; everything before it is valid.
            Err(e) => return Err(TidemarkError::wal("replay", e)),
        }
    }
}

fn decode_row<R: Read>(reader: &mut R) -> io::Result<Row> {
    let metric = read_sized_string(reader)?;

    let label_count = varint::read_uvarint(reader)?;
    if label_count > MAX_LABELS_PER_ROW {
        return Err(garbled(format!("label count {label_count}")));
    }
    let mut labels = Vec::with_capacity(label_count as usize);
    for _ in 0..label_count {
        let name = read_sized_string(reader)?;
        let value = read_sized_string(reader)?;
        labels.push(Label::new(name, value));
    }

    let timestamp = varint::read_varint(reader)?;
    let value = f64::from_bits(varint::read_uvarint(reader)?);

    Ok(Row {
        metric,
        labels,
        data_point: DataPoint::new(timestamp, value),
    })
}

fn read_sized_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = varint::read_uvarint(reader)?;
    if len > MAX_FIELD_LEN {
        return Err(garbled(format!("field length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| garbled(e.to_string()))
}

fn garbled(details: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, details)
}
