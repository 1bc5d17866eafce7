//! Gorilla-style sample codec: delta-of-delta timestamps and XOR-compressed
//! values over the bit stream.

use crate::bitstream::{BitReader, BitWriter};
use crate::varint::{self, MAX_VARINT_LEN};
use crate::{DataPoint, Result, TidemarkError};
use std::io::{self, Write};

// Sentinel meaning "no XOR window established yet".
const LEADING_UNSET: u8 = 0xFF;

/// Encodes an ordered sequence of data points into a compact byte stream.
///
/// The first timestamp is written as a zigzag varint and the first value as
/// its raw 64 bits; later timestamps are bucketed delta-of-delta and later
/// values XOR-compressed against the previous one.
pub struct GorillaEncoder<W: Write> {
    sink: W,
    bits: BitWriter,
    points_written: u64,
    timestamp: i64,
    delta: u64,
    value: f64,
    leading: u8,
    trailing: u8,
}

impl<W: Write> GorillaEncoder<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            bits: BitWriter::with_capacity(1024),
            points_written: 0,
            timestamp: 0,
            delta: 0,
            value: 0.0,
            leading: LEADING_UNSET,
            trailing: 0,
        }
    }

    pub fn encode_point(&mut self, point: &DataPoint) -> Result<()> {
        match self.points_written {
            0 => {
                self.write_varint(point.timestamp);
                self.bits.write_bits(point.value.to_bits(), 64);
            }
            1 => {
                let delta = self.timestamp_delta(point.timestamp)?;
                self.write_uvarint(delta);
                self.write_value(point.value);
                self.delta = delta;
            }
            _ => {
                let delta = self.timestamp_delta(point.timestamp)?;
                let dod = delta as i64 - self.delta as i64;
                match dod {
                    0 => self.bits.write_bit(false),
                    -63..=64 => {
                        self.bits.write_bits(0b10, 2);
                        self.bits.write_bits(dod as u64, 7);
                    }
                    -255..=256 => {
                        self.bits.write_bits(0b110, 3);
                        self.bits.write_bits(dod as u64, 9);
                    }
                    -2047..=2048 => {
                        self.bits.write_bits(0b1110, 4);
                        self.bits.write_bits(dod as u64, 12);
                    }
                    _ => {
                        self.bits.write_bits(0b1111, 4);
                        self.bits.write_bits(dod as u64, 64);
                    }
                }
                self.write_value(point.value);
                self.delta = delta;
            }
        }

        self.timestamp = point.timestamp;
        self.value = point.value;
        self.points_written += 1;
        Ok(())
    }

    /// Writes the buffered stream to the sink and resets for the next series.
    pub fn finish(&mut self) -> io::Result<()> {
        self.sink.write_all(self.bits.as_bytes())?;
        self.sink.flush()?;

        self.bits.clear();
        self.points_written = 0;
        self.timestamp = 0;
        self.delta = 0;
        self.value = 0.0;
        self.leading = LEADING_UNSET;
        self.trailing = 0;
        Ok(())
    }

    fn timestamp_delta(&self, timestamp: i64) -> Result<u64> {
        match timestamp.checked_sub(self.timestamp) {
            Some(delta) if delta >= 0 => Ok(delta as u64),
            _ => Err(TidemarkError::UnorderedTimestamps),
        }
    }

    fn write_value(&mut self, value: f64) {
        let xor = value.to_bits() ^ self.value.to_bits();
        if xor == 0 {
            self.bits.write_bit(false);
            return;
        }
        self.bits.write_bit(true);

        // The leading-zero field is 5 bits wide, so the window caps at 31.
        let leading = (xor.leading_zeros() as u8).min(31);
        let trailing = xor.trailing_zeros() as u8;

        if self.leading != LEADING_UNSET && leading >= self.leading && trailing >= self.trailing {
            // Previous window still covers the meaningful bits.
            self.bits.write_bit(false);
            let significant = 64 - self.leading - self.trailing;
            self.bits
                .write_bits(xor >> self.trailing, significant as usize);
        } else {
            self.leading = leading;
            self.trailing = trailing;

            self.bits.write_bit(true);
            self.bits.write_bits(leading as u64, 5);

            let significant = 64 - leading - trailing;
            // A 6-bit field cannot hold 64; zero stands in for it.
            let field = if significant == 64 { 0 } else { significant };
            self.bits.write_bits(field as u64, 6);
            self.bits.write_bits(xor >> trailing, significant as usize);
        }
    }

    fn write_varint(&mut self, value: i64) {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let len = varint::encode_varint(value, &mut buf);
        for byte in &buf[..len] {
            self.bits.write_byte(*byte);
        }
    }

    fn write_uvarint(&mut self, value: u64) {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let len = varint::encode_uvarint(value, &mut buf);
        for byte in &buf[..len] {
            self.bits.write_byte(*byte);
        }
    }
}

/// Decodes a stream produced by [`GorillaEncoder`].
pub struct GorillaDecoder<'a> {
    bits: BitReader<'a>,
    points_read: u64,
    timestamp: i64,
    delta: u64,
    value: f64,
    leading: u8,
    trailing: u8,
}

impl<'a> GorillaDecoder<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self {
            bits: BitReader::new(stream),
            points_read: 0,
            timestamp: 0,
            delta: 0,
            value: 0.0,
            leading: 0,
            trailing: 0,
        }
    }

    pub fn decode_point(&mut self) -> Result<DataPoint> {
        match self.points_read {
            0 => {
                self.timestamp = varint::zigzag_decode(self.read_uvarint()?);
                self.value = f64::from_bits(self.bits.read_bits(64).map_err(stream_err)?);
            }
            1 => {
                self.delta = self.read_uvarint()?;
                self.timestamp = self.timestamp.wrapping_add(self.delta as i64);
                self.read_value()?;
            }
            _ => {
                let dod = self.read_delta_of_delta()?;
                self.delta = (self.delta as i64).wrapping_add(dod) as u64;
                self.timestamp = self.timestamp.wrapping_add(self.delta as i64);
                self.read_value()?;
            }
        }

        self.points_read = self.points_read.saturating_add(1);
        Ok(DataPoint::new(self.timestamp, self.value))
    }

    fn read_delta_of_delta(&mut self) -> Result<i64> {
        let mut prefix = 0u8;
        for _ in 0..4 {
            prefix <<= 1;
            if !self.bits.read_bit().map_err(stream_err)? {
                break;
            }
            prefix |= 1;
        }

        let (nbits, bias): (u8, i64) = match prefix {
            0b0000 => return Ok(0),
            0b0010 => (7, 1 << 6),
            0b0110 => (9, 1 << 8),
            0b1110 => (12, 1 << 11),
            0b1111 => {
                return Ok(self.bits.read_bits(64).map_err(stream_err)? as i64);
            }
            _ => {
                return Err(TidemarkError::Corruption(format!(
                    "unknown timestamp prefix {prefix:#06b}"
                )));
            }
        };

        let raw = self.bits.read_bits(nbits).map_err(stream_err)? as i64;
        // Buckets are asymmetric: [-(2^(n-1) - 1), 2^(n-1)].
        if raw > bias {
            Ok(raw - (bias << 1))
        } else {
            Ok(raw)
        }
    }

    fn read_value(&mut self) -> Result<()> {
        if !self.bits.read_bit().map_err(stream_err)? {
            // XOR was zero: value repeats.
            return Ok(());
        }

        if self.bits.read_bit().map_err(stream_err)? {
            let leading = self.bits.read_bits(5).map_err(stream_err)? as u8;
            let field = self.bits.read_bits(6).map_err(stream_err)? as u8;
            let significant = if field == 0 { 64 } else { field };
            let Some(trailing) = 64u8.checked_sub(leading + significant) else {
                return Err(TidemarkError::Corruption(format!(
                    "impossible XOR window: {leading} leading, {significant} significant"
                )));
            };
            self.leading = leading;
            self.trailing = trailing;
        }

        let significant = 64 - self.leading - self.trailing;
        let bits = self.bits.read_bits(significant).map_err(stream_err)?;
        self.value = f64::from_bits(self.value.to_bits() ^ (bits << self.trailing));
        Ok(())
    }

    fn read_uvarint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;

        for i in 0..MAX_VARINT_LEN {
            let byte = self.bits.read_bits(8).map_err(stream_err)? as u8;
            if byte & 0x80 == 0 {
                if i == MAX_VARINT_LEN - 1 && byte > 1 {
                    return Err(TidemarkError::Corruption(
                        "varint overflows 64 bits".to_string(),
                    ));
                }
                return Ok(result | ((byte as u64) << shift));
            }
            result |= ((byte & 0x7F) as u64) << shift;
            shift += 7;
        }

        Err(TidemarkError::Corruption(
            "varint longer than ten bytes".to_string(),
        ))
    }
}

fn stream_err(err: io::Error) -> TidemarkError {
    TidemarkError::Corruption(format!("sample stream ended early: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(points: &[DataPoint]) {
        let mut buf = Vec::new();
        let mut encoder = GorillaEncoder::new(&mut buf);
        for point in points {
            encoder.encode_point(point).unwrap();
        }
        encoder.finish().unwrap();

        let mut decoder = GorillaDecoder::new(&buf);
        for expected in points {
            let decoded = decoder.decode_point().unwrap();
            assert_eq!(decoded.timestamp, expected.timestamp);
            assert_eq!(decoded.value.to_bits(), expected.value.to_bits());
        }
    }

    #[test]
    fn regular_interval_series_round_trips() {
        let points: Vec<DataPoint> = (0..200)
            .map(|i| DataPoint::new(1_600_000_000 + i * 15, (i as f64).sin()))
            .collect();
        round_trip(&points);
    }

    #[test]
    fn jittered_intervals_exercise_every_bucket() {
        let deltas = [1i64, 1, 70, 2, 300, 5, 2500, 3, 1_000_000, 4];
        let mut ts = -50i64; // negative start exercises the zigzag header
        let points: Vec<DataPoint> = deltas
            .iter()
            .enumerate()
            .map(|(i, d)| {
                ts += d;
                DataPoint::new(ts, 42.5 + i as f64 * 0.001)
            })
            .collect();
        round_trip(&points);
    }

    #[test]
    fn constant_values_compress_and_round_trip() {
        let points: Vec<DataPoint> = (0..50).map(|i| DataPoint::new(i * 10, 7.25)).collect();
        round_trip(&points);
    }

    #[test]
    fn equal_timestamps_are_allowed() {
        round_trip(&[
            DataPoint::new(100, 1.0),
            DataPoint::new(100, 2.0),
            DataPoint::new(101, 3.0),
        ]);
    }

    #[test]
    fn special_float_values_round_trip() {
        round_trip(&[
            DataPoint::new(1, 0.0),
            DataPoint::new(2, -0.0),
            DataPoint::new(3, f64::INFINITY),
            DataPoint::new(4, f64::MIN_POSITIVE),
            DataPoint::new(5, f64::MAX),
        ]);
    }

    #[test]
    fn encoder_rejects_regressing_timestamps() {
        let mut buf = Vec::new();
        let mut encoder = GorillaEncoder::new(&mut buf);
        encoder.encode_point(&DataPoint::new(10, 1.0)).unwrap();
        let err = encoder.encode_point(&DataPoint::new(9, 1.0)).unwrap_err();
        assert!(matches!(err, TidemarkError::UnorderedTimestamps));
    }

    #[test]
    fn corrupt_varint_is_an_error_not_a_panic() {
        let bytes = vec![0x80u8; 16];
        let mut decoder = GorillaDecoder::new(&bytes);
        assert!(matches!(
            decoder.decode_point(),
            Err(TidemarkError::Corruption(_))
        ));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut buf = Vec::new();
        let mut encoder = GorillaEncoder::new(&mut buf);
        for i in 0..10 {
            encoder.encode_point(&DataPoint::new(i, i as f64)).unwrap();
        }
        encoder.finish().unwrap();

        let truncated = &buf[..buf.len() / 2];
        let mut decoder = GorillaDecoder::new(truncated);
        let mut decoded = 0;
        while decoded < 10 && decoder.decode_point().is_ok() {
            decoded += 1;
        }
        assert!(decoded < 10, "truncation must surface as an error");
    }
}
