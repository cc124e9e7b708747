//! Telemetry decoder for reassembled activity buffers.
//!
//! The buffer is a flat sequence of explicit-length records:
//!
//! ```text
//! <type:1> <length:1> <payload:length-2>
//! ```
//!
//! | type | length | payload |
//! |------|--------|---------|
//! | `01` | 12 | timestamp mark, `u64` milliseconds since the epoch |
//! | `02` | 20 | absolute fix, `i32` longitude, `i32` latitude (degrees x 3,000,000) |
//! | `03` | 8  | delta fix, `i16` time offset (s), `i16` longitude delta, `i16` latitude delta |
//! | `04` | 5  | heart rate, `i16` time offset (s), `u8` BPM (3-byte form: BPM only) |
//! | `05` | 4  | status |
//! | `06` | 6  | speed |
//! | `07` | 6  | altitude |
//!
//! Unknown tags are skipped by their declared length. A record running past the
//! end of the buffer is treated as truncated and dropped.
//!
//! Firmware that does not produce this layout is detected by plausibility
//! checks; the decoder then falls back to an estimate-only result that carries
//! the byte count but no geographic data.

use bytes::Buf;
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    stats::is_valid_heart_rate,
    types::{PointKind, TrackPoint},
};

/// Fixed-point scale of coordinates on the wire
pub const COORDINATE_SCALE: f64 = 3_000_000.0;

/// Mean Earth radius used for great-circle distances
pub const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Record type codes
pub mod record_type {
    /// Absolute time origin
    pub const TIMESTAMP_MARK: u8 = 0x01;
    /// Absolute position
    pub const ABSOLUTE_FIX: u8 = 0x02;
    /// Position relative to the running base
    pub const DELTA_FIX: u8 = 0x03;
    /// Heart-rate sample
    pub const HEART_RATE: u8 = 0x04;
    /// Pause/resume status
    pub const STATUS: u8 = 0x05;
    /// Speed sample
    pub const SPEED: u8 = 0x06;
    /// Altitude sample
    pub const ALTITUDE: u8 = 0x07;
}

const HEADER_LEN: usize = 2;
const PLAUSIBLE_YEARS: std::ops::RangeInclusive<i32> = 2000..=2100;

/// One record as it appears in the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    /// Type tag
    pub type_code: u8,
    /// Declared length including the header
    pub length: u8,
    /// `length - 2` payload bytes
    pub payload: &'a [u8],
}

/// How a record walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// Every byte belonged to a complete record
    Complete,
    /// The last record (or its header) ran past the buffer
    Truncated {
        /// Offset of the incomplete record
        offset: usize,
    },
    /// A header declared a length shorter than the header itself
    Malformed {
        /// Offset of the bad header
        offset: usize,
    },
}

/// Iterator over the records of a buffer
///
/// Never reads past the buffer; check [`RecordReader::end`] once exhausted.
#[derive(Debug, Clone)]
pub struct RecordReader<'a> {
    buf: &'a [u8],
    offset: usize,
    end: Option<WalkEnd>,
}

impl<'a> RecordReader<'a> {
    /// Start walking a buffer
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            end: None,
        }
    }

    /// Why the walk stopped, once it has
    #[must_use]
    pub const fn end(&self) -> Option<WalkEnd> {
        self.end
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = RawRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end.is_some() {
            return None;
        }

        let offset = self.offset;
        let remaining = &self.buf[offset..];
        if remaining.is_empty() {
            self.end = Some(WalkEnd::Complete);
            return None;
        }
        if remaining.len() < HEADER_LEN {
            self.end = Some(WalkEnd::Truncated { offset });
            return None;
        }

        let type_code = remaining[0];
        let length = remaining[1];
        let len = usize::from(length);
        if len < HEADER_LEN {
            self.end = Some(WalkEnd::Malformed { offset });
            return None;
        }
        if len > remaining.len() {
            self.end = Some(WalkEnd::Truncated { offset });
            return None;
        }

        self.offset += len;
        Some(RawRecord {
            type_code,
            length,
            payload: &remaining[HEADER_LEN..len],
        })
    }
}

/// Typed telemetry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryRecord {
    /// Sets the time origin and resets the running offset
    TimestampMark {
        /// Milliseconds since the Unix epoch
        millis: u64,
    },
    /// Sets the base position
    AbsoluteFix {
        /// Fixed-point longitude
        longitude: i32,
        /// Fixed-point latitude
        latitude: i32,
    },
    /// Moves the base position
    DeltaFix {
        /// Seconds added to the running offset
        offset_s: i16,
        /// Fixed-point longitude delta
        delta_lon: i16,
        /// Fixed-point latitude delta
        delta_lat: i16,
    },
    /// Heart-rate reading
    HeartRateSample {
        /// Seconds added to the running offset
        offset_s: i16,
        /// Beats per minute, 0 and 255 mean no reading
        bpm: u8,
    },
    /// Status, speed or altitude record
    OtherFixed {
        /// Type tag
        type_code: u8,
    },
}

impl TelemetryRecord {
    /// Interpret a raw record
    ///
    /// Returns `None` for unknown tags and for known tags with a length that
    /// does not match their layout.
    #[must_use]
    pub fn parse(raw: &RawRecord<'_>) -> Option<Self> {
        use record_type::*;

        let mut payload = raw.payload;
        if payload.len() + HEADER_LEN != usize::from(raw.length) {
            return None;
        }

        let record = match (raw.type_code, raw.length) {
            (TIMESTAMP_MARK, 12) => Self::TimestampMark {
                millis: payload.get_u64_le(),
            },
            (ABSOLUTE_FIX, 20) => {
                let longitude = payload.get_i32_le();
                let latitude = payload.get_i32_le();
                Self::AbsoluteFix {
                    longitude,
                    latitude,
                }
            }
            (DELTA_FIX, 8) => {
                let offset_s = payload.get_i16_le();
                let delta_lon = payload.get_i16_le();
                let delta_lat = payload.get_i16_le();
                Self::DeltaFix {
                    offset_s,
                    delta_lon,
                    delta_lat,
                }
            }
            (HEART_RATE, 5) => {
                let offset_s = payload.get_i16_le();
                Self::HeartRateSample {
                    offset_s,
                    bpm: payload.get_u8(),
                }
            }
            (HEART_RATE, 3) => Self::HeartRateSample {
                offset_s: 0,
                bpm: payload.get_u8(),
            },
            (STATUS, 4) | (SPEED | ALTITUDE, 6) => Self::OtherFixed {
                type_code: raw.type_code,
            },
            _ => return None,
        };
        Some(record)
    }
}

/// Whether the buffer was understood
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Records decoded with the explicit-length layout
    Canonical,
    /// Layout not recognised; only the byte count is meaningful
    EstimateOnly,
}

/// Result of decoding one buffer
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedActivity {
    /// Trackpoints in record order, heart-rate-only points included
    pub points: Vec<TrackPoint>,
    /// Every valid heart-rate reading, attached or not
    pub heart_rate_samples: Vec<u8>,
    /// Great-circle distance across consecutive fixes
    pub distance_km: f64,
    /// Time between the first and last fix
    pub duration: Option<Duration>,
    /// Whether geographic fields can be trusted
    pub is_real_data: bool,
    /// Length of the decoded buffer
    pub byte_count: usize,
    /// Canonical or estimate-only
    pub mode: DecodeMode,
    /// Records with a recognised tag
    pub records: usize,
    /// Records skipped by declared length
    pub unknown_records: usize,
    /// Whether trailing bytes were dropped
    pub truncated: bool,
}

impl DecodedActivity {
    fn estimate_only(byte_count: usize, records: usize, unknown_records: usize) -> Self {
        Self {
            points: Vec::new(),
            heart_rate_samples: Vec::new(),
            distance_km: 0.0,
            duration: None,
            is_real_data: false,
            byte_count,
            mode: DecodeMode::EstimateOnly,
            records,
            unknown_records,
            truncated: false,
        }
    }

    /// Points with a GPS fix
    pub fn fixes(&self) -> impl Iterator<Item = &TrackPoint> {
        self.points.iter().filter(|p| p.has_valid_coordinates())
    }
}

/// Great-circle distance between two coordinates in kilometres
#[must_use]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Sum of distances between consecutive valid fixes
#[must_use]
pub fn track_distance_km(points: &[TrackPoint]) -> f64 {
    let mut fixes = points.iter().filter(|p| p.has_valid_coordinates());
    let Some(mut previous) = fixes.next() else {
        return 0.0;
    };

    let mut total = 0.0;
    for point in fixes {
        total += haversine_km(
            previous.latitude,
            previous.longitude,
            point.latitude,
            point.longitude,
        );
        previous = point;
    }
    total
}

fn track_duration(points: &[TrackPoint]) -> Option<Duration> {
    let mut fixes = points.iter().filter(|p| p.has_valid_coordinates());
    let first = fixes.next()?;
    let last = fixes.last().unwrap_or(first);
    (last.timestamp - first.timestamp).abs().to_std().ok()
}

/// Reason a buffer does not look like telemetry
#[derive(Debug)]
struct Implausible(&'static str);

struct DecodeState {
    origin: DateTime<Utc>,
    offset_s: i64,
    base_lon: i64,
    base_lat: i64,
    attach_window: TimeDelta,
    points: Vec<TrackPoint>,
    heart_rate_samples: Vec<u8>,
}

impl DecodeState {
    fn new(origin: DateTime<Utc>, attach_window: TimeDelta) -> Self {
        Self {
            origin,
            offset_s: 0,
            base_lon: 0,
            base_lat: 0,
            attach_window,
            points: Vec::new(),
            heart_rate_samples: Vec::new(),
        }
    }

    fn apply(&mut self, record: TelemetryRecord) -> Result<(), Implausible> {
        match record {
            TelemetryRecord::TimestampMark { millis } => {
                let origin = i64::try_from(millis)
                    .ok()
                    .and_then(DateTime::from_timestamp_millis)
                    .filter(|t| PLAUSIBLE_YEARS.contains(&t.year()))
                    .ok_or(Implausible("timestamp mark out of range"))?;
                self.origin = origin;
                self.offset_s = 0;
                Ok(())
            }
            TelemetryRecord::AbsoluteFix {
                longitude,
                latitude,
            } => {
                self.base_lon = i64::from(longitude);
                self.base_lat = i64::from(latitude);
                self.emit_fix()
            }
            TelemetryRecord::DeltaFix {
                offset_s,
                delta_lon,
                delta_lat,
            } => {
                self.offset_s += i64::from(offset_s);
                self.base_lon += i64::from(delta_lon);
                self.base_lat += i64::from(delta_lat);
                self.emit_fix()
            }
            TelemetryRecord::HeartRateSample { offset_s, bpm } => {
                self.offset_s += i64::from(offset_s);
                self.heart_rate(bpm)
            }
            TelemetryRecord::OtherFixed { .. } => Ok(()),
        }
    }

    fn now(&self) -> Result<DateTime<Utc>, Implausible> {
        TimeDelta::try_seconds(self.offset_s)
            .and_then(|offset| self.origin.checked_add_signed(offset))
            .ok_or(Implausible("time offset overflow"))
    }

    fn position(&self) -> (f64, f64) {
        (
            self.base_lat as f64 / COORDINATE_SCALE,
            self.base_lon as f64 / COORDINATE_SCALE,
        )
    }

    fn emit_fix(&mut self) -> Result<(), Implausible> {
        let (latitude, longitude) = self.position();
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(Implausible("fix outside WGS84 range"));
        }
        let timestamp = self.now()?;

        if let Some(last) = self.points.last_mut() {
            if last.kind == PointKind::HeartRateOnly && last.timestamp == timestamp {
                last.latitude = latitude;
                last.longitude = longitude;
                last.kind = PointKind::Position;
                return Ok(());
            }
        }

        self.points.push(TrackPoint {
            latitude,
            longitude,
            timestamp,
            heart_rate: None,
            kind: PointKind::Position,
        });
        Ok(())
    }

    fn heart_rate(&mut self, bpm: u8) -> Result<(), Implausible> {
        if !is_valid_heart_rate(bpm) {
            return Ok(());
        }
        let timestamp = self.now()?;
        self.heart_rate_samples.push(bpm);

        if let Some(last) = self.points.last_mut() {
            if (timestamp - last.timestamp).abs() <= self.attach_window {
                last.heart_rate = Some(bpm);
                return Ok(());
            }
        }

        let (latitude, longitude) = self.position();
        self.points.push(TrackPoint {
            latitude,
            longitude,
            timestamp,
            heart_rate: Some(bpm),
            kind: PointKind::HeartRateOnly,
        });
        Ok(())
    }
}

/// Decoder for reassembled telemetry buffers
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    attach_window: TimeDelta,
}

impl Default for TelemetryDecoder {
    fn default() -> Self {
        Self {
            attach_window: TimeDelta::seconds(5),
        }
    }
}

impl TelemetryDecoder {
    /// Create a decoder with the default 5 s heart-rate attach window
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different window for attaching heart rate to the previous point
    #[must_use]
    pub const fn with_attach_window(mut self, window: TimeDelta) -> Self {
        self.attach_window = window;
        self
    }

    /// Decode using the current time as origin until a timestamp mark appears
    #[must_use]
    pub fn decode(&self, buffer: &[u8]) -> DecodedActivity {
        self.decode_with_origin(buffer, Utc::now())
    }

    /// Decode with an explicit time origin for records before the first mark
    #[must_use]
    pub fn decode_with_origin(&self, buffer: &[u8], origin: DateTime<Utc>) -> DecodedActivity {
        let mut state = DecodeState::new(origin, self.attach_window);
        let mut reader = RecordReader::new(buffer);
        let mut records = 0;
        let mut unknown_records = 0;

        for raw in reader.by_ref() {
            let Some(record) = TelemetryRecord::parse(&raw) else {
                unknown_records += 1;
                debug!(
                    "Skipping record type {:02X} ({} bytes)",
                    raw.type_code, raw.length
                );
                continue;
            };
            records += 1;

            if let Err(Implausible(reason)) = state.apply(record) {
                warn!(
                    "Buffer of {} bytes does not decode as telemetry ({}), estimate only",
                    buffer.len(),
                    reason
                );
                return DecodedActivity::estimate_only(buffer.len(), records, unknown_records);
            }
        }

        if records == 0 {
            if !buffer.is_empty() {
                warn!(
                    "No known records in {} bytes, estimate only",
                    buffer.len()
                );
            }
            return DecodedActivity::estimate_only(buffer.len(), records, unknown_records);
        }

        let truncated = match reader.end() {
            Some(WalkEnd::Truncated { offset }) => {
                debug!("Dropping {} trailing bytes", buffer.len() - offset);
                true
            }
            Some(WalkEnd::Malformed { offset }) => {
                warn!("Malformed record header at offset {}", offset);
                true
            }
            _ => false,
        };

        let distance_km = track_distance_km(&state.points);
        let duration = track_duration(&state.points);
        debug!(
            "Decoded {} records ({} unknown) into {} points, {:.3} km",
            records,
            unknown_records,
            state.points.len(),
            distance_km
        );

        DecodedActivity {
            points: state.points,
            heart_rate_samples: state.heart_rate_samples,
            distance_km,
            duration,
            is_real_data: true,
            byte_count: buffer.len(),
            mode: DecodeMode::Canonical,
            records,
            unknown_records,
            truncated,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_records::*;
    use super::*;

    // 2024-05-01T08:00:00Z
    const T0: u64 = 1_714_550_400_000;

    fn origin() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(T0 as i64).unwrap()
    }

    fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn test_timestamp_then_three_deltas() {
        let buffer = concat(&[
            timestamp(T0),
            delta(1, 10, 10),
            delta(1, 10, 10),
            delta(1, -5, -5),
        ]);
        let decoded = TelemetryDecoder::new().decode(&buffer);

        assert!(decoded.is_real_data);
        assert_eq!(decoded.mode, DecodeMode::Canonical);
        assert_eq!(decoded.points.len(), 3);
        assert!(decoded.points.iter().all(TrackPoint::is_position));
        assert!(decoded
            .points
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(decoded.points[0].timestamp, origin() + TimeDelta::seconds(1));
        assert!(decoded.distance_km > 0.0);

        let last = &decoded.points[2];
        assert!((last.latitude - 15.0 / COORDINATE_SCALE).abs() < 1e-12);
        assert!((last.longitude - 15.0 / COORDINATE_SCALE).abs() < 1e-12);
    }

    #[test]
    fn test_distance_is_sum_of_pairwise_haversine() {
        let buffer = concat(&[
            timestamp(T0),
            absolute(40.4168, -3.7038),
            delta(5, 300, 0),
            delta(5, 0, 300),
            delta(5, -300, -300),
        ]);
        let decoded = TelemetryDecoder::new().decode(&buffer);
        let fixes: Vec<_> = decoded.fixes().collect();
        assert_eq!(fixes.len(), 4);

        let expected: f64 = fixes
            .windows(2)
            .map(|w| haversine_km(w[0].latitude, w[0].longitude, w[1].latitude, w[1].longitude))
            .sum();
        assert!((decoded.distance_km - expected).abs() < 1e-12);
        assert_eq!(decoded.duration, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_distance_zero_for_zero_or_one_fix() {
        let none = TelemetryDecoder::new().decode_with_origin(&timestamp(T0), origin());
        assert_eq!(none.distance_km, 0.0);
        assert_eq!(none.duration, None);

        let one = TelemetryDecoder::new()
            .decode_with_origin(&concat(&[timestamp(T0), absolute(48.0, 11.0)]), origin());
        assert_eq!(one.points.len(), 1);
        assert_eq!(one.distance_km, 0.0);
        assert_eq!(one.duration, Some(Duration::ZERO));
    }

    #[test]
    fn test_haversine_one_degree_on_equator() {
        let km = haversine_km(0.0, 0.0, 0.0, 1.0);
        assert!((km - 111.195).abs() < 0.01);
    }

    #[test]
    fn test_truncated_trailing_record_is_dropped() {
        let mut buffer = concat(&[timestamp(T0), delta(1, 10, 10)]);
        let full = delta(1, 10, 10);
        buffer.extend_from_slice(&full[..5]);

        let decoded = TelemetryDecoder::new().decode(&buffer);
        assert!(decoded.is_real_data);
        assert!(decoded.truncated);
        assert_eq!(decoded.points.len(), 1);
        assert_eq!(decoded.records, 2);
    }

    #[test]
    fn test_reader_never_passes_buffer_end() {
        // every prefix of a valid buffer, plus garbage tails
        let buffer = concat(&[
            timestamp(T0),
            absolute(1.0, 2.0),
            heart_rate(0, 120),
            vec![0x42, 0xFF, 0x01],
        ]);
        for end in 0..=buffer.len() {
            let slice = &buffer[..end];
            let mut reader = RecordReader::new(slice);
            let consumed: usize = reader.by_ref().map(|r| usize::from(r.length)).sum();
            assert!(consumed <= slice.len());
            assert!(reader.end().is_some());
            let _ = TelemetryDecoder::new().decode_with_origin(slice, origin());
        }
    }

    #[test]
    fn test_unknown_records_are_skipped() {
        let buffer = concat(&[
            timestamp(T0),
            vec![0x7E, 5, 0xDE, 0xAD, 0xBE],
            absolute(10.0, 20.0),
            // known tag with a foreign length is skipped too
            vec![0x03, 4, 0x00, 0x00],
            vec![0x05, 4, 0x01, 0x00],
        ]);
        let decoded = TelemetryDecoder::new().decode(&buffer);
        assert_eq!(decoded.unknown_records, 2);
        assert_eq!(decoded.records, 3);
        assert_eq!(decoded.points.len(), 1);
        assert!(!decoded.truncated);
    }

    #[test]
    fn test_heart_rate_attaches_to_recent_fix() {
        let buffer = concat(&[
            timestamp(T0),
            absolute(10.0, 20.0),
            heart_rate(2, 130),
            // 0 and 255 are not readings
            heart_rate(0, 0),
            heart_rate(0, 255),
        ]);
        let decoded = TelemetryDecoder::new().decode(&buffer);
        assert_eq!(decoded.points.len(), 1);
        assert_eq!(decoded.points[0].heart_rate, Some(130));
        assert_eq!(decoded.heart_rate_samples, vec![130]);
    }

    #[test]
    fn test_distant_heart_rate_becomes_hr_only_point() {
        let buffer = concat(&[
            timestamp(T0),
            absolute(10.0, 20.0),
            heart_rate(30, 140),
            // a fix at the same instant upgrades the heart-rate point
            delta(0, 30, 30),
            heart_rate(60, 150),
        ]);
        let decoded = TelemetryDecoder::new().decode(&buffer);
        assert_eq!(decoded.points.len(), 3);
        assert_eq!(decoded.points[1].kind, PointKind::Position);
        assert_eq!(decoded.points[1].heart_rate, Some(140));
        assert_eq!(decoded.points[2].kind, PointKind::HeartRateOnly);
        assert_eq!(decoded.fixes().count(), 2);
        assert_eq!(decoded.heart_rate_samples, vec![140, 150]);
        assert_eq!(decoded.duration, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_attach_window_is_configurable() {
        let buffer = concat(&[timestamp(T0), absolute(10.0, 20.0), heart_rate(2, 130)]);

        let narrow = TelemetryDecoder::new()
            .with_attach_window(TimeDelta::seconds(1))
            .decode(&buffer);
        assert_eq!(narrow.points.len(), 2);
        assert_eq!(narrow.points[0].heart_rate, None);
        assert_eq!(narrow.points[1].kind, PointKind::HeartRateOnly);

        let wide = TelemetryDecoder::new()
            .with_attach_window(TimeDelta::seconds(3))
            .decode(&buffer);
        assert_eq!(wide.points.len(), 1);
        assert_eq!(wide.points[0].heart_rate, Some(130));
    }

    #[test]
    fn test_bpm_only_heart_rate_form() {
        let buffer = concat(&[timestamp(T0), absolute(1.0, 1.0), vec![0x04, 3, 99]]);
        let decoded = TelemetryDecoder::new().decode(&buffer);
        assert_eq!(decoded.points[0].heart_rate, Some(99));
    }

    #[test]
    fn test_implausible_buffer_degrades_to_estimate_only() {
        let far_future = concat(&[timestamp(u64::MAX / 2), absolute(1.0, 1.0)]);
        let decoded = TelemetryDecoder::new().decode(&far_future);
        assert_eq!(decoded.mode, DecodeMode::EstimateOnly);
        assert!(!decoded.is_real_data);
        assert!(decoded.points.is_empty());
        assert_eq!(decoded.byte_count, far_future.len());

        let off_globe = concat(&[timestamp(T0), absolute(95.0, 10.0)]);
        assert!(!TelemetryDecoder::new().decode(&off_globe).is_real_data);

        let garbage = vec![0xA5; 64];
        let decoded = TelemetryDecoder::new().decode(&garbage);
        assert_eq!(decoded.mode, DecodeMode::EstimateOnly);
        assert_eq!(decoded.byte_count, 64);

        let empty = TelemetryDecoder::new().decode(&[]);
        assert!(!empty.is_real_data);
        assert_eq!(empty.byte_count, 0);
    }

    #[test]
    fn test_malformed_header_stops_walk() {
        let buffer = concat(&[timestamp(T0), absolute(1.0, 1.0), vec![0x03, 0x01, 0x00]]);
        let decoded = TelemetryDecoder::new().decode(&buffer);
        assert!(decoded.is_real_data);
        assert!(decoded.truncated);
        assert_eq!(decoded.points.len(), 1);
    }

    #[test]
    fn test_records_without_mark_use_origin() {
        let buffer = concat(&[absolute(1.0, 1.0), delta(10, 1, 1)]);
        let decoded = TelemetryDecoder::new().decode_with_origin(&buffer, origin());
        assert_eq!(decoded.points[0].timestamp, origin());
        assert_eq!(decoded.points[1].timestamp, origin() + TimeDelta::seconds(10));
    }
}
