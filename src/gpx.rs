//! GPX 1.1 export of decoded sessions.
//!
//! Only points with a GPS fix are written. Heart rate goes into the Garmin
//! `TrackPointExtension/v1` element that most tools understand.

use chrono::SecondsFormat;
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Writer,
};
use std::io;

use crate::{
    error::Result,
    types::{ActivitySummary, TrackPoint},
};

const GPX_NAMESPACE: &str = "http://www.topografix.com/GPX/1/1";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const TPX_NAMESPACE: &str = "http://www.garmin.com/xmlschemas/TrackPointExtension/v1";
const SCHEMA_LOCATION: &str = "http://www.topografix.com/GPX/1/1 \
    http://www.topografix.com/GPX/1/1/gpx.xsd \
    http://www.garmin.com/xmlschemas/TrackPointExtension/v1 \
    http://www.garmin.com/xmlschemas/TrackPointExtensionv1.xsd";

/// Serializes trackpoints into a single-track GPX document
#[derive(Debug, Clone)]
pub struct ExchangeExporter {
    creator: String,
    track_name: String,
}

impl Default for ExchangeExporter {
    fn default() -> Self {
        Self {
            creator: "bipfetch".to_string(),
            track_name: "Amazfit Bip activity".to_string(),
        }
    }
}

impl ExchangeExporter {
    /// Create an exporter with the default creator and track name
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `creator` attribute
    #[must_use]
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    /// Set the track `<name>`
    #[must_use]
    pub fn with_track_name(mut self, name: impl Into<String>) -> Self {
        self.track_name = name.into();
        self
    }

    /// Render a summary's trackpoints
    #[must_use]
    pub fn export(&self, summary: &ActivitySummary) -> String {
        self.export_points(&summary.points)
    }

    /// Render trackpoints; points without a valid fix are skipped
    #[must_use]
    pub fn export_points(&self, points: &[TrackPoint]) -> String {
        let buffer = Vec::with_capacity(512 + points.len() * 96);
        let mut writer = Writer::new_with_indent(buffer, b' ', 2);

        // writing into a Vec cannot fail
        let _ = self.render(&mut writer, points);
        String::from_utf8_lossy(&writer.into_inner()).into_owned()
    }

    /// Write the document to any [`io::Write`]
    ///
    /// # Errors
    ///
    /// Returns [`crate::BipError::Io`] if the writer fails.
    pub fn write_to<W: io::Write>(&self, summary: &ActivitySummary, mut writer: W) -> Result<()> {
        writer.write_all(self.export(summary).as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn render<W: io::Write>(&self, writer: &mut Writer<W>, points: &[TrackPoint]) -> Result<()> {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("gpx").with_attributes([
            ("version", "1.1"),
            ("creator", self.creator.as_str()),
            ("xmlns", GPX_NAMESPACE),
            ("xmlns:xsi", XSI_NAMESPACE),
            ("xmlns:gpxtpx", TPX_NAMESPACE),
            ("xsi:schemaLocation", SCHEMA_LOCATION),
        ])))?;
        writer.write_event(Event::Start(BytesStart::new("trk")))?;
        writer
            .create_element("name")
            .write_text_content(BytesText::new(&self.track_name))?;
        writer.write_event(Event::Start(BytesStart::new("trkseg")))?;

        for point in points.iter().filter(|p| p.has_valid_coordinates()) {
            let lat = format!("{:.6}", point.latitude);
            let lon = format!("{:.6}", point.longitude);
            let trkpt = BytesStart::new("trkpt")
                .with_attributes([("lat", lat.as_str()), ("lon", lon.as_str())]);
            writer.write_event(Event::Start(trkpt))?;
            let time = point.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
            writer
                .create_element("time")
                .write_text_content(BytesText::new(&time))?;
            if let Some(hr) = point.heart_rate {
                writer.write_event(Event::Start(BytesStart::new("extensions")))?;
                writer.write_event(Event::Start(BytesStart::new("gpxtpx:TrackPointExtension")))?;
                writer
                    .create_element("gpxtpx:hr")
                    .write_text_content(BytesText::new(&hr.to_string()))?;
                writer.write_event(Event::End(BytesEnd::new("gpxtpx:TrackPointExtension")))?;
                writer.write_event(Event::End(BytesEnd::new("extensions")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("trkpt")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("trkseg")))?;
        writer.write_event(Event::End(BytesEnd::new("trk")))?;
        writer.write_event(Event::End(BytesEnd::new("gpx")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FetchOutcome, PointKind};
    use chrono::{DateTime, Utc};
    use std::io::Cursor;

    fn point(lat: f64, lon: f64, secs: i64, hr: Option<u8>, kind: PointKind) -> TrackPoint {
        TrackPoint {
            latitude: lat,
            longitude: lon,
            timestamp: DateTime::from_timestamp(1_714_550_400 + secs, 0).unwrap(),
            heart_rate: hr,
            kind,
        }
    }

    fn summary() -> ActivitySummary {
        let mut summary = ActivitySummary::empty(Utc::now(), FetchOutcome::Completed);
        summary.is_real_data = true;
        summary.points = vec![
            point(40.416_8, -3.703_8, 0, Some(121), PointKind::Position),
            point(40.417_0, -3.703_5, 5, None, PointKind::Position),
            point(40.417_0, -3.703_5, 30, Some(150), PointKind::HeartRateOnly),
        ];
        summary
    }

    #[test]
    fn test_export_track_points() {
        let gpx = ExchangeExporter::new().export(&summary());

        assert!(gpx.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(gpx.contains(r#"<gpx version="1.1" creator="bipfetch""#));
        assert_eq!(gpx.matches("<trk>").count(), 1);
        assert_eq!(gpx.matches("<trkseg>").count(), 1);
        assert_eq!(gpx.matches("<trkpt ").count(), 2);
        assert!(gpx.contains(r#"<trkpt lat="40.416800" lon="-3.703800">"#));
        assert!(gpx.contains("<time>2024-05-01T08:00:00.000Z</time>"));
        assert!(gpx.contains("<gpxtpx:hr>121</gpxtpx:hr>"));
        // heart-rate-only samples stay out of the track
        assert!(!gpx.contains("<gpxtpx:hr>150</gpxtpx:hr>"));
        assert_eq!(gpx.matches("<extensions>").count(), 1);
        assert!(gpx.ends_with("</gpx>"));
    }

    #[test]
    fn test_export_reads_back_as_gpx() {
        let gpx = ExchangeExporter::new()
            .with_track_name("Morning run")
            .export(&summary());
        let parsed = gpx::read(Cursor::new(gpx.as_bytes())).unwrap();

        assert_eq!(parsed.version, gpx::GpxVersion::Gpx11);
        assert_eq!(parsed.creator.as_deref(), Some("bipfetch"));
        assert_eq!(parsed.tracks.len(), 1);
        assert_eq!(parsed.tracks[0].name.as_deref(), Some("Morning run"));

        let points = &parsed.tracks[0].segments[0].points;
        assert_eq!(points.len(), 2);
        assert!((points[0].point().y() - 40.416_8).abs() < 1e-6);
        assert!((points[0].point().x() + 3.703_8).abs() < 1e-6);
        assert!(points[1].time.is_some());
    }

    #[test]
    fn test_export_is_idempotent() {
        let exporter = ExchangeExporter::new();
        let summary = summary();
        assert_eq!(exporter.export(&summary), exporter.export(&summary));
    }

    #[test]
    fn test_export_empty_summary() {
        let summary = ActivitySummary::empty(Utc::now(), FetchOutcome::NothingToFetch);
        let gpx = ExchangeExporter::new().export(&summary);
        assert_eq!(gpx.matches("<trkseg>").count(), 1);
        assert!(!gpx.contains("<trkpt"));

        let parsed = gpx::read(Cursor::new(gpx.as_bytes())).unwrap();
        assert!(parsed.tracks[0]
            .segments
            .iter()
            .all(|segment| segment.points.is_empty()));
    }

    #[test]
    fn test_names_are_escaped() {
        let gpx = ExchangeExporter::new()
            .with_creator("a\"b")
            .with_track_name("Run <5k> & more")
            .export_points(&[]);
        assert!(gpx.contains(r#"creator="a&quot;b""#));
        assert!(gpx.contains("<name>Run &lt;5k&gt; &amp; more</name>"));
    }

    #[test]
    fn test_write_to_writer() {
        let summary = summary();
        let mut out = Vec::new();
        ExchangeExporter::new().write_to(&summary, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            ExchangeExporter::new().export(&summary)
        );
    }
}
