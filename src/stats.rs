//! Session statistics derived from decoded telemetry.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::{
    decoder::DecodedActivity,
    types::{ActivitySummary, FetchOutcome},
};

/// Calories per kilometre
///
/// A flat, distance-only approximation. It ignores body weight and effort.
pub const CALORIES_PER_KM: f64 = 60.0;

/// Shown instead of a duration when there are no fixes
pub const DURATION_PLACEHOLDER: &str = "--:--:--";

/// Heart-rate readings of 0 and 255 mean "no reading"
#[must_use]
pub const fn is_valid_heart_rate(bpm: u8) -> bool {
    bpm >= 1 && bpm <= 254
}

/// Format a duration as `HH:MM:SS`, or the placeholder
#[must_use]
pub fn format_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(duration) => {
            let secs = duration.as_secs();
            format!(
                "{:02}:{:02}:{:02}",
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60
            )
        }
        None => DURATION_PLACEHOLDER.to_string(),
    }
}

/// Mean of the valid heart-rate readings
#[must_use]
pub fn average_heart_rate(samples: &[u8]) -> Option<f64> {
    let (sum, count) = samples
        .iter()
        .filter(|&&bpm| is_valid_heart_rate(bpm))
        .fold((0_u64, 0_u64), |(sum, count), &bpm| {
            (sum + u64::from(bpm), count + 1)
        });
    (count > 0).then(|| sum as f64 / count as f64)
}

/// Calorie estimate for a distance
#[must_use]
pub fn calorie_estimate(distance_km: f64) -> u32 {
    let calories = (distance_km * CALORIES_PER_KM).floor();
    if calories.is_finite() && calories > 0.0 {
        calories.min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

/// Builds [`ActivitySummary`] values from decoder output
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsAggregator;

impl StatsAggregator {
    /// Create an aggregator
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Summarize one decoded session
    ///
    /// Estimate-only decodes produce a summary without calories or heart rate.
    #[must_use]
    pub fn summarize(
        &self,
        decoded: DecodedActivity,
        sync_timestamp: DateTime<Utc>,
        bytes_received: usize,
        outcome: FetchOutcome,
    ) -> ActivitySummary {
        let calorie_estimate = decoded
            .is_real_data
            .then(|| calorie_estimate(decoded.distance_km));

        ActivitySummary {
            distance_km: decoded.distance_km,
            duration: decoded.duration,
            calorie_estimate,
            avg_heart_rate: average_heart_rate(&decoded.heart_rate_samples),
            points: decoded.points,
            sync_timestamp,
            is_real_data: decoded.is_real_data,
            bytes_received,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{test_records::*, TelemetryDecoder};

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(None), "--:--:--");
        assert_eq!(format_duration(Some(Duration::ZERO)), "00:00:00");
        assert_eq!(format_duration(Some(Duration::from_secs(3_725))), "01:02:05");
        assert_eq!(
            format_duration(Some(Duration::from_millis(59_999))),
            "00:00:59"
        );
    }

    #[test]
    fn test_average_heart_rate_ignores_invalid_samples() {
        assert_eq!(average_heart_rate(&[]), None);
        assert_eq!(average_heart_rate(&[0, 255, 0]), None);
        assert_eq!(average_heart_rate(&[120, 0, 130, 255]), Some(125.0));
        assert_eq!(average_heart_rate(&[1, 254]), Some(127.5));
    }

    #[test]
    fn test_calorie_estimate_floors() {
        assert_eq!(calorie_estimate(0.0), 0);
        assert_eq!(calorie_estimate(2.5), 150);
        assert_eq!(calorie_estimate(0.99), 59);
        assert_eq!(calorie_estimate(f64::NAN), 0);
    }

    #[test]
    fn test_summarize_real_session() {
        let buffer = [
            timestamp(1_714_550_400_000),
            absolute(40.0, -3.0),
            heart_rate(0, 120),
            delta(60, 3_000, 3_000),
            heart_rate(0, 140),
            delta(3_540, 3_000, 3_000),
        ]
        .concat();
        let decoded = TelemetryDecoder::new().decode(&buffer);
        let distance = decoded.distance_km;
        let synced = Utc::now();

        let summary =
            StatsAggregator::new().summarize(decoded, synced, 512, FetchOutcome::Completed);
        assert!(summary.is_real_data);
        assert_eq!(summary.distance_km, distance);
        assert_eq!(summary.calorie_estimate, Some(calorie_estimate(distance)));
        assert_eq!(summary.avg_heart_rate, Some(130.0));
        assert_eq!(summary.duration_hms(), "01:00:00");
        assert_eq!(summary.position_points().count(), 3);
        assert_eq!(summary.bytes_received, 512);
        assert_eq!(summary.sync_timestamp, synced);
    }

    #[test]
    fn test_summarize_estimate_only() {
        let decoded = TelemetryDecoder::new().decode(&[0xA5; 32]);
        let summary =
            StatsAggregator::new().summarize(decoded, Utc::now(), 33, FetchOutcome::Drained);
        assert!(!summary.is_real_data);
        assert!(summary.points.is_empty());
        assert_eq!(summary.distance_km, 0.0);
        assert_eq!(summary.calorie_estimate, None);
        assert_eq!(summary.avg_heart_rate, None);
        assert_eq!(summary.duration_hms(), DURATION_PLACEHOLDER);
    }
}
