//! Waveform records and time primitives.
//!
//! A `Record` is one contiguous chunk of samples on a single waveform stream.
//! Stream identifiers follow the NET.STA.LOC.CHA convention; the station id
//! is the NET.STA prefix.

use chrono::{DateTime, Duration, Utc};

/// Half-open absolute time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.start && time < self.end
    }
}

/// One contiguous chunk of equally spaced samples on a waveform stream.
///
/// Records on a stream must be non-overlapping and delivered in ascending
/// start-time order; gap handling is the consumer's concern.
#[derive(Debug, Clone)]
pub struct Record {
    /// Waveform stream identifier (NET.STA.LOC.CHA).
    pub channel_id: String,
    /// Absolute time of the first sample.
    pub start_time: DateTime<Utc>,
    /// Sampling frequency in Hz.
    pub sampling_frequency: f64,
    /// Sample values.
    pub samples: Vec<f64>,
}

impl Record {
    /// Time one sample interval past the last sample.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + sample_interval(self.sampling_frequency) * self.samples.len() as i32
    }

    pub fn time_window(&self) -> TimeWindow {
        TimeWindow::new(self.start_time, self.end_time())
    }
}

/// NET.STA prefix of a waveform stream id; the full id if it has fewer parts.
pub fn station_id(stream_id: &str) -> &str {
    let mut dots = stream_id.match_indices('.');
    match dots.nth(1) {
        Some((idx, _)) => &stream_id[..idx],
        None => stream_id,
    }
}

/// Spacing between consecutive samples at `sampling_frequency` Hz.
pub fn sample_interval(sampling_frequency: f64) -> Duration {
    Duration::nanoseconds((1e9 / sampling_frequency).round() as i64)
}

/// Convert fractional seconds to a `Duration`, rounded to nanoseconds.
pub fn duration_from_secs(secs: f64) -> Duration {
    Duration::nanoseconds((secs * 1e9).round() as i64)
}

/// Fractional seconds of a `Duration`.
pub fn duration_to_secs(duration: Duration) -> f64 {
    duration
        .num_nanoseconds()
        .map_or(f64::INFINITY, |nanos| nanos as f64 * 1e-9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn record_end_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = Record {
            channel_id: "CH.SULZ..HHZ".into(),
            start_time: start,
            sampling_frequency: 100.0,
            samples: vec![0.0; 200],
        };

        assert_eq!(record.end_time(), start + Duration::seconds(2));
        assert_eq!(record.time_window().length(), Duration::seconds(2));
    }

    #[test]
    fn station_id_prefix() {
        assert_eq!(station_id("CH.SULZ..HHZ"), "CH.SULZ");
        assert_eq!(station_id("CH.SULZ.01.HHZ"), "CH.SULZ");
        assert_eq!(station_id("CH"), "CH");
    }

    #[test]
    fn sample_interval_is_exact_for_common_rates() {
        assert_eq!(sample_interval(100.0), Duration::milliseconds(10));
        assert_eq!(sample_interval(1.0), Duration::seconds(1));
    }

    #[test]
    fn duration_roundtrip() {
        let d = duration_from_secs(2.5e-6);
        assert_eq!(d, Duration::nanoseconds(2500));
        assert!((duration_to_secs(d) - 2.5e-6).abs() < 1e-15);
    }
}
