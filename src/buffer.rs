//! Per-stream fill state: contiguity, gap interpolation, saturation and
//! warm-up accounting.
//!
//! Records on one stream must arrive in ascending start-time order without
//! overlaps. A gap is any jump larger than half a sample interval; gaps
//! within the configured tolerance are bridged by linear interpolation
//! between the last stored sample and the first sample of the new record.
//! Anything larger is reported so the owner can reset the stream.
//!
//! Filtering happens here, while the block is filled, so the filter state
//! stays aligned with the sample cursor. Samples streamed during filter
//! warm-up are counted but flagged invalid via `Filled::valid_from`.

use chrono::{DateTime, Duration, Utc};
use snafu::Snafu;

use crate::filter::FilterChain;
use crate::record::{duration_to_secs, sample_interval, Record};

#[derive(Debug, Snafu)]
pub enum FillError {
    #[snafu(display(
        "gap of {} s exceeds tolerance of {} s",
        duration_to_secs(*gap),
        duration_to_secs(*tolerance)
    ))]
    GapTooLarge { gap: Duration, tolerance: Duration },

    #[snafu(display("record overlaps stream by {} s", duration_to_secs(*overlap)))]
    Overlapping { overlap: Duration },

    #[snafu(display("sample {value} at or above saturation threshold {threshold}"))]
    Saturated { value: f64, threshold: f64 },
}

/// One filled block, ready for correlation.
#[derive(Debug)]
pub struct Filled {
    /// Interpolated prefix (if any) followed by the record's samples, with
    /// the filter applied.
    pub samples: Vec<f64>,
    /// Absolute time of `samples[0]`.
    pub start_time: DateTime<Utc>,
    /// First index past the warm-up; everything before it is settling
    /// filter output and must not be used for detection.
    pub valid_from: usize,
}

/// Fill state of one waveform stream.
#[derive(Debug)]
pub struct StreamState {
    sampling_frequency: f64,
    filter: Option<FilterChain>,
    gap_tolerance: Duration,
    gap_interpolation: bool,
    saturation_threshold: Option<f64>,
    needed_samples: usize,
    received_samples: usize,
    last_end: Option<DateTime<Utc>>,
    last_sample: f64,
}

impl StreamState {
    pub fn new(
        sampling_frequency: f64,
        filter: Option<FilterChain>,
        gap_tolerance: Duration,
        gap_interpolation: bool,
        saturation_threshold: Option<f64>,
    ) -> Self {
        let needed_samples = filter
            .as_ref()
            .map(|f| (duration_to_secs(f.init_duration()) * sampling_frequency).ceil() as usize)
            .unwrap_or(0);

        Self {
            sampling_frequency,
            filter,
            gap_tolerance,
            gap_interpolation,
            saturation_threshold,
            needed_samples,
            received_samples: 0,
            last_end: None,
            last_sample: 0.0,
        }
    }

    /// Whether the warm-up has been streamed through.
    pub fn initialized(&self) -> bool {
        self.received_samples >= self.needed_samples
    }

    /// Accept `record` into the stream and return the filled block.
    ///
    /// Errors leave the fill state untouched; the caller decides whether to
    /// skip the record (`Saturated`) or reset the stream (`GapTooLarge`,
    /// `Overlapping`).
    pub fn fill(&mut self, record: &Record) -> Result<Filled, FillError> {
        if record.samples.is_empty() {
            return Ok(Filled {
                samples: Vec::new(),
                start_time: record.start_time,
                valid_from: 0,
            });
        }

        if let Some(threshold) = self.saturation_threshold {
            if let Some(&value) = record.samples.iter().find(|v| v.abs() >= threshold) {
                return SaturatedSnafu { value, threshold }.fail();
            }
        }

        let dt = sample_interval(self.sampling_frequency);
        let mut samples = Vec::with_capacity(record.samples.len());
        let mut start_time = record.start_time;

        if let Some(last_end) = self.last_end {
            let delta = record.start_time - last_end;
            if delta > dt / 2 {
                if !self.gap_interpolation || delta > self.gap_tolerance {
                    return GapTooLargeSnafu {
                        gap: delta,
                        tolerance: self.gap_tolerance,
                    }
                    .fail();
                }

                // The slot at `last_end` is the first missing one, so the
                // gap spans `delta / dt` sample slots.
                let missing =
                    (duration_to_secs(delta) * self.sampling_frequency).round() as usize;
                let first = record.samples[0];
                for k in 1..=missing {
                    let frac = k as f64 / (missing + 1) as f64;
                    samples.push(self.last_sample + (first - self.last_sample) * frac);
                }
                start_time = last_end;
            } else if delta < -(dt / 2) {
                return OverlappingSnafu { overlap: -delta }.fail();
            }
        }

        samples.extend_from_slice(&record.samples);
        if let Some(filter) = &mut self.filter {
            filter.apply(&mut samples);
        }

        let missing_for_init = self.needed_samples.saturating_sub(self.received_samples);
        let valid_from = missing_for_init.min(samples.len());

        self.received_samples += samples.len();
        self.last_end = Some(record.end_time());
        self.last_sample = *record.samples.last().unwrap();

        Ok(Filled {
            samples,
            start_time,
            valid_from,
        })
    }

    /// Drop all stream history; warm-up starts over.
    pub fn reset(&mut self) {
        self.last_end = None;
        self.last_sample = 0.0;
        self.received_samples = 0;
        if let Some(filter) = &mut self.filter {
            filter.reset();
        }
    }
}
