//! Template waveforms.
//!
//! A template is the recorded waveform of a known past event on one
//! channel. It is validated and preprocessed once at construction (demeaned
//! copy and L2 norm cached for the correlator) and immutable afterwards, so
//! it can be shared between the processor and the linker by `Arc`.

use chrono::{DateTime, Duration, Utc};
use snafu::{ensure, Snafu};

use crate::record::sample_interval;

/// Upper bound on usable sampling frequencies (1 sample per microsecond).
const MAX_SAMPLING_FREQUENCY: f64 = 1e6;

#[derive(Debug, Snafu)]
pub enum TemplateError {
    #[snafu(display("template has no samples"))]
    EmptyTemplate,

    #[snafu(display("sampling frequency {value} Hz outside (0, {MAX_SAMPLING_FREQUENCY}]"))]
    InvalidSamplingFrequency { value: f64 },

    #[snafu(display("pick time lies outside the template window"))]
    PickOutsideTemplate,

    #[snafu(display("template is constant; it cannot be normalised"))]
    FlatTemplate,
}

#[derive(Debug, Clone)]
pub struct TemplateWaveform {
    samples: Vec<f64>,
    demeaned: Vec<f64>,
    norm: f64,
    sampling_frequency: f64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    pick_time: DateTime<Utc>,
}

impl TemplateWaveform {
    pub fn new(
        samples: Vec<f64>,
        sampling_frequency: f64,
        start_time: DateTime<Utc>,
        pick_time: DateTime<Utc>,
    ) -> Result<Self, TemplateError> {
        ensure!(!samples.is_empty(), EmptyTemplateSnafu);
        ensure!(
            sampling_frequency > 0.0 && sampling_frequency <= MAX_SAMPLING_FREQUENCY,
            InvalidSamplingFrequencySnafu {
                value: sampling_frequency,
            }
        );

        let end_time =
            start_time + sample_interval(sampling_frequency) * samples.len() as i32;
        ensure!(
            pick_time >= start_time && pick_time <= end_time,
            PickOutsideTemplateSnafu
        );

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let demeaned: Vec<f64> = samples.iter().map(|s| s - mean).collect();
        let norm = demeaned.iter().map(|s| s * s).sum::<f64>().sqrt();
        ensure!(norm > 0.0, FlatTemplateSnafu);

        Ok(Self {
            samples,
            demeaned,
            norm,
            sampling_frequency,
            start_time,
            end_time,
            pick_time,
        })
    }

    /// Number of template samples; never zero.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Zero-mean copy of the samples.
    pub fn demeaned(&self) -> &[f64] {
        &self.demeaned
    }

    /// L2 norm of the demeaned samples.
    pub fn norm(&self) -> f64 {
        self.norm
    }

    pub fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn pick_time(&self) -> DateTime<Utc> {
        self.pick_time
    }

    /// Offset of the pick from the template start.
    pub fn pick_offset(&self) -> Duration {
        self.pick_time - self.start_time
    }
}
