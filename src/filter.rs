//! Causal IIR filtering applied while records are filled.
//!
//! Filters are second-order sections (biquads) derived from the standard
//! audio-cookbook formulas with Butterworth Q. A `FilterSpec` is a plain
//! value handed to the processor at construction; building it against the
//! stream's sampling frequency yields a stateful `FilterChain`.
//!
//! A freshly built chain needs warm-up before its output is trustworthy;
//! `init_duration` reports how much. Consumers suppress detection until the
//! warm-up has been streamed through.

use chrono::Duration;
use snafu::{ensure, Snafu};

use crate::record::duration_from_secs;

/// Number of corner periods a chain needs before its transient has decayed.
const INIT_CORNER_PERIODS: f64 = 3.0;

#[derive(Debug, Snafu, PartialEq)]
pub enum FilterError {
    #[snafu(display("filter corner {corner_hz} Hz must be positive"))]
    NonPositiveCorner { corner_hz: f64 },

    #[snafu(display(
        "filter corner {corner_hz} Hz at or above Nyquist ({nyquist_hz} Hz)"
    ))]
    CornerAboveNyquist { corner_hz: f64, nyquist_hz: f64 },

    #[snafu(display("band corners inverted: low {low_hz} Hz >= high {high_hz} Hz"))]
    InvertedBand { low_hz: f64, high_hz: f64 },
}

/// Declarative filter description, resolved against a sampling frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterSpec {
    LowPass { corner_hz: f64 },
    HighPass { corner_hz: f64 },
    BandPass { low_hz: f64, high_hz: f64 },
}

impl FilterSpec {
    /// Build the stateful chain for a stream sampled at `sampling_frequency`.
    pub fn build(&self, sampling_frequency: f64) -> Result<FilterChain, FilterError> {
        let nyquist = sampling_frequency / 2.0;
        let check = |corner_hz: f64| -> Result<(), FilterError> {
            ensure!(corner_hz > 0.0, NonPositiveCornerSnafu { corner_hz });
            ensure!(
                corner_hz < nyquist,
                CornerAboveNyquistSnafu {
                    corner_hz,
                    nyquist_hz: nyquist,
                }
            );
            Ok(())
        };

        let (stages, lowest_corner) = match *self {
            FilterSpec::LowPass { corner_hz } => {
                check(corner_hz)?;
                (
                    vec![Biquad::low_pass(corner_hz, sampling_frequency)],
                    corner_hz,
                )
            }
            FilterSpec::HighPass { corner_hz } => {
                check(corner_hz)?;
                (
                    vec![Biquad::high_pass(corner_hz, sampling_frequency)],
                    corner_hz,
                )
            }
            FilterSpec::BandPass { low_hz, high_hz } => {
                check(low_hz)?;
                check(high_hz)?;
                ensure!(low_hz < high_hz, InvertedBandSnafu { low_hz, high_hz });
                (
                    vec![
                        Biquad::high_pass(low_hz, sampling_frequency),
                        Biquad::low_pass(high_hz, sampling_frequency),
                    ],
                    low_hz,
                )
            }
        };

        Ok(FilterChain {
            stages,
            init_duration: duration_from_secs(INIT_CORNER_PERIODS / lowest_corner),
        })
    }
}

/// Direct-form-I second-order section with normalised coefficients.
#[derive(Debug, Clone)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x: [f64; 2],
    y: [f64; 2],
}

impl Biquad {
    /// Butterworth Q for maximally flat single sections.
    const Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

    fn from_raw(b: [f64; 3], a: [f64; 3]) -> Self {
        Self {
            b0: b[0] / a[0],
            b1: b[1] / a[0],
            b2: b[2] / a[0],
            a1: a[1] / a[0],
            a2: a[2] / a[0],
            x: [0.0; 2],
            y: [0.0; 2],
        }
    }

    fn low_pass(corner_hz: f64, fs: f64) -> Self {
        let omega = 2.0 * std::f64::consts::PI * corner_hz / fs;
        let alpha = omega.sin() / (2.0 * Self::Q);
        let cos = omega.cos();
        Self::from_raw(
            [(1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    fn high_pass(corner_hz: f64, fs: f64) -> Self {
        let omega = 2.0 * std::f64::consts::PI * corner_hz / fs;
        let alpha = omega.sin() / (2.0 * Self::Q);
        let cos = omega.cos();
        Self::from_raw(
            [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    fn process(&mut self, input: f64) -> f64 {
        let output = self.b0 * input + self.b1 * self.x[0] + self.b2 * self.x[1]
            - self.a1 * self.y[0]
            - self.a2 * self.y[1];

        self.x[1] = self.x[0];
        self.x[0] = input;
        self.y[1] = self.y[0];
        self.y[0] = output;

        output
    }

    fn reset(&mut self) {
        self.x = [0.0; 2];
        self.y = [0.0; 2];
    }
}

/// Stateful cascade applied in place to each filled block.
#[derive(Debug, Clone)]
pub struct FilterChain {
    stages: Vec<Biquad>,
    init_duration: Duration,
}

impl FilterChain {
    /// Warm-up the chain needs before its output settles.
    pub fn init_duration(&self) -> Duration {
        self.init_duration
    }

    pub fn apply(&mut self, data: &mut [f64]) {
        for stage in &mut self.stages {
            for sample in data.iter_mut() {
                *sample = stage.process(*sample);
            }
        }
    }

    /// Drop all filter memory; the warm-up starts over.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }
}
