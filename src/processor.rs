//! Per-channel template matching.
//!
//! A `TemplateWaveformProcessor` owns the fill state of one waveform stream
//! and correlates the stream against its template. Each successful fill
//! extends a sliding window; once the window holds at least one full
//! template length the correlation runs over every available lag and the
//! qualifying peaks are returned as a `MatchResult`.
//!
//! After a run the window advances past the scanned lags, keeping a
//! template length of overlap so the lag positions on the run boundary are
//! re-evaluated in the next run with both neighbours present.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use snafu::Snafu;
use tracing::{debug, warn};

use crate::buffer::{FillError, StreamState};
use crate::correlate::{correlate, NumericInstabilityError};
use crate::filter::{FilterError, FilterSpec};
use crate::record::{sample_interval, Record, TimeWindow};
use crate::template::TemplateWaveform;

/// Relative tolerance when comparing sampling frequencies.
const SAMPLING_FREQ_TOLERANCE: f64 = 1e-6;

/// Processing state surfaced by `feed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not enough data yet (warm-up or short window).
    WaitingForData,
    /// Correlating.
    InProgress,
    /// Closed; no more records will be processed.
    Finished,
    /// Hit a terminal error; all further records are ignored.
    Terminated,
}

#[derive(Debug, Snafu)]
pub enum ProcessorError {
    #[snafu(display(
        "record sampling frequency {got} Hz does not match template at {expected} Hz"
    ))]
    IncompatibleSamplingFreq { expected: f64, got: f64 },

    #[snafu(context(false))]
    #[snafu(display("cross-correlation failed"))]
    NumericInstability { source: NumericInstabilityError },
}

/// One qualifying correlation peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalMax {
    /// Offset of the peak from the start of the correlation window.
    pub lag: Duration,
    /// Normalised correlation coefficient in `[-1, 1]`.
    pub coefficient: f64,
}

/// Peaks of one correlation run, ordered by ascending lag.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// Correlation domain: lags lie in `[0, length)`.
    pub time_window: TimeWindow,
    pub local_maxima: Vec<LocalMax>,
}

/// Processor configuration; per-stream knobs come from the detector.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub filter: Option<FilterSpec>,
    /// Peaks at or above this enter the match result; unset means only the
    /// global maximum of each run is reported.
    pub detection_threshold: Option<f64>,
    pub gap_tolerance: Duration,
    pub gap_interpolation: bool,
    pub saturation_threshold: Option<f64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            filter: None,
            detection_threshold: None,
            gap_tolerance: Duration::zero(),
            gap_interpolation: false,
            saturation_threshold: None,
        }
    }
}

#[derive(Debug)]
pub struct TemplateWaveformProcessor {
    id: String,
    template: Arc<TemplateWaveform>,
    detection_threshold: Option<f64>,
    stream: StreamState,
    window: Vec<f64>,
    window_start: DateTime<Utc>,
    status: Status,
}

impl TemplateWaveformProcessor {
    pub fn new(
        id: impl Into<String>,
        template: Arc<TemplateWaveform>,
        config: ProcessorConfig,
    ) -> Result<Self, FilterError> {
        let filter = config
            .filter
            .map(|spec| spec.build(template.sampling_frequency()))
            .transpose()?;
        let stream = StreamState::new(
            template.sampling_frequency(),
            filter,
            config.gap_tolerance,
            config.gap_interpolation,
            config.saturation_threshold,
        );

        Ok(Self {
            id: id.into(),
            detection_threshold: config.detection_threshold,
            stream,
            window: Vec::new(),
            window_start: DateTime::<Utc>::MIN_UTC,
            status: Status::WaitingForData,
            template,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &Arc<TemplateWaveform> {
        &self.template
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Whether the stream's warm-up has been streamed through.
    pub fn initialized(&self) -> bool {
        self.stream.initialized()
    }

    /// Feed one record; returns the match result of the correlation run it
    /// completed, if any.
    ///
    /// Stream discontinuities and saturated windows are handled internally
    /// per their policy (reset respectively skip) and logged. Errors are
    /// terminal for this processor.
    pub fn feed(&mut self, record: &Record) -> Result<Option<MatchResult>, ProcessorError> {
        if matches!(self.status, Status::Finished | Status::Terminated) {
            return Ok(None);
        }
        if record.samples.is_empty() {
            return Ok(None);
        }

        let fs = self.template.sampling_frequency();
        if (record.sampling_frequency - fs).abs() > SAMPLING_FREQ_TOLERANCE * fs {
            self.status = Status::Terminated;
            return IncompatibleSamplingFreqSnafu {
                expected: fs,
                got: record.sampling_frequency,
            }
            .fail();
        }

        let filled = match self.stream.fill(record) {
            Ok(filled) => filled,
            Err(err @ FillError::Saturated { .. }) => {
                debug!(processor = %self.id, %err, "skipping saturated window");
                return Ok(None);
            }
            Err(err) => {
                warn!(processor = %self.id, %err, "stream discontinuity, resetting");
                self.reset();
                return Ok(None);
            }
        };

        let valid = &filled.samples[filled.valid_from..];
        if valid.is_empty() {
            self.status = Status::WaitingForData;
            return Ok(None);
        }

        let dt = sample_interval(fs);
        if self.window.is_empty() {
            // Warm-up can only trim a block while the window is empty.
            self.window_start = filled.start_time + dt * filled.valid_from as i32;
        }
        self.window.extend_from_slice(valid);

        let m = self.template.len();
        if self.window.len() < m {
            self.status = Status::WaitingForData;
            return Ok(None);
        }
        self.status = Status::InProgress;

        let coefficients = match correlate(&self.template, &self.window) {
            Ok(coefficients) => coefficients,
            Err(err) => {
                self.status = Status::Terminated;
                return Err(err.into());
            }
        };

        let local_maxima = self.find_local_maxima(&coefficients, dt);
        let time_window = TimeWindow::new(
            self.window_start,
            self.window_start + dt * coefficients.len() as i32,
        );

        // Advance past the scanned lags. The last two lag positions stay,
        // with the template length of samples their views need: a peak on
        // the run boundary lacks its right neighbour in this run and gets
        // re-evaluated in the next one, while every lag already checked
        // with both neighbours is dropped and cannot re-qualify.
        let keep_from = coefficients.len().saturating_sub(2);
        if keep_from > 0 {
            self.window.drain(..keep_from);
            self.window_start = self.window_start + dt * keep_from as i32;
        }

        if local_maxima.is_empty() {
            return Ok(None);
        }
        Ok(Some(MatchResult {
            time_window,
            local_maxima,
        }))
    }

    fn find_local_maxima(&self, c: &[f64], dt: Duration) -> Vec<LocalMax> {
        match self.detection_threshold {
            Some(threshold) => {
                let mut maxima = Vec::new();
                for k in 1..c.len().saturating_sub(1) {
                    if c[k] > c[k - 1] && c[k] >= c[k + 1] && c[k] >= threshold {
                        maxima.push(LocalMax {
                            lag: dt * k as i32,
                            coefficient: c[k],
                        });
                    }
                }
                maxima
            }
            None => c
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_finite())
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(k, &coefficient)| LocalMax {
                    lag: dt * k as i32,
                    coefficient,
                })
                .into_iter()
                .collect(),
        }
    }

    /// Drop all stream history and start over; the warm-up is processed
    /// again.
    pub fn reset(&mut self) {
        self.stream.reset();
        self.window.clear();
        self.status = Status::WaitingForData;
    }

    /// Close the processor; no more records will be fed.
    pub fn close(&mut self) {
        if self.status != Status::Terminated {
            self.status = Status::Finished;
        }
    }
}
