//! Detector façade.
//!
//! A `Detector` owns one `TemplateWaveformProcessor` per waveform stream
//! and a single `Linker`. Records are dispatched to the matching processor;
//! match results go straight into the linker, and every emitted
//! `Association` is enriched with the template origin into a `Detection`
//! before reaching the caller's sink.
//!
//! Detectors are built through `DetectorBuilder`, which refuses invalid
//! configurations instead of producing a detector that cannot work.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use snafu::{ensure, ResultExt, Snafu};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::filter::{FilterError, FilterSpec};
use crate::linker::{
    Arrival, Association, Linker, LinkerConfig, LinkerConfigError, MergingStrategy, Pick,
    ProcessorId, TemplateResult,
};
use crate::processor::{
    ProcessorConfig, ProcessorError, Status, TemplateWaveformProcessor,
};
use crate::record::{station_id, Record};
use crate::template::{TemplateError, TemplateWaveform};

/// Separator between the detector id and the stream id in processor ids.
const PROCESSOR_ID_SEP: char = '/';

/// Hypocentre and magnitude of the template origin; copied onto every
/// detection.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateOrigin {
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub magnitude: Option<f64>,
}

/// A declared repeat of the template event.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Template origin time shifted by the mean observed pick delay.
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    /// Template magnitude, if known; refinement happens downstream.
    pub magnitude: Option<f64>,
    /// Association score.
    pub fit: f64,
    pub num_channels_associated: usize,
    pub num_channels_used: usize,
    pub num_stations_associated: usize,
    pub num_stations_used: usize,
    pub template_results: BTreeMap<ProcessorId, TemplateResult>,
}

/// Detector-wide configuration; stream-specific knobs live in
/// `StreamConfig`.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub gap_tolerance: Duration,
    pub gap_interpolation: bool,
    pub saturation_threshold: Option<f64>,
    pub on_hold: Duration,
    pub arrival_offset_threshold: Option<Duration>,
    pub association_threshold: Option<f64>,
    pub min_arrivals: Option<usize>,
    pub merging_strategy: MergingStrategy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            gap_tolerance: Duration::zero(),
            gap_interpolation: false,
            saturation_threshold: None,
            on_hold: Duration::zero(),
            arrival_offset_threshold: Some(crate::linker::arrival_offset_floor()),
            association_threshold: None,
            min_arrivals: None,
            merging_strategy: MergingStrategy::default(),
        }
    }
}

/// Template definition of one waveform stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Waveform stream identifier (NET.STA.LOC.CHA).
    pub stream_id: String,
    pub template_samples: Vec<f64>,
    pub sampling_frequency: f64,
    pub template_start: DateTime<Utc>,
    pub template_pick: DateTime<Utc>,
    pub phase_hint: Option<String>,
    /// Catalogue id of the template pick, carried for provenance.
    pub pick_id: Option<String>,
    pub weight: Option<f64>,
    pub filter: Option<FilterSpec>,
    pub detection_threshold: Option<f64>,
    pub merging_threshold: Option<f64>,
}

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("detector needs at least one stream"))]
    NoStreams,

    #[snafu(display("stream {stream_id} configured twice"))]
    DuplicateStream { stream_id: String },

    #[snafu(display("association threshold {value} outside [-1, 1]"))]
    AssociationThresholdOutOfRange { value: f64 },

    #[snafu(display("min arrivals {n} outside [1, {streams}]"))]
    MinArrivalsOutOfRange { n: usize, streams: usize },

    #[snafu(display("invalid template for stream {stream_id}"))]
    InvalidTemplate {
        stream_id: String,
        source: TemplateError,
    },

    #[snafu(display("invalid filter for stream {stream_id}"))]
    InvalidFilter {
        stream_id: String,
        source: FilterError,
    },

    #[snafu(context(false))]
    #[snafu(display("linker configuration rejected"))]
    InvalidLinkerConfig { source: LinkerConfigError },
}

#[derive(Debug)]
struct StreamMeta {
    stream_id: String,
    template_pick: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Detector {
    id: String,
    origin: TemplateOrigin,
    /// Keyed by waveform stream id.
    processors: BTreeMap<String, TemplateWaveformProcessor>,
    stream_meta: BTreeMap<ProcessorId, StreamMeta>,
    linker: Linker,
}

impl Detector {
    pub fn builder(id: impl Into<String>, origin: TemplateOrigin) -> DetectorBuilder {
        DetectorBuilder {
            id: id.into(),
            origin,
            config: DetectorConfig::default(),
            clock: Arc::new(SystemClock),
            streams: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn origin(&self) -> &TemplateOrigin {
        &self.origin
    }

    pub fn processor_count(&self) -> usize {
        self.linker.processor_count()
    }

    pub fn channel_count(&self) -> usize {
        self.linker.channel_count()
    }

    /// Feed one record; detections completed by it reach `on_detection`
    /// before the call returns.
    ///
    /// Returns the fed processor's status. A terminal processor error is
    /// returned after the processor has been deregistered from the linker;
    /// the remaining streams keep working.
    pub fn feed<F: FnMut(Detection)>(
        &mut self,
        record: &Record,
        mut on_detection: F,
    ) -> Result<Status, ProcessorError> {
        let Some(processor) = self.processors.get_mut(&record.channel_id) else {
            debug!(channel = %record.channel_id, "no processor for channel");
            return Ok(Status::WaitingForData);
        };

        match processor.feed(record) {
            Ok(Some(match_result)) => {
                let processor_id = processor.id().to_string();
                let status = processor.status();

                let origin = &self.origin;
                let meta = &self.stream_meta;
                self.linker.feed(&processor_id, match_result, |association| {
                    on_detection(build_detection(origin, meta, association));
                });

                Ok(status)
            }
            Ok(None) => Ok(processor.status()),
            Err(err) => {
                let processor_id = processor.id().to_string();
                self.linker.remove(&processor_id);
                Err(err)
            }
        }
    }

    /// Emit everything the linker holds that satisfies the arrival and
    /// score requirements. Idempotent.
    pub fn flush<F: FnMut(Detection)>(&mut self, mut on_detection: F) {
        let origin = &self.origin;
        let meta = &self.stream_meta;
        self.linker.flush(|association| {
            on_detection(build_detection(origin, meta, association));
        });
    }

    /// Flush and close every processor; no more records will be processed.
    pub fn finalize<F: FnMut(Detection)>(&mut self, on_detection: F) {
        self.flush(on_detection);
        for processor in self.processors.values_mut() {
            processor.close();
        }
    }

    /// Drop all pending candidates and stream history.
    pub fn reset(&mut self) {
        self.linker.reset();
        for processor in self.processors.values_mut() {
            processor.reset();
        }
    }
}

fn build_detection(
    origin: &TemplateOrigin,
    meta: &BTreeMap<ProcessorId, StreamMeta>,
    association: Association,
) -> Detection {
    // Mean delay of the observed picks against their template picks
    // projects the template origin time onto the new event.
    let mut shift_nanos: i64 = 0;
    let mut contributing: i64 = 0;
    for (processor_id, result) in &association.results {
        if let Some(stream) = meta.get(processor_id) {
            let shift = result.arrival.pick.time - stream.template_pick;
            shift_nanos += shift.num_nanoseconds().unwrap_or(0);
            contributing += 1;
        }
    }
    let mean_shift = Duration::nanoseconds(shift_nanos / contributing.max(1));

    let channels_associated: BTreeSet<&str> = association
        .results
        .values()
        .map(|r| r.arrival.pick.waveform_stream_id.as_str())
        .collect();
    let stations_associated: BTreeSet<&str> = channels_associated
        .iter()
        .map(|id| station_id(id))
        .collect();
    let channels_used: BTreeSet<&str> =
        meta.values().map(|m| m.stream_id.as_str()).collect();
    let stations_used: BTreeSet<&str> =
        channels_used.iter().map(|id| station_id(id)).collect();

    Detection {
        time: origin.time + mean_shift,
        latitude: origin.latitude,
        longitude: origin.longitude,
        depth_km: origin.depth_km,
        magnitude: origin.magnitude,
        fit: association.score,
        num_channels_associated: channels_associated.len(),
        num_channels_used: channels_used.len(),
        num_stations_associated: stations_associated.len(),
        num_stations_used: stations_used.len(),
        template_results: association.results,
    }
}

pub struct DetectorBuilder {
    id: String,
    origin: TemplateOrigin,
    config: DetectorConfig,
    clock: Arc<dyn Clock>,
    streams: Vec<StreamConfig>,
}

impl DetectorBuilder {
    pub fn config(mut self, config: DetectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the wall clock, typically with a manual clock in tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn build(self) -> Result<Detector, BuildError> {
        ensure!(!self.streams.is_empty(), NoStreamsSnafu);

        if let Some(value) = self.config.association_threshold {
            ensure!(
                (-1.0..=1.0).contains(&value),
                AssociationThresholdOutOfRangeSnafu { value }
            );
        }
        if let Some(n) = self.config.min_arrivals {
            ensure!(
                n >= 1 && n <= self.streams.len(),
                MinArrivalsOutOfRangeSnafu {
                    n,
                    streams: self.streams.len(),
                }
            );
        }

        let mut linker = Linker::new(
            LinkerConfig {
                on_hold: self.config.on_hold,
                arrival_offset_threshold: self.config.arrival_offset_threshold,
                association_threshold: self.config.association_threshold,
                min_arrivals: self.config.min_arrivals,
                merging_strategy: self.config.merging_strategy,
            },
            self.clock,
        )?;

        let mut processors = BTreeMap::new();
        let mut stream_meta = BTreeMap::new();

        for stream in self.streams {
            ensure!(
                !processors.contains_key(&stream.stream_id),
                DuplicateStreamSnafu {
                    stream_id: stream.stream_id,
                }
            );

            let template = Arc::new(
                TemplateWaveform::new(
                    stream.template_samples,
                    stream.sampling_frequency,
                    stream.template_start,
                    stream.template_pick,
                )
                .context(InvalidTemplateSnafu {
                    stream_id: stream.stream_id.clone(),
                })?,
            );

            let processor_id = format!("{}{}{}", self.id, PROCESSOR_ID_SEP, stream.stream_id);
            let processor = TemplateWaveformProcessor::new(
                processor_id.clone(),
                Arc::clone(&template),
                ProcessorConfig {
                    filter: stream.filter,
                    detection_threshold: stream.detection_threshold,
                    gap_tolerance: self.config.gap_tolerance,
                    gap_interpolation: self.config.gap_interpolation,
                    saturation_threshold: self.config.saturation_threshold,
                },
            )
            .context(InvalidFilterSnafu {
                stream_id: stream.stream_id.clone(),
            })?;

            let arrival = Arrival {
                pick: Pick {
                    time: stream.template_pick,
                    waveform_stream_id: stream.stream_id.clone(),
                    phase_hint: stream.phase_hint,
                    public_id: stream.pick_id,
                },
                weight: stream.weight,
            };

            linker.add(
                processor_id.clone(),
                template,
                arrival,
                stream.merging_threshold,
            );
            stream_meta.insert(
                processor_id,
                StreamMeta {
                    stream_id: stream.stream_id.clone(),
                    template_pick: stream.template_pick,
                },
            );
            processors.insert(stream.stream_id, processor);
        }

        Ok(Detector {
            id: self.id,
            origin: self.origin,
            processors,
            stream_meta,
            linker,
        })
    }
}
