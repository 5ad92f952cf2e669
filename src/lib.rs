//! Streaming cross-correlation seismic event detector.
//!
//! The crate detects repeats of a known past event by correlating live
//! multi-channel waveform streams against per-channel template waveforms.
//!
//! **Pipeline**:
//! 1. `buffer` fills per-stream sample blocks (gap interpolation,
//!    saturation check, optional `filter` chain, warm-up accounting)
//! 2. `processor` slides the template over the stream and reports
//!    correlation peaks as `MatchResult`s
//! 3. `linker` fuses per-channel peaks into candidates, validates their
//!    arrival-time coherence against the pick-offset table, and emits
//!    `Association`s
//! 4. `detector` wraps it all per configured template origin and enriches
//!    emissions into `Detection`s
//!
//! Amplitude and magnitude handling is downstream work; `amplitude` and
//! `magnitude` only fix the interfaces the core hands over.
//!
//! Processing is single-threaded and cooperative: everything runs on the
//! thread that feeds the record, and emissions arrive through callbacks
//! before `feed` returns. Separate detectors own their state and may run
//! on separate threads.

pub mod amplitude;
pub mod buffer;
pub mod clock;
pub mod correlate;
pub mod detector;
pub mod filter;
pub mod linker;
pub mod magnitude;
pub mod processor;
pub mod record;
pub mod template;
pub mod tracing_init;

pub use clock::{Clock, ManualClock, SystemClock};
pub use detector::{
    BuildError, Detection, Detector, DetectorBuilder, DetectorConfig, StreamConfig,
    TemplateOrigin,
};
pub use filter::FilterSpec;
pub use linker::{Association, Linker, LinkerConfig, MergingStrategy};
pub use processor::{
    LocalMax, MatchResult, ProcessorError, Status, TemplateWaveformProcessor,
};
pub use record::{Record, TimeWindow};
pub use template::TemplateWaveform;
