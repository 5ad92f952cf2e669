//! Amplitude interfaces.
//!
//! Amplitude measurement itself happens downstream with access to the raw
//! waveforms; the core only fixes the vocabulary: the `Amplitude` value
//! type, the processor trait, a combining container that reduces several
//! per-stream amplitudes to one, and the provenance comments a detection
//! contributes.

use snafu::Snafu;

use crate::detector::Detection;
use crate::record::TimeWindow;

/// Comment id under which the owning detector's id is recorded.
pub const DETECTOR_ID_COMMENT_ID: &str = "detectorId";

/// Comment id under which the contributing template pick ids are recorded.
pub const PICKS_COMMENT_ID: &str = "templatePicks";

/// Separator between pick ids in the picks comment.
pub const PUBLIC_ID_SEP: &str = " ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Amplitude {
    pub value: f64,
    /// Amplitude type, e.g. "MLx".
    pub kind: String,
    pub unit: String,
    pub time_window: TimeWindow,
    pub waveform_stream_id: String,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Snafu)]
pub enum AmplitudeError {
    #[snafu(display("no waveform data available for {stream_id}"))]
    NoWaveformData { stream_id: String },

    #[snafu(display("no amplitudes to combine"))]
    NothingToCombine,
}

/// Computes one amplitude for a detection.
pub trait AmplitudeProcessor {
    fn compute(&self, detection: &Detection) -> Result<Amplitude, AmplitudeError>;
}

/// Reduces several per-stream amplitudes to one; `None` when the input is
/// empty.
pub type CombiningStrategy = fn(Vec<Amplitude>) -> Option<Amplitude>;

/// Keeps the largest amplitude.
pub fn combine_max(amplitudes: Vec<Amplitude>) -> Option<Amplitude> {
    amplitudes.into_iter().max_by(|a, b| {
        a.value
            .partial_cmp(&b.value)
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// Runs several underlying processors and combines their results.
///
/// Underlying failures are tolerated as long as at least one amplitude
/// remains to combine.
pub struct CombiningAmplitudeProcessor<P> {
    underlying: Vec<P>,
    combine: CombiningStrategy,
}

impl<P: AmplitudeProcessor> CombiningAmplitudeProcessor<P> {
    pub fn new(underlying: Vec<P>, combine: CombiningStrategy) -> Self {
        Self {
            underlying,
            combine,
        }
    }
}

impl<P: AmplitudeProcessor> AmplitudeProcessor for CombiningAmplitudeProcessor<P> {
    fn compute(&self, detection: &Detection) -> Result<Amplitude, AmplitudeError> {
        let amplitudes: Vec<Amplitude> = self
            .underlying
            .iter()
            .filter_map(|p| p.compute(detection).ok())
            .collect();
        (self.combine)(amplitudes).ok_or(AmplitudeError::NothingToCombine)
    }
}

/// Attach detection provenance: the owning detector's id and the catalogue
/// ids of the contributing template picks.
pub fn attach_provenance(detector_id: &str, detection: &Detection, amplitude: &mut Amplitude) {
    amplitude.comments.push(Comment {
        id: DETECTOR_ID_COMMENT_ID.into(),
        text: detector_id.into(),
    });

    let pick_ids: Vec<&str> = detection
        .template_results
        .values()
        .filter_map(|result| result.arrival.pick.public_id.as_deref())
        .collect();
    amplitude.comments.push(Comment {
        id: PICKS_COMMENT_ID.into(),
        text: pick_ids.join(PUBLIC_ID_SEP),
    });
}
