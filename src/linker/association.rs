//! Association vocabulary shared between the linker and the detector.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::processor::MatchResult;

/// Identifier of a registered template waveform processor.
pub type ProcessorId = String;

/// A timestamp on a waveform stream marking a phase arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct Pick {
    pub time: DateTime<Utc>,
    /// Waveform stream identifier (NET.STA.LOC.CHA).
    pub waveform_stream_id: String,
    pub phase_hint: Option<String>,
    /// Identifier of the pick in an external catalogue, if any; carried for
    /// provenance.
    pub public_id: Option<String>,
}

/// A pick bound to one template waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub pick: Pick,
    pub weight: Option<f64>,
}

/// One correlation peak projected into absolute event time.
///
/// Holds on to the `MatchResult` it came from; the peak is addressed by
/// index so the backing list can be shared freely.
#[derive(Debug, Clone)]
pub struct TemplateResult {
    /// Template arrival with `pick.time` replaced by the projection
    /// `window.start + lag + pick offset`.
    pub arrival: Arrival,
    /// Index of the originating peak in `match_result.local_maxima`.
    pub peak_index: usize,
    pub match_result: Arc<MatchResult>,
}

impl TemplateResult {
    pub fn coefficient(&self) -> f64 {
        self.match_result.local_maxima[self.peak_index].coefficient
    }
}

/// A finalised grouping of template results believed to belong to one
/// event.
#[derive(Debug, Clone, Default)]
pub struct Association {
    /// Mean of the member coefficients.
    pub score: f64,
    /// At most one result per processor.
    pub results: BTreeMap<ProcessorId, TemplateResult>,
}

impl Association {
    pub fn processor_count(&self) -> usize {
        self.results.len()
    }
}
