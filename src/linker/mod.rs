//! Multi-channel fusion of template results.
//!
//! The linker is a state machine over a FIFO queue of candidates. Each
//! accepted template result is merged into every compatible candidate and
//! additionally seeds a new one; candidates leave the queue by completion
//! (every registered processor contributed), by expiry with enough
//! arrivals (emitted), or by expiry without (discarded).
//!
//! Compatibility is the pick-offset test: the observed pairwise pick-time
//! offsets of a candidate must agree with the offsets predicted by the
//! template picks within the arrival-offset threshold.
//!
//! Emission happens through a callback passed into `feed`/`flush`, in
//! queue order. Callers needing pick-time order must sort downstream.

pub mod association;
pub mod merge;
pub mod pot;

pub use association::{Arrival, Association, Pick, ProcessorId, TemplateResult};
pub use merge::{MergingPredicate, MergingStrategy};
pub use pot::{CandidateOffsets, PickOffsetTable};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use snafu::{ensure, Snafu};
use tracing::debug;

use crate::clock::Clock;
use crate::processor::MatchResult;
use crate::record::duration_to_secs;
use crate::template::TemplateWaveform;

/// Floor for the arrival-offset threshold: twice the accuracy waveform
/// trimming operates at (1 µs).
pub fn arrival_offset_floor() -> Duration {
    Duration::microseconds(2)
}

#[derive(Debug, Snafu)]
pub enum LinkerConfigError {
    #[snafu(display(
        "arrival offset threshold {} s below the {} s floor",
        duration_to_secs(*threshold),
        duration_to_secs(arrival_offset_floor())
    ))]
    ArrivalOffsetBelowFloor { threshold: Duration },
}

#[derive(Debug, Clone)]
pub struct LinkerConfig {
    /// Grace period during which a candidate may accumulate arrivals.
    pub on_hold: Duration,
    /// Maximum deviation from the POT-predicted offsets; `None` disables
    /// the coherence check.
    pub arrival_offset_threshold: Option<Duration>,
    /// Minimum score for emission; `None` accepts any score and also
    /// bypasses the merging gate.
    pub association_threshold: Option<f64>,
    /// Arrivals required for emission after expiry; `None` requires the
    /// full processor set.
    pub min_arrivals: Option<usize>,
    pub merging_strategy: MergingStrategy,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            on_hold: Duration::zero(),
            arrival_offset_threshold: Some(arrival_offset_floor()),
            association_threshold: None,
            min_arrivals: None,
            merging_strategy: MergingStrategy::default(),
        }
    }
}

#[derive(Debug)]
struct ProcessorEntry {
    template: Arc<TemplateWaveform>,
    arrival: Arrival,
    merging_threshold: Option<f64>,
}

#[derive(Debug)]
struct Candidate {
    association: Association,
    expires_at: DateTime<Utc>,
}

impl Candidate {
    fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            association: Association::default(),
            expires_at,
        }
    }

    /// Insert or replace this processor's result and refresh the score.
    fn feed(&mut self, processor_id: &str, result: TemplateResult) {
        self.association
            .results
            .insert(processor_id.to_string(), result);

        let sum: f64 = self
            .association
            .results
            .values()
            .map(|r| r.coefficient())
            .sum();
        self.association.score = sum / self.association.results.len() as f64;
    }
}

#[derive(Debug)]
pub struct Linker {
    processors: BTreeMap<ProcessorId, ProcessorEntry>,
    queue: VecDeque<Candidate>,
    pot: PickOffsetTable,
    pot_valid: bool,
    on_hold: Duration,
    arrival_offset_threshold: Option<Duration>,
    association_threshold: Option<f64>,
    min_arrivals: Option<usize>,
    merging_strategy: MergingStrategy,
    clock: Arc<dyn Clock>,
}

impl Linker {
    pub fn new(config: LinkerConfig, clock: Arc<dyn Clock>) -> Result<Self, LinkerConfigError> {
        if let Some(threshold) = config.arrival_offset_threshold {
            ensure!(
                threshold >= arrival_offset_floor(),
                ArrivalOffsetBelowFloorSnafu { threshold }
            );
        }

        Ok(Self {
            processors: BTreeMap::new(),
            queue: VecDeque::new(),
            pot: PickOffsetTable::default(),
            pot_valid: false,
            on_hold: config.on_hold,
            arrival_offset_threshold: config.arrival_offset_threshold,
            association_threshold: config.association_threshold,
            min_arrivals: config.min_arrivals,
            merging_strategy: config.merging_strategy,
            clock,
        })
    }

    /// Register a processor with its template arrival. A second
    /// registration under the same id is a no-op.
    pub fn add(
        &mut self,
        processor_id: impl Into<ProcessorId>,
        template: Arc<TemplateWaveform>,
        arrival: Arrival,
        merging_threshold: Option<f64>,
    ) {
        let processor_id = processor_id.into();
        if self.processors.contains_key(&processor_id) {
            return;
        }
        self.processors.insert(
            processor_id,
            ProcessorEntry {
                template,
                arrival,
                merging_threshold,
            },
        );
        self.pot_valid = false;
    }

    /// Deregister a processor. Candidates already holding its results keep
    /// them.
    pub fn remove(&mut self, processor_id: &str) {
        if self.processors.remove(processor_id).is_some() {
            self.pot_valid = false;
        }
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Number of distinct waveform streams among the registrations.
    pub fn channel_count(&self) -> usize {
        self.processors
            .values()
            .map(|entry| entry.arrival.pick.waveform_stream_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn on_hold(&self) -> Duration {
        self.on_hold
    }

    pub fn set_on_hold(&mut self, duration: Duration) {
        self.on_hold = duration;
    }

    pub fn association_threshold(&self) -> Option<f64> {
        self.association_threshold
    }

    pub fn set_association_threshold(&mut self, threshold: Option<f64>) {
        self.association_threshold = threshold;
    }

    pub fn min_arrivals(&self) -> Option<usize> {
        self.min_arrivals
    }

    /// Values below one are treated as unset.
    pub fn set_min_arrivals(&mut self, n: Option<usize>) {
        self.min_arrivals = n.filter(|&n| n >= 1);
    }

    pub fn arrival_offset_threshold(&self) -> Option<Duration> {
        self.arrival_offset_threshold
    }

    pub fn set_arrival_offset_threshold(
        &mut self,
        threshold: Option<Duration>,
    ) -> Result<(), LinkerConfigError> {
        if let Some(threshold) = threshold {
            ensure!(
                threshold >= arrival_offset_floor(),
                ArrivalOffsetBelowFloorSnafu { threshold }
            );
        }
        self.arrival_offset_threshold = threshold;
        Ok(())
    }

    pub fn set_merging_strategy(&mut self, strategy: MergingStrategy) {
        self.merging_strategy = strategy;
    }

    /// Drop all pending candidates. Registrations stay; the POT is rebuilt
    /// lazily.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.pot_valid = false;
    }

    /// Emit every pending candidate with enough arrivals and a passing
    /// score, in queue order, then clear the queue.
    pub fn flush<F: FnMut(Association)>(&mut self, mut emit: F) {
        let min_required = self.min_arrivals.unwrap_or(self.processors.len());
        while let Some(candidate) = self.queue.pop_front() {
            if candidate.association.processor_count() >= min_required
                && self
                    .association_threshold
                    .map_or(true, |t| candidate.association.score >= t)
            {
                emit(candidate.association);
            }
        }
    }

    /// Feed one match result from `processor_id`.
    ///
    /// Every local maximum is projected into absolute event time with the
    /// processor's current pick offset and run through the merging gate;
    /// survivors drive the queue. `now` is captured once and reused for
    /// all maxima of this call.
    pub fn feed<F: FnMut(Association)>(
        &mut self,
        processor_id: &str,
        match_result: MatchResult,
        mut emit: F,
    ) {
        let Some(entry) = self.processors.get(processor_id) else {
            return;
        };

        // Recomputed per call: the template may have been reprocessed since
        // registration.
        let pick_offset = entry.arrival.pick.time - entry.template.start_time();
        let template_arrival = entry.arrival.clone();
        let merging_threshold = entry.merging_threshold;

        let now = self.clock.now();
        let match_result = Arc::new(match_result);

        for peak_index in 0..match_result.local_maxima.len() {
            let peak = match_result.local_maxima[peak_index];
            // NaN means "no match"; drop before the merging gate.
            if !peak.coefficient.is_finite() {
                continue;
            }

            let mut arrival = template_arrival.clone();
            arrival.pick.time = match_result.time_window.start + peak.lag + pick_offset;

            let result = TemplateResult {
                arrival,
                peak_index,
                match_result: Arc::clone(&match_result),
            };

            if let Some(threshold) = self.association_threshold {
                let merging = merging_threshold.unwrap_or(threshold);
                if !self.merging_strategy.accepts(&result, threshold, merging) {
                    debug!(
                        processor = processor_id,
                        coefficient = result.coefficient(),
                        "merging strategy rejected result"
                    );
                    continue;
                }
            }

            self.process(processor_id, result, now, &mut emit);
        }
    }

    fn process<F: FnMut(Association)>(
        &mut self,
        processor_id: &str,
        result: TemplateResult,
        now: DateTime<Utc>,
        emit: &mut F,
    ) {
        if self.processors.is_empty() {
            return;
        }
        if !self.pot_valid {
            self.rebuild_pot();
        }

        let processor_count = self.processors.len();
        let tolerance = self.arrival_offset_threshold;

        // Merge into every compatible candidate that is still open.
        let pot = &self.pot;
        for candidate in self.queue.iter_mut() {
            if candidate.association.processor_count() >= processor_count {
                continue;
            }

            let replace = match candidate.association.results.get(processor_id) {
                None => true,
                // Strictly greater: on ties the earlier result wins.
                Some(existing) => result.coefficient() > existing.coefficient(),
            };
            if !replace {
                continue;
            }

            if let Some(tolerance) = tolerance {
                let observed = candidate_offsets(pot, candidate, processor_id, &result);
                if !pot.validate(&observed, tolerance) {
                    debug!(
                        processor = processor_id,
                        "pick offsets incoherent, not merging into candidate"
                    );
                    continue;
                }
            }

            candidate.feed(processor_id, result.clone());
        }

        // Every accepted result also seeds its own candidate.
        let mut candidate = Candidate::new(now + self.on_hold);
        candidate.feed(processor_id, result);
        self.queue.push_back(candidate);

        // Sweep: emit what is ready, drop what expired short.
        let min_required = self.min_arrivals.unwrap_or(processor_count);
        let association_threshold = self.association_threshold;
        self.queue.retain(|candidate| {
            let count = candidate.association.processor_count();
            let ready = count == processor_count
                || (now >= candidate.expires_at && count >= min_required);
            if ready {
                if association_threshold.map_or(true, |t| candidate.association.score >= t) {
                    emit(candidate.association.clone());
                }
                return false;
            }
            if now >= candidate.expires_at {
                debug!(members = count, "dropping expired candidate");
                return false;
            }
            true
        });
    }

    fn rebuild_pot(&mut self) {
        let entries = self
            .processors
            .iter()
            .map(|(id, entry)| (id.clone(), entry.arrival.pick.time))
            .collect();
        self.pot = PickOffsetTable::new(entries);
        self.pot_valid = true;
    }
}

/// Observed pick times for validating a merge of `new_result` into
/// `candidate`: the proposal plus every member already present, everything
/// else masked out.
fn candidate_offsets(
    pot: &PickOffsetTable,
    candidate: &Candidate,
    processor_id: &str,
    new_result: &TemplateResult,
) -> CandidateOffsets {
    let pick_times = pot
        .ids()
        .iter()
        .map(|id| {
            if id.as_str() == processor_id {
                Some(new_result.arrival.pick.time)
            } else {
                candidate
                    .association
                    .results
                    .get(id)
                    .map(|r| r.arrival.pick.time)
            }
        })
        .collect();
    CandidateOffsets { pick_times }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::processor::LocalMax;
    use crate::record::TimeWindow;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn u0() -> DateTime<Utc> {
        t0() + Duration::days(30)
    }

    fn template(pick_offset: Duration) -> Arc<TemplateWaveform> {
        Arc::new(
            TemplateWaveform::new(vec![1.0, -1.0, 1.0, -1.0], 1.0, t0(), t0() + pick_offset)
                .unwrap(),
        )
    }

    fn arrival(stream_id: &str, pick_time: DateTime<Utc>) -> Arrival {
        Arrival {
            pick: Pick {
                time: pick_time,
                waveform_stream_id: stream_id.into(),
                phase_hint: Some("P".into()),
                public_id: None,
            },
            weight: None,
        }
    }

    /// Match result whose single peak projects to `pick_time` for a
    /// processor with zero pick offset.
    fn match_at(pick_time: DateTime<Utc>, coefficient: f64) -> MatchResult {
        MatchResult {
            time_window: TimeWindow::new(pick_time, pick_time + Duration::seconds(4)),
            local_maxima: vec![LocalMax {
                lag: Duration::zero(),
                coefficient,
            }],
        }
    }

    fn linker(config: LinkerConfig, clock: ManualClock) -> Linker {
        let mut linker = Linker::new(config, Arc::new(clock)).unwrap();
        // Two processors on different stations; template picks coincide
        // with the template start, so projections equal the window start
        // plus the lag.
        linker.add(
            "a",
            template(Duration::zero()),
            arrival("CH.AAA..HHZ", t0()),
            None,
        );
        linker.add(
            "b",
            template(Duration::zero()),
            arrival("CH.BBB..HHZ", t0() + Duration::seconds(2)),
            None,
        );
        linker
    }

    fn collect(emissions: &mut Vec<Association>) -> impl FnMut(Association) + '_ {
        move |association| emissions.push(association)
    }

    #[test]
    fn threshold_below_floor_is_rejected() {
        let config = LinkerConfig {
            arrival_offset_threshold: Some(Duration::microseconds(1)),
            ..LinkerConfig::default()
        };
        let clock = ManualClock::new(u0());
        assert!(matches!(
            Linker::new(config, Arc::new(clock)),
            Err(LinkerConfigError::ArrivalOffsetBelowFloor { .. })
        ));
    }

    #[test]
    fn consistent_two_channel_association_completes() {
        crate::tracing_init::init_test_tracing();
        let clock = ManualClock::new(u0());
        let mut linker = linker(
            LinkerConfig {
                on_hold: Duration::seconds(10),
                arrival_offset_threshold: Some(Duration::milliseconds(1)),
                association_threshold: Some(0.5),
                min_arrivals: Some(2),
                ..LinkerConfig::default()
            },
            clock,
        );

        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), 0.9), collect(&mut emissions));
        assert!(emissions.is_empty());

        // The b projection adds its 2 s pick offset on top of the window
        // start, landing exactly on the POT-expected offset.
        linker.feed("b", match_at(u0(), 0.8), collect(&mut emissions));
        assert_eq!(emissions.len(), 1);
        let association = &emissions[0];
        assert_eq!(association.processor_count(), 2);
        assert!((association.score - 0.85).abs() < 1e-12);

        // The leftover seed candidate is below min_arrivals and never
        // emitted.
        emissions.clear();
        linker.flush(collect(&mut emissions));
        assert!(emissions.is_empty());
    }

    #[test]
    fn incoherent_offsets_do_not_associate() {
        let clock = ManualClock::new(u0());
        let mut linker = linker(
            LinkerConfig {
                on_hold: Duration::seconds(10),
                arrival_offset_threshold: Some(Duration::milliseconds(1)),
                association_threshold: Some(0.5),
                min_arrivals: Some(2),
                ..LinkerConfig::default()
            },
            clock,
        );

        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), 0.9), collect(&mut emissions));
        // Half a second late relative to the template offsets.
        linker.feed(
            "b",
            match_at(u0() + Duration::milliseconds(500), 0.8),
            collect(&mut emissions),
        );
        assert!(emissions.is_empty());
    }

    #[test]
    fn disabled_pot_check_associates_anything() {
        let clock = ManualClock::new(u0());
        let mut linker = linker(
            LinkerConfig {
                on_hold: Duration::seconds(10),
                arrival_offset_threshold: None,
                association_threshold: Some(0.5),
                min_arrivals: Some(2),
                ..LinkerConfig::default()
            },
            clock,
        );

        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), 0.9), collect(&mut emissions));
        linker.feed(
            "b",
            match_at(u0() + Duration::milliseconds(500), 0.8),
            collect(&mut emissions),
        );
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].processor_count(), 2);
    }

    #[test]
    fn replacement_is_monotonic_and_seeds_stay_separate() {
        let clock = ManualClock::new(u0());
        let mut linker = linker(
            LinkerConfig {
                on_hold: Duration::seconds(60),
                association_threshold: Some(0.5),
                ..LinkerConfig::default()
            },
            clock,
        );

        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), 0.6), collect(&mut emissions));
        assert_eq!(linker.queue.len(), 1);
        assert!((linker.queue[0].association.score - 0.6).abs() < 1e-12);

        // Same window, better peak: the stored coefficient is replaced and
        // the result additionally seeds its own candidate.
        linker.feed("a", match_at(u0(), 0.8), collect(&mut emissions));
        assert_eq!(linker.queue.len(), 2);
        assert!((linker.queue[0].association.score - 0.8).abs() < 1e-12);
        assert!((linker.queue[1].association.score - 0.8).abs() < 1e-12);

        // A weaker repeat never lowers a stored coefficient.
        linker.feed("a", match_at(u0(), 0.7), collect(&mut emissions));
        assert!((linker.queue[0].association.score - 0.8).abs() < 1e-12);
        assert!((linker.queue[1].association.score - 0.8).abs() < 1e-12);
        assert!((linker.queue[2].association.score - 0.7).abs() < 1e-12);

        assert!(emissions.is_empty());
    }

    #[test]
    fn nan_coefficients_are_dropped() {
        let clock = ManualClock::new(u0());
        let mut linker = linker(LinkerConfig::default(), clock);

        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), f64::NAN), collect(&mut emissions));
        assert!(linker.queue.is_empty());
        assert!(emissions.is_empty());
    }

    #[test]
    fn flush_emits_partial_candidates() {
        let clock = ManualClock::new(u0());
        let mut linker = linker(
            LinkerConfig {
                on_hold: Duration::seconds(60),
                association_threshold: None,
                min_arrivals: Some(1),
                ..LinkerConfig::default()
            },
            clock,
        );

        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), 0.4), collect(&mut emissions));
        assert!(emissions.is_empty());

        linker.flush(collect(&mut emissions));
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].processor_count(), 1);
        assert!(linker.queue.is_empty());
    }

    #[test]
    fn reset_then_flush_emits_nothing() {
        let clock = ManualClock::new(u0());
        let mut linker = linker(
            LinkerConfig {
                on_hold: Duration::seconds(60),
                min_arrivals: Some(1),
                ..LinkerConfig::default()
            },
            clock,
        );

        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), 0.9), collect(&mut emissions));
        linker.reset();
        linker.flush(collect(&mut emissions));
        assert!(emissions.is_empty());
    }

    #[test]
    fn expired_candidates_emit_in_fifo_order_or_drop() {
        let clock = ManualClock::new(u0());
        let handle = clock.clone();
        let mut linker = linker(
            LinkerConfig {
                on_hold: Duration::seconds(1),
                arrival_offset_threshold: Some(Duration::milliseconds(1)),
                association_threshold: Some(0.5),
                min_arrivals: Some(1),
                ..LinkerConfig::default()
            },
            clock,
        );

        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), 0.9), collect(&mut emissions));
        // Incoherent with the first candidate, so it only seeds its own.
        linker.feed(
            "b",
            match_at(u0() + Duration::milliseconds(500), 0.8),
            collect(&mut emissions),
        );
        assert!(emissions.is_empty());

        // Past expiry both candidates have one arrival each, which meets
        // min_arrivals; the next feed sweeps them out in queue order.
        handle.advance(Duration::seconds(5));
        linker.feed("a", match_at(u0() + Duration::seconds(30), 0.6), collect(&mut emissions));
        assert_eq!(emissions.len(), 2);
        assert!(emissions[0].results.contains_key("a"));
        assert!((emissions[0].score - 0.9).abs() < 1e-12);
        assert!(emissions[1].results.contains_key("b"));
        assert!((emissions[1].score - 0.8).abs() < 1e-12);
    }

    #[test]
    fn expired_candidates_below_min_arrivals_are_discarded() {
        let clock = ManualClock::new(u0());
        let handle = clock.clone();
        let mut linker = linker(
            LinkerConfig {
                on_hold: Duration::seconds(1),
                arrival_offset_threshold: Some(Duration::milliseconds(1)),
                association_threshold: Some(0.5),
                min_arrivals: Some(2),
                ..LinkerConfig::default()
            },
            clock,
        );

        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), 0.9), collect(&mut emissions));
        linker.feed(
            "b",
            match_at(u0() + Duration::milliseconds(500), 0.8),
            collect(&mut emissions),
        );

        handle.advance(Duration::seconds(5));
        linker.feed("a", match_at(u0() + Duration::seconds(30), 0.6), collect(&mut emissions));
        assert!(emissions.is_empty());
        // Only the candidate seeded by the sweeping feed remains.
        assert_eq!(linker.queue.len(), 1);
    }

    #[test]
    fn unknown_processor_is_ignored() {
        let clock = ManualClock::new(u0());
        let mut linker = linker(LinkerConfig::default(), clock);

        let mut emissions = Vec::new();
        linker.feed("zz", match_at(u0(), 0.9), collect(&mut emissions));
        assert!(linker.queue.is_empty());
    }

    #[test]
    fn min_arrivals_below_one_is_unset() {
        let clock = ManualClock::new(u0());
        let mut linker = linker(LinkerConfig::default(), clock);
        linker.set_min_arrivals(Some(0));
        assert_eq!(linker.min_arrivals(), None);
        linker.set_min_arrivals(Some(2));
        assert_eq!(linker.min_arrivals(), Some(2));
    }

    #[test]
    fn removing_a_processor_shrinks_the_pot() {
        let clock = ManualClock::new(u0());
        let mut linker = linker(
            LinkerConfig {
                on_hold: Duration::seconds(10),
                association_threshold: Some(0.5),
                ..LinkerConfig::default()
            },
            clock,
        );
        assert_eq!(linker.processor_count(), 2);
        assert_eq!(linker.channel_count(), 2);

        linker.remove("b");
        assert_eq!(linker.processor_count(), 1);

        // With a single registered processor a result completes at once.
        let mut emissions = Vec::new();
        linker.feed("a", match_at(u0(), 0.9), collect(&mut emissions));
        assert_eq!(emissions.len(), 1);
    }
}
