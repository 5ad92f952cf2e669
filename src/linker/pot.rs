//! Pick-offset table.
//!
//! The POT holds the expected pairwise arrival-time offsets derived from
//! the template picks of all registered processors. A candidate is coherent
//! when its observed pairwise offsets deviate from the expected ones by at
//! most the arrival-offset threshold.
//!
//! Only the upper triangle is stored; `offset(j, i) = -offset(i, j)` by
//! construction, which keeps the antisymmetry exact in integer nanoseconds.
//! The reference table is always fully enabled; masking happens per
//! candidate projection, where processors absent from the candidate carry
//! no pick and are skipped entirely. A single-member projection therefore
//! validates trivially.
//!
//! The table is rebuilt from scratch whenever the processor set changes.
//! Processor counts are small and changes are rare, so no incremental
//! maintenance is attempted.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::association::ProcessorId;

#[derive(Debug, Clone, Default)]
pub struct PickOffsetTable {
    ids: Vec<ProcessorId>,
    index: BTreeMap<ProcessorId, usize>,
    /// Upper triangle, row-major: entry for (i, j) with i < j.
    offsets: Vec<Duration>,
}

/// Observed pick times of a candidate projection, aligned with the table's
/// processor order. `None` masks a processor out of the validation.
#[derive(Debug, Clone)]
pub struct CandidateOffsets {
    pub pick_times: Vec<Option<DateTime<Utc>>>,
}

impl PickOffsetTable {
    /// Build the table from `(processor id, template pick time)` entries.
    pub fn new(mut entries: Vec<(ProcessorId, DateTime<Utc>)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let ids: Vec<ProcessorId> = entries.iter().map(|(id, _)| id.clone()).collect();
        let index = ids
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        let n = entries.len();
        let mut offsets = Vec::with_capacity(n * n.saturating_sub(1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                offsets.push(entries[j].1 - entries[i].1);
            }
        }

        Self {
            ids,
            index,
            offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Processor ids in table order.
    pub fn ids(&self) -> &[ProcessorId] {
        &self.ids
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Expected offset `pick[j] - pick[i]`; antisymmetric, zero on the
    /// diagonal.
    pub fn offset(&self, i: usize, j: usize) -> Duration {
        match i.cmp(&j) {
            std::cmp::Ordering::Less => self.offsets[self.triangle_index(i, j)],
            std::cmp::Ordering::Equal => Duration::zero(),
            std::cmp::Ordering::Greater => -self.offsets[self.triangle_index(j, i)],
        }
    }

    fn triangle_index(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < j && j < self.len());
        let n = self.len();
        i * n - i * (i + 1) / 2 + (j - i - 1)
    }

    /// Whether every enabled pair of `observed` deviates from its expected
    /// offset by at most `tolerance`. Short-circuits on the first
    /// violation.
    pub fn validate(&self, observed: &CandidateOffsets, tolerance: Duration) -> bool {
        debug_assert_eq!(observed.pick_times.len(), self.len());

        for i in 0..self.len() {
            let Some(pick_i) = observed.pick_times[i] else {
                continue;
            };
            for j in (i + 1)..self.len() {
                let Some(pick_j) = observed.pick_times[j] else {
                    continue;
                };
                let deviation = (pick_j - pick_i) - self.offset(i, j);
                if deviation > tolerance || deviation < -tolerance {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn table() -> PickOffsetTable {
        PickOffsetTable::new(vec![
            ("a".into(), t0()),
            ("b".into(), t0() + Duration::seconds(2)),
            ("c".into(), t0() + Duration::milliseconds(3500)),
        ])
    }

    #[test]
    fn offsets_are_antisymmetric() {
        let pot = table();
        for i in 0..pot.len() {
            for j in 0..pot.len() {
                assert_eq!(
                    pot.offset(i, j) + pot.offset(j, i),
                    Duration::zero(),
                    "({i}, {j})"
                );
            }
        }
        assert_eq!(pot.offset(0, 1), Duration::seconds(2));
        assert_eq!(pot.offset(2, 0), -Duration::milliseconds(3500));
    }

    #[test]
    fn consistent_offsets_validate() {
        let pot = table();
        let u0 = t0() + Duration::days(30);
        let observed = CandidateOffsets {
            pick_times: vec![
                Some(u0),
                Some(u0 + Duration::seconds(2)),
                Some(u0 + Duration::milliseconds(3500)),
            ],
        };
        assert!(pot.validate(&observed, Duration::microseconds(2)));
    }

    #[test]
    fn deviating_pair_fails() {
        let pot = table();
        let u0 = t0() + Duration::days(30);
        let observed = CandidateOffsets {
            pick_times: vec![
                Some(u0),
                Some(u0 + Duration::milliseconds(2500)),
                Some(u0 + Duration::milliseconds(3500)),
            ],
        };
        assert!(!pot.validate(&observed, Duration::milliseconds(1)));
        // A wide enough tolerance accepts the same picks.
        assert!(pot.validate(&observed, Duration::seconds(1)));
    }

    #[test]
    fn masked_processors_are_skipped() {
        let pot = table();
        let u0 = t0() + Duration::days(30);
        // "b" deviates wildly but is masked out.
        let observed = CandidateOffsets {
            pick_times: vec![
                Some(u0),
                None,
                Some(u0 + Duration::milliseconds(3500)),
            ],
        };
        assert!(pot.validate(&observed, Duration::microseconds(2)));
    }

    #[test]
    fn single_member_validates_trivially() {
        let pot = table();
        let observed = CandidateOffsets {
            pick_times: vec![None, Some(t0()), None],
        };
        assert!(pot.validate(&observed, Duration::zero()));
    }

    #[test]
    fn tolerance_is_inclusive() {
        let pot = PickOffsetTable::new(vec![
            ("a".into(), t0()),
            ("b".into(), t0() + Duration::seconds(1)),
        ]);
        let u0 = t0() + Duration::days(1);
        let observed = CandidateOffsets {
            pick_times: vec![
                Some(u0),
                Some(u0 + Duration::seconds(1) + Duration::microseconds(2)),
            ],
        };
        assert!(pot.validate(&observed, Duration::microseconds(2)));
        assert!(!pot.validate(&observed, Duration::microseconds(1)));
    }
}
