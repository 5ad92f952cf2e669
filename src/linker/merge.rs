//! Merging strategies.
//!
//! The merging strategy is the cheap gate a freshly projected template
//! result must pass before any queue or POT work happens. Strategies are a
//! plain enum dispatched on the hot path; a function pointer variant covers
//! custom predicates without boxing.

use super::association::TemplateResult;

/// Predicate signature: `(result, association threshold, per-processor
/// merging threshold)`.
pub type MergingPredicate = fn(&TemplateResult, f64, f64) -> bool;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergingStrategy {
    /// Accept results whose coefficient reaches the association threshold.
    AboveAssociationThreshold,
    /// Accept results whose coefficient reaches the processor's merging
    /// threshold; processors without one fall back to the association
    /// threshold.
    AbovePerProcessorThreshold,
    /// Accept everything; fusion is left to the POT check and the
    /// association threshold at emission.
    All,
    Custom(MergingPredicate),
}

impl MergingStrategy {
    pub fn accepts(
        &self,
        result: &TemplateResult,
        association_threshold: f64,
        merging_threshold: f64,
    ) -> bool {
        match self {
            MergingStrategy::AboveAssociationThreshold => {
                result.coefficient() >= association_threshold
            }
            MergingStrategy::AbovePerProcessorThreshold => {
                result.coefficient() >= merging_threshold
            }
            MergingStrategy::All => true,
            MergingStrategy::Custom(predicate) => {
                predicate(result, association_threshold, merging_threshold)
            }
        }
    }
}

impl Default for MergingStrategy {
    fn default() -> Self {
        MergingStrategy::AboveAssociationThreshold
    }
}
